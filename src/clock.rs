use chrono::{DateTime, Utc};

/// Wall-clock source. Credential expiry is server-issued wall time, so the
/// session policy reads time through this seam instead of `Utc::now()`.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
