use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Reconnect delay schedule: `base * multiplier^attempt`, capped at
/// `max_delay`, optionally spread by `jitter_ratio` in both directions.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (0-based) without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exponent = attempt.min(64) as i32;
        let raw = base_ms * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(raw.min(max_ms) as u64)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        if self.jitter_ratio <= 0.0 {
            return self.nominal_delay(attempt);
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        self.delay_with_nanos(attempt, nanos)
    }

    fn delay_with_nanos(&self, attempt: u32, nanos: u32) -> Duration {
        let nominal_ms = self.nominal_delay(attempt).as_millis() as f64;
        let frac = f64::from(nanos % 1000) / 1000.0;
        let delta = (frac * 2.0 - 1.0) * (nominal_ms * self.jitter_ratio.min(1.0));
        let max_ms = self.max_delay.as_millis() as f64;
        Duration::from_millis((nominal_ms + delta).clamp(0.0, max_ms) as u64)
    }
}
