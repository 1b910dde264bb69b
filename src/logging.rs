use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "TETHER_LOG";

const DEFAULT_DIRECTIVE: &str = "info";

fn env_filter(raw: Option<&str>) -> EnvFilter {
    raw.and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Installs the global fmt subscriber. Calling it again is harmless.
pub fn init() {
    let raw = std::env::var(LOG_ENV).ok();
    let _ = tracing_subscriber::registry()
        .with(env_filter(raw.as_deref()))
        .with(fmt::layer().with_target(true))
        .try_init();
}
