pub mod app;
pub mod clock;
pub mod connection;
pub mod error;
#[cfg(feature = "tauri-host")]
pub mod host;
pub mod lifecycle;
pub mod logging;
pub mod observer;
mod redact;
pub mod session;
pub mod settings;
pub mod store;
#[cfg(test)]
mod test_support;
pub mod types;

pub use app::SessionCore;
pub use connection::{ConnectionConfig, ConnectionManager};
pub use lifecycle::{AppLifecycle, LifecycleSource};
pub use session::{SessionConfig, SessionManager};
pub use settings::Settings;
