//! Foreground/background signal from the host.

use crate::connection::ConnectionManager;
use crate::session::SessionManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppLifecycle {
    Foreground,
    Background,
}

/// Latest lifecycle state, published by the host adapter. Starts in
/// foreground.
#[derive(Clone)]
pub struct LifecycleSource {
    tx: Arc<watch::Sender<AppLifecycle>>,
}

impl Default for LifecycleSource {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleSource {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(AppLifecycle::Foreground);
        Self { tx: Arc::new(tx) }
    }

    /// Repeated values are swallowed.
    pub fn set(&self, next: AppLifecycle) {
        self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    pub fn current(&self) -> AppLifecycle {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AppLifecycle> {
        self.tx.subscribe()
    }
}

/// Forwards lifecycle changes: foreground records session activity, then
/// lets the connection resume; background suspends reconnection.
pub fn spawn_lifecycle_bridge(
    source: &LifecycleSource,
    session: SessionManager,
    connection: ConnectionManager,
) -> JoinHandle<()> {
    let mut rx = source.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let current = *rx.borrow_and_update();
            debug!(lifecycle = ?current, "lifecycle changed");
            match current {
                AppLifecycle::Foreground => {
                    if let Err(e) = session.update_last_activity().await {
                        info!(error = %e, "session not resumed on foreground");
                    }
                    connection.set_foreground(true);
                }
                AppLifecycle::Background => connection.set_foreground(false),
            }
        }
    })
}
