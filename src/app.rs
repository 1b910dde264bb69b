//! Process-wide wiring of session, connection and lifecycle.

use crate::clock::{Clock, SystemClock};
use crate::connection::{ConnectionConfig, ConnectionManager, Transport, WebSocketTransport};
use crate::error::StartError;
use crate::lifecycle::{spawn_lifecycle_bridge, LifecycleSource};
use crate::observer::ListenerId;
use crate::session::{AuthApi, HttpAuthApi, SessionConfig, SessionManager};
use crate::settings::Settings;
use crate::store::CredentialStore;
use crate::types::SessionState;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::info;

/// Keeps the realtime connection in step with the session: connect once
/// signed in, disconnect when the session ends or expires.
fn follow_session(session: &SessionManager, connection: &ConnectionManager) -> ListenerId {
    let connection = connection.clone();
    session.add_listener(move |change| {
        match change.current {
            SessionState::Authenticated if !change.previous.is_signed_in() => {
                connection.request_connect();
            }
            SessionState::Expired | SessionState::Unauthenticated => {
                connection.request_disconnect();
            }
            _ => {}
        }
        Ok(())
    })
}

/// The single owner of the session and connection managers. Built once at
/// application start and passed by handle; torn down by [`shutdown`].
///
/// [`shutdown`]: SessionCore::shutdown
pub struct SessionCore {
    session: SessionManager,
    connection: ConnectionManager,
    lifecycle: LifecycleSource,
    session_listener: ListenerId,
    bridge: Mutex<Option<JoinHandle<()>>>,
}

impl SessionCore {
    /// Builds the production stack from settings and restores any persisted
    /// session.
    pub async fn start(
        settings: &Settings,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self, StartError> {
        let api = HttpAuthApi::new(&settings.auth_base_url()?, settings.network_timeout())?;
        let transport = WebSocketTransport::new(settings.realtime_url()?);
        Ok(Self::start_with(
            settings.session_config()?,
            settings.connection_config()?,
            store,
            Arc::new(api),
            Arc::new(transport),
            Arc::new(SystemClock),
        )
        .await)
    }

    pub async fn start_with(
        session_config: SessionConfig,
        connection_config: ConnectionConfig,
        store: Arc<dyn CredentialStore>,
        api: Arc<dyn AuthApi>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let session = SessionManager::new(session_config, store, api, clock.clone());
        let connection = ConnectionManager::spawn(
            connection_config,
            transport,
            Arc::new(session.clone()),
            clock,
        );
        let session_listener = follow_session(&session, &connection);

        let lifecycle = LifecycleSource::new();
        let bridge = spawn_lifecycle_bridge(&lifecycle, session.clone(), connection.clone());

        let restored = session.restore().await;
        info!(state = ?restored, "session core started");

        Self {
            session,
            connection,
            lifecycle,
            session_listener,
            bridge: Mutex::new(Some(bridge)),
        }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn lifecycle(&self) -> &LifecycleSource {
        &self.lifecycle
    }

    /// Stops every background task. The core is inert afterwards.
    pub async fn shutdown(&self) {
        self.session.remove_listener(self.session_listener);
        let bridge = self
            .bridge
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(bridge) = bridge {
            bridge.abort();
        }
        self.connection.shutdown().await;
        self.session.shutdown().await;
        info!("session core stopped");
    }
}
