//! Authenticated realtime connection with automatic reconnection.
//!
//! ```text
//! Disconnected --connect--> Connecting --handshake ok--> Connected
//!                               │                           │
//!                               └── failure ──> Reconnecting <── channel lost
//!                                                   │  (backoff timer, foreground only)
//!                                                   └──────────> Connecting
//! ```
//!
//! [`ConnectionManager`] is a cheap handle; the channel itself is owned by a
//! driver task that receives commands over a channel.

mod backoff;
mod driver;
mod outbox;
mod transport;

pub use backoff::BackoffPolicy;
pub use transport::{Channel, Transport, WebSocketTransport};

use crate::clock::Clock;
use crate::error::{ConnectionError, ListenerError, SessionError};
use crate::observer::{ListenerId, Subject};
use crate::session::{AuthApiError, SessionManager};
use crate::types::{ConnectionState, InAppMessage, OutboundFrame, SendStatus};
use async_trait::async_trait;
use driver::Driver;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub backoff: BackoffPolicy,
    /// Bounds transport open plus handshake.
    pub handshake_timeout: Duration,
    pub outbound_queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            handshake_timeout: Duration::from_secs(15),
            outbound_queue_capacity: 100,
        }
    }
}

/// Where the connection gets its bearer token, and where it reports a
/// handshake the server refused.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn bearer_token(&self) -> Result<String, SessionError>;
    async fn report_unauthorized(&self);
}

#[async_trait]
impl TokenSource for SessionManager {
    async fn bearer_token(&self) -> Result<String, SessionError> {
        self.get_bearer_token().await
    }

    async fn report_unauthorized(&self) {
        self.handle_auth_error(&AuthApiError::rejected("realtime handshake refused"))
            .await;
    }
}

pub(crate) type ConnectResponder = oneshot::Sender<Result<(), ConnectionError>>;

pub(crate) enum Command {
    Connect {
        respond_to: Option<ConnectResponder>,
    },
    Disconnect {
        respond_to: Option<oneshot::Sender<()>>,
    },
    Send {
        frame: OutboundFrame,
        respond_to: oneshot::Sender<SendStatus>,
    },
    Lifecycle(bool),
    Shutdown,
}

#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    messages: Arc<Subject<InAppMessage>>,
    state_observers: Arc<Subject<ConnectionState>>,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectionManager {
    /// Starts the driver task on the current tokio runtime.
    pub fn spawn(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let messages = Arc::new(Subject::new("messages"));
        let state_observers = Arc::new(Subject::new("connection"));

        let driver = Driver::new(
            config,
            transport,
            tokens,
            clock,
            state_tx,
            state_observers.clone(),
            messages.clone(),
        );
        let handle = tokio::spawn(driver.run(rx));

        Self {
            commands,
            state,
            messages,
            state_observers,
            driver: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Resolves once the attempt has an outcome. Already connected or
    /// connecting is a no-op that shares the current outcome.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect {
                respond_to: Some(tx),
            })
            .map_err(|_| ConnectionError::ShutDown)?;
        rx.await.map_err(|_| ConnectionError::ShutDown)?
    }

    /// Fire-and-forget [`connect`](Self::connect), safe to call from a
    /// synchronous observer.
    pub fn request_connect(&self) {
        if self.commands.send(Command::Connect { respond_to: None }).is_err() {
            debug!("connect requested after shutdown");
        }
    }

    /// Closes the channel and cancels any pending reconnect. Idempotent.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Disconnect {
                respond_to: Some(tx),
            })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub fn request_disconnect(&self) {
        if self
            .commands
            .send(Command::Disconnect { respond_to: None })
            .is_err()
        {
            debug!("disconnect requested after shutdown");
        }
    }

    /// Sends now when connected, otherwise queues for the next connect.
    pub async fn send(&self, frame: OutboundFrame) -> Result<SendStatus, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                frame,
                respond_to: tx,
            })
            .map_err(|_| ConnectionError::ShutDown)?;
        rx.await.map_err(|_| ConnectionError::ShutDown)
    }

    pub fn set_foreground(&self, foreground: bool) {
        let _ = self.commands.send(Command::Lifecycle(foreground));
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    pub fn get_connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Registers a receiver of inbound messages. Delivery is synchronous on
    /// the driver task; a slow listener delays every other one.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&InAppMessage) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.messages.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.messages.remove_listener(id)
    }

    pub fn add_state_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionState) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.state_observers.add_listener(listener)
    }

    pub fn remove_state_listener(&self, id: ListenerId) -> bool {
        self.state_observers.remove_listener(id)
    }

    /// Closes the channel, cancels timers and waits for the driver to exit.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
