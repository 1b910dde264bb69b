use crate::types::SessionState;
use thiserror::Error;

/// Failure reading or writing persisted credential fields.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("credential storage is unavailable: {0}")]
    Unavailable(String),
    #[error("stored value for `{key}` is unreadable")]
    Corrupt { key: String },
}

/// Classified failures of the sign-in and code verification flow.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("identifier must be a phone number in international format or an e-mail address")]
    InvalidIdentifier,
    #[error("verification code is not valid")]
    InvalidCode,
    #[error("verification code has expired")]
    CodeExpired,
    #[error("authentication rejected by server")]
    Rejected,
    #[error("too many attempts, try again later")]
    RateLimited,
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected response from auth server: {0}")]
    Protocol(String),
    #[error("`{operation}` is not allowed while {state:?}")]
    InvalidState {
        state: SessionState,
        operation: &'static str,
    },
}

/// Errors surfaced by [`crate::session::SessionManager`] token operations.
///
/// `Clone` because a single refresh outcome is handed to every joined caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session expired, sign in again")]
    AuthExpired,
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("refresh token rejected by server")]
    RefreshRejected,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failures of the realtime transport. These never leave the connection
/// driver; they feed the reconnection policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport i/o error: {0}")]
    Io(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("handshake refused: unauthorized")]
    Unauthorized,
    #[error("transport timed out")]
    Timeout,
    #[error("transport closed")]
    Closed,
}

/// Errors returned to callers of [`crate::connection::ConnectionManager`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("cannot connect: {0}")]
    Session(#[from] SessionError),
    #[error("realtime service unreachable, retrying in the background")]
    Unreachable,
    #[error("connect attempt cancelled by disconnect")]
    Cancelled,
    #[error("connection manager has shut down")]
    ShutDown,
}

/// A fault raised inside one observer callback.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ListenerError {
    #[error("listener failed: {0}")]
    Failed(String),
    #[error("listener panicked")]
    Panicked,
}

impl AuthError {
    /// Stable tag for the host IPC layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidIdentifier => "invalid_identifier",
            Self::InvalidCode => "invalid_code",
            Self::CodeExpired => "code_expired",
            Self::Rejected => "rejected",
            Self::RateLimited => "rate_limited",
            Self::Network(_) => "network",
            Self::Protocol(_) => "protocol",
            Self::InvalidState { .. } => "invalid_state",
        }
    }
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthExpired | Self::RefreshRejected => "auth_expired",
            Self::RefreshFailed(_) => "refresh_failed",
            Self::Storage(_) => "storage",
        }
    }
}

impl ConnectionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Session(e) => e.code(),
            Self::Unreachable => "unreachable",
            Self::Cancelled => "cancelled",
            Self::ShutDown => "shut_down",
        }
    }
}

/// Failure assembling a [`crate::app::SessionCore`] from settings.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Settings(#[from] crate::settings::SettingsError),
    #[error("failed to build auth client: {0}")]
    AuthClient(#[from] crate::session::AuthApiError),
}
