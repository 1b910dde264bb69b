use crate::error::AuthError;
use crate::types::{RefreshedToken, VerifiedSession};
use async_trait::async_trait;
use thiserror::Error;

/// What went wrong in an auth API call, decided by the API layer from the
/// status code and the tagged `error` body. Callers match on this, never on
/// message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthApiErrorKind {
    InvalidIdentifier,
    InvalidCode,
    CodeExpired,
    /// The credential presented was refused (401/403, revoked refresh token).
    Rejected,
    RateLimited,
    /// Network failure, timeout or 5xx; safe to retry.
    Transient,
    /// The server answered with something we could not read.
    Protocol,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct AuthApiError {
    pub kind: AuthApiErrorKind,
    pub message: String,
}

impl AuthApiError {
    pub fn new(kind: AuthApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(AuthApiErrorKind::Transient, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(AuthApiErrorKind::Rejected, message)
    }

    /// Classifies an HTTP failure from any API the app talks to. `error_tag`
    /// is the `error` field of the response body, when present.
    pub fn from_status(status: u16, error_tag: Option<&str>) -> Self {
        let kind = match error_tag.map(str::trim) {
            Some("invalid_identifier") => AuthApiErrorKind::InvalidIdentifier,
            Some("invalid_code") => AuthApiErrorKind::InvalidCode,
            Some("code_expired") => AuthApiErrorKind::CodeExpired,
            Some("invalid_grant") | Some("token_revoked") | Some("token_expired") => {
                AuthApiErrorKind::Rejected
            }
            _ => map_http_status(status),
        };
        Self::new(kind, format!("auth api error ({status})"))
    }

    pub fn is_auth_failure(&self) -> bool {
        self.kind == AuthApiErrorKind::Rejected
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == AuthApiErrorKind::Transient
    }

    /// Whether a failed `/auth/refresh` means the refresh token is dead.
    /// Only transport trouble, throttling and unreadable replies leave it usable.
    pub fn invalidates_refresh_token(&self) -> bool {
        !matches!(
            self.kind,
            AuthApiErrorKind::Transient | AuthApiErrorKind::RateLimited | AuthApiErrorKind::Protocol
        )
    }
}

fn map_http_status(status_code: u16) -> AuthApiErrorKind {
    match status_code {
        401 | 403 => AuthApiErrorKind::Rejected,
        410 => AuthApiErrorKind::CodeExpired,
        400 | 422 => AuthApiErrorKind::InvalidCode,
        429 => AuthApiErrorKind::RateLimited,
        408 | 500..=599 => AuthApiErrorKind::Transient,
        _ => AuthApiErrorKind::Protocol,
    }
}

impl From<AuthApiError> for AuthError {
    fn from(err: AuthApiError) -> Self {
        match err.kind {
            AuthApiErrorKind::InvalidIdentifier => AuthError::InvalidIdentifier,
            AuthApiErrorKind::InvalidCode => AuthError::InvalidCode,
            AuthApiErrorKind::CodeExpired => AuthError::CodeExpired,
            AuthApiErrorKind::Rejected => AuthError::Rejected,
            AuthApiErrorKind::RateLimited => AuthError::RateLimited,
            AuthApiErrorKind::Transient => AuthError::Network(err.message),
            AuthApiErrorKind::Protocol => AuthError::Protocol(err.message),
        }
    }
}

/// The external authentication API.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn request_code(&self, identifier: &str) -> Result<(), AuthApiError>;

    async fn verify_code(&self, identifier: &str, code: &str)
        -> Result<VerifiedSession, AuthApiError>;

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, AuthApiError>;
}
