use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
    Expired,
}

impl SessionState {
    /// True while a credential is held and has not been declared dead.
    pub fn is_signed_in(self) -> bool {
        matches!(self, Self::Authenticated | Self::Refreshing)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStateChange {
    pub previous: SessionState,
    pub current: SessionState,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub onboarding_step: u32,
}

/// The authentication credential held by the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub bearer_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
}

/// Result of a successful one-time-code exchange.
#[derive(Debug, Clone)]
pub struct VerifiedSession {
    pub bearer_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
    pub user: UserRecord,
}

/// Result of a successful token refresh. `refresh_token` is only present when
/// the server rotated it.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub bearer_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InAppMessage {
    pub sender_id: String,
    pub content: String,
    pub sender_name: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sender_name: Option<String>,
}

impl InboundFrame {
    pub const KIND_MESSAGE: &'static str = "message";

    pub fn message(sender_id: &str, content: &str, sender_name: Option<&str>) -> Self {
        Self {
            kind: Self::KIND_MESSAGE.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            sender_name: sender_name.map(|s| s.to_string()),
        }
    }

    /// Converts a `message` frame into an [`InAppMessage`]. Other frame kinds
    /// and frames without a sender yield `None`.
    pub fn into_message(self, received_at: DateTime<Utc>) -> Option<InAppMessage> {
        if self.kind != Self::KIND_MESSAGE {
            return None;
        }
        let sender_id = self.sender_id.trim();
        if sender_id.is_empty() {
            return None;
        }
        let sender_name = self
            .sender_name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Some(InAppMessage {
            sender_id: sender_id.to_string(),
            content: self.content,
            sender_name,
            received_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    pub content: String,
}

impl OutboundFrame {
    pub fn message(recipient_id: &str, content: &str) -> Self {
        Self {
            kind: "message".to_string(),
            recipient_id: Some(recipient_id.to_string()),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Sent,
    Queued,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IpcResult<T> {
    Ok { ok: bool, value: T },
    Err { ok: bool, error: IpcError },
}

impl<T> IpcResult<T> {
    pub fn ok(value: T) -> Self {
        Self::Ok { ok: true, value }
    }

    pub fn err(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Err {
            ok: false,
            error: IpcError {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}
