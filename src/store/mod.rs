//! Durable key/value persistence for credential fields.

mod memory;
mod secret_store;

pub use memory::MemoryCredentialStore;
pub use secret_store::{KeyringCredentialStore, KEYRING_SERVICE};

use crate::error::StorageError;
use async_trait::async_trait;

pub const KEY_BEARER_TOKEN: &str = "bearerToken";
pub const KEY_REFRESH_TOKEN: &str = "refreshToken";
pub const KEY_EXPIRES_AT: &str = "expiresAt";
pub const KEY_REFRESH_EXPIRES_AT: &str = "refreshExpiresAt";
pub const KEY_USER_DATA: &str = "userData";
pub const KEY_LAST_ACTIVITY_AT: &str = "lastActivityAt";

/// Removal order on sign-out: tokens first so a partial failure never leaves
/// an authenticated-looking record behind.
pub const CREDENTIAL_KEYS: [&str; 6] = [
    KEY_BEARER_TOKEN,
    KEY_REFRESH_TOKEN,
    KEY_EXPIRES_AT,
    KEY_REFRESH_EXPIRES_AT,
    KEY_LAST_ACTIVITY_AT,
    KEY_USER_DATA,
];

/// Each call is individually atomic; there is no multi-key transaction.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}
