use super::CredentialStore;
use crate::error::StorageError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task;

pub const KEYRING_SERVICE: &str = "com.softaworks.tether";

fn map_keyring_error(err: keyring::Error, key: &str) -> StorageError {
    match err {
        keyring::Error::BadEncoding(_) => StorageError::Corrupt {
            key: key.to_string(),
        },
        other => StorageError::Unavailable(other.to_string()),
    }
}

/// Keychain calls can block on D-Bus or an unlock prompt.
async fn on_blocking_pool<T, F>(key: &str, op: F) -> Result<T, StorageError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(op).await.map_err(|e| {
        StorageError::Unavailable(format!("keychain task for {key} failed: {e}"))
    })?
}

/// Credential fields in the OS keychain / secret service, one entry per key.
#[derive(Clone)]
pub struct KeyringCredentialStore {
    service: String,
    entries: Arc<Mutex<HashMap<String, Arc<keyring::Entry>>>>,
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE)
    }
}

impl KeyringCredentialStore {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn entry(&self, key: &str) -> Result<Arc<keyring::Entry>, StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get(key) {
            return Ok(entry.clone());
        }
        let entry = Arc::new(
            keyring::Entry::new(&self.service, key).map_err(|e| map_keyring_error(e, key))?,
        );
        entries.insert(key.to_string(), entry.clone());
        Ok(entry)
    }

    pub fn is_available(&self) -> bool {
        let Ok(entry) = self.entry(super::KEY_BEARER_TOKEN) else {
            return false;
        };

        match entry.get_password() {
            Ok(_) => true,
            Err(keyring::Error::NoEntry) => true,
            Err(keyring::Error::BadEncoding(_)) => true,
            Err(keyring::Error::Ambiguous(_)) => true,
            Err(keyring::Error::NoStorageAccess(_)) => false,
            Err(keyring::Error::PlatformFailure(_)) => false,
            Err(_) => false,
        }
    }
}

#[async_trait]
impl CredentialStore for KeyringCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entry = self.entry(key)?;
        let owned = key.to_string();
        on_blocking_pool(key, move || match entry.get_password() {
            Ok(value) => {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(trimmed.to_string()))
                }
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(map_keyring_error(e, &owned)),
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let entry = self.entry(key)?;
        let owned = key.to_string();
        let value = value.to_string();
        on_blocking_pool(key, move || {
            entry
                .set_password(&value)
                .map_err(|e| map_keyring_error(e, &owned))
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let entry = self.entry(key)?;
        let owned = key.to_string();
        on_blocking_pool(key, move || match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(map_keyring_error(e, &owned)),
        })
        .await
    }
}
