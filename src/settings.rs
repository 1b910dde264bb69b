use crate::connection::{BackoffPolicy, ConnectionConfig};
use crate::session::SessionConfig;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const SETTINGS_STORE_FILE: &str = "tether-settings.json";

pub const KEY_AUTH_BASE_URL: &str = "authBaseUrl";
pub const KEY_REALTIME_URL: &str = "realtimeUrl";
pub const KEY_TOKEN_SAFETY_MARGIN_SECONDS: &str = "tokenSafetyMarginSeconds";
pub const KEY_INACTIVITY_WINDOW_SECONDS: &str = "inactivityWindowSeconds";
pub const KEY_INACTIVITY_CHECK_INTERVAL_SECONDS: &str = "inactivityCheckIntervalSeconds";
pub const KEY_REFRESH_MAX_RETRIES: &str = "refreshMaxRetries";
pub const KEY_REFRESH_RETRY_DELAY_MS: &str = "refreshRetryDelayMs";
pub const KEY_NETWORK_TIMEOUT_SECONDS: &str = "networkTimeoutSeconds";
pub const KEY_RECONNECT_BASE_DELAY_MS: &str = "reconnectBaseDelayMs";
pub const KEY_RECONNECT_MULTIPLIER: &str = "reconnectMultiplier";
pub const KEY_RECONNECT_MAX_DELAY_MS: &str = "reconnectMaxDelayMs";
pub const KEY_RECONNECT_JITTER_RATIO: &str = "reconnectJitterRatio";
pub const KEY_OUTBOUND_QUEUE_CAPACITY: &str = "outboundQueueCapacity";

const INACTIVITY_WINDOW_SECONDS: u64 = 48 * 60 * 60;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid settings json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("settings must be a json object")]
    NotAnObject,
    #[error("`{key}` must be set")]
    Missing { key: &'static str },
    #[error("`{key}` is out of range: {reason}")]
    Invalid { key: &'static str, reason: &'static str },
}

fn defaults() -> HashMap<String, JsonValue> {
    HashMap::from([
        (KEY_AUTH_BASE_URL.to_string(), json!("")),
        (KEY_REALTIME_URL.to_string(), json!("")),
        (KEY_TOKEN_SAFETY_MARGIN_SECONDS.to_string(), json!(60)),
        (
            KEY_INACTIVITY_WINDOW_SECONDS.to_string(),
            json!(INACTIVITY_WINDOW_SECONDS),
        ),
        (KEY_INACTIVITY_CHECK_INTERVAL_SECONDS.to_string(), json!(60)),
        (KEY_REFRESH_MAX_RETRIES.to_string(), json!(2)),
        (KEY_REFRESH_RETRY_DELAY_MS.to_string(), json!(500)),
        (KEY_NETWORK_TIMEOUT_SECONDS.to_string(), json!(15)),
        (KEY_RECONNECT_BASE_DELAY_MS.to_string(), json!(1000)),
        (KEY_RECONNECT_MULTIPLIER.to_string(), json!(2.0)),
        (KEY_RECONNECT_MAX_DELAY_MS.to_string(), json!(30_000)),
        (KEY_RECONNECT_JITTER_RATIO.to_string(), json!(0.0)),
        (KEY_OUTBOUND_QUEUE_CAPACITY.to_string(), json!(100)),
    ])
}

/// Key/value settings with defaults, in the same camelCase shape the host
/// keeps in its settings store.
#[derive(Debug, Clone)]
pub struct Settings {
    values: HashMap<String, JsonValue>,
}

impl Default for Settings {
    fn default() -> Self {
        Self { values: defaults() }
    }
}

impl Settings {
    /// Overlays `overrides` on top of the defaults. Null values are ignored.
    pub fn from_map(overrides: JsonMap<String, JsonValue>) -> Self {
        let mut values = defaults();
        for (k, v) in overrides {
            if v.is_null() {
                continue;
            }
            values.insert(k, v);
        }
        Self { values }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, SettingsError> {
        match serde_json::from_str::<JsonValue>(raw)? {
            JsonValue::Object(map) => Ok(Self::from_map(map)),
            _ => Err(SettingsError::NotAnObject),
        }
    }

    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn get_u64(&self, key: &str, fallback: u64) -> u64 {
        self.values
            .get(key)
            .and_then(|v| v.as_u64())
            .unwrap_or(fallback)
    }

    pub fn get_f64(&self, key: &str, fallback: f64) -> f64 {
        self.values
            .get(key)
            .and_then(|v| v.as_f64())
            .unwrap_or(fallback)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        let v = self.values.get(key)?;
        let s = v.as_str()?.trim();
        if s.is_empty() {
            None
        } else {
            Some(s.to_string())
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<JsonValue>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn auth_base_url(&self) -> Result<String, SettingsError> {
        self.get_string(KEY_AUTH_BASE_URL)
            .map(|s| s.trim_end_matches('/').to_string())
            .ok_or(SettingsError::Missing {
                key: KEY_AUTH_BASE_URL,
            })
    }

    pub fn realtime_url(&self) -> Result<String, SettingsError> {
        self.get_string(KEY_REALTIME_URL).ok_or(SettingsError::Missing {
            key: KEY_REALTIME_URL,
        })
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.get_u64(KEY_NETWORK_TIMEOUT_SECONDS, 15).max(1))
    }

    pub fn session_config(&self) -> Result<SessionConfig, SettingsError> {
        let inactivity_window = self.get_u64(KEY_INACTIVITY_WINDOW_SECONDS, INACTIVITY_WINDOW_SECONDS);
        if inactivity_window == 0 {
            return Err(SettingsError::Invalid {
                key: KEY_INACTIVITY_WINDOW_SECONDS,
                reason: "must be greater than zero",
            });
        }

        let check_interval = self.get_u64(KEY_INACTIVITY_CHECK_INTERVAL_SECONDS, 60);

        Ok(SessionConfig {
            safety_margin: Duration::from_secs(self.get_u64(KEY_TOKEN_SAFETY_MARGIN_SECONDS, 60)),
            inactivity_window: Duration::from_secs(inactivity_window),
            inactivity_check_interval: (check_interval > 0)
                .then(|| Duration::from_secs(check_interval)),
            refresh_max_retries: self.get_u64(KEY_REFRESH_MAX_RETRIES, 2).min(10) as u32,
            refresh_retry_delay: Duration::from_millis(self.get_u64(KEY_REFRESH_RETRY_DELAY_MS, 500)),
            network_timeout: self.network_timeout(),
        })
    }

    pub fn connection_config(&self) -> Result<ConnectionConfig, SettingsError> {
        let base_ms = self.get_u64(KEY_RECONNECT_BASE_DELAY_MS, 1000).max(1);
        let max_ms = self.get_u64(KEY_RECONNECT_MAX_DELAY_MS, 30_000);
        if max_ms < base_ms {
            return Err(SettingsError::Invalid {
                key: KEY_RECONNECT_MAX_DELAY_MS,
                reason: "must not be smaller than the base delay",
            });
        }

        let multiplier = self.get_f64(KEY_RECONNECT_MULTIPLIER, 2.0);
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(SettingsError::Invalid {
                key: KEY_RECONNECT_MULTIPLIER,
                reason: "must be at least 1.0",
            });
        }

        let jitter = self.get_f64(KEY_RECONNECT_JITTER_RATIO, 0.0);
        if !(0.0..=1.0).contains(&jitter) {
            return Err(SettingsError::Invalid {
                key: KEY_RECONNECT_JITTER_RATIO,
                reason: "must be between 0.0 and 1.0",
            });
        }

        Ok(ConnectionConfig {
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(base_ms),
                multiplier,
                max_delay: Duration::from_millis(max_ms),
                jitter_ratio: jitter,
            },
            handshake_timeout: self.network_timeout(),
            outbound_queue_capacity: self.get_u64(KEY_OUTBOUND_QUEUE_CAPACITY, 100).max(1) as usize,
        })
    }
}
