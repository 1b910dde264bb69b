use super::auth_api::{AuthApi, AuthApiError, AuthApiErrorKind};
use crate::redact::redact_secrets;
use crate::types::{RefreshedToken, UserRecord, VerifiedSession};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const CLIENT_USER_AGENT: &str = concat!("tether/", env!("CARGO_PKG_VERSION"));

fn build_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));
    headers
}

fn network_error(e: reqwest::Error) -> AuthApiError {
    let kind = if e.is_decode() {
        AuthApiErrorKind::Protocol
    } else {
        AuthApiErrorKind::Transient
    };
    AuthApiError::new(kind, redact_secrets(&e.to_string()).to_string())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    bearer_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    user: Option<UserRecord>,
}

impl TokenResponse {
    fn expiry(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, AuthApiError> {
        if let Some(at) = self.expires_at {
            return Ok(at);
        }
        self.expires_in
            .and_then(|secs| now.checked_add_signed(TimeDelta::seconds(secs)))
            .ok_or_else(|| AuthApiError::new(AuthApiErrorKind::Protocol, "token response has no expiry"))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// HTTP implementation of [`AuthApi`].
pub struct HttpAuthApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAuthApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AuthApiError> {
        let http = reqwest::Client::builder()
            .default_headers(build_headers())
            .timeout(timeout)
            .build()
            .map_err(network_error)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, AuthApiError> {
        let url = format!("{}{path}", self.base_url);
        let res = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;

        let status = res.status();
        let text = res.text().await.map_err(network_error)?;
        let json = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str::<Value>(&text).unwrap_or(Value::Null)
        };

        if !status.is_success() {
            let tag = json.get("error").and_then(|v| v.as_str());
            return Err(AuthApiError::from_status(status.as_u16(), tag));
        }
        Ok(json)
    }

    fn parse_tokens(json: Value) -> Result<TokenResponse, AuthApiError> {
        serde_json::from_value::<TokenResponse>(json).map_err(|e| {
            AuthApiError::new(
                AuthApiErrorKind::Protocol,
                redact_secrets(&e.to_string()).to_string(),
            )
        })
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn request_code(&self, identifier: &str) -> Result<(), AuthApiError> {
        self.post("/auth/code", json!({ "identifier": identifier }))
            .await
            .map(|_| ())
    }

    async fn verify_code(
        &self,
        identifier: &str,
        code: &str,
    ) -> Result<VerifiedSession, AuthApiError> {
        let json = self
            .post(
                "/auth/verify",
                json!({ "identifier": identifier, "code": code }),
            )
            .await?;
        let tokens = Self::parse_tokens(json)?;
        let expires_at = tokens.expiry(Utc::now())?;

        let refresh_token = non_empty(tokens.refresh_token).ok_or_else(|| {
            AuthApiError::new(AuthApiErrorKind::Protocol, "verify response has no refresh token")
        })?;
        let user = tokens.user.ok_or_else(|| {
            AuthApiError::new(AuthApiErrorKind::Protocol, "verify response has no user")
        })?;

        Ok(VerifiedSession {
            bearer_token: tokens.bearer_token,
            refresh_token,
            expires_at,
            refresh_expires_at: tokens.refresh_expires_at,
            user,
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, AuthApiError> {
        let json = self
            .post("/auth/refresh", json!({ "refreshToken": refresh_token }))
            .await?;
        let tokens = Self::parse_tokens(json)?;
        let expires_at = tokens.expiry(Utc::now())?;

        Ok(RefreshedToken {
            bearer_token: tokens.bearer_token,
            refresh_token: non_empty(tokens.refresh_token),
            expires_at,
            refresh_expires_at: tokens.refresh_expires_at,
        })
    }
}
