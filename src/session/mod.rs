//! Authentication state machine, token validity policy and single-flight
//! refresh.
//!
//! ```text
//! Unauthenticated ──sign_in──> Authenticating ──verify_code──> Authenticated <──> Refreshing
//!        ^                                                          │
//!        └───────────────sign_out──────── Expired <─────────────────┘ (idle, revoked, 401)
//! ```
//!
//! All state lives behind one async mutex. The only operation that is joined
//! instead of serialized is the token refresh: the first caller spawns it and
//! stores a shared handle, later callers await the same handle.

mod auth_api;
mod http;
mod policy;

pub use auth_api::{AuthApi, AuthApiError, AuthApiErrorKind};
pub use http::HttpAuthApi;

use crate::clock::Clock;
use crate::error::{AuthError, ListenerError, SessionError, StorageError};
use crate::observer::{ListenerId, Subject};
use crate::redact::{redact_secrets, redact_token};
use crate::store::{
    CredentialStore, CREDENTIAL_KEYS, KEY_BEARER_TOKEN, KEY_EXPIRES_AT, KEY_LAST_ACTIVITY_AT,
    KEY_REFRESH_EXPIRES_AT, KEY_REFRESH_TOKEN, KEY_USER_DATA,
};
use crate::types::{Credential, RefreshedToken, SessionState, SessionStateChange, UserRecord};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Subtracted from `expires_at` so a token is not used right before it dies.
    pub safety_margin: Duration,
    /// Maximum idle time before the session is forced invalid.
    pub inactivity_window: Duration,
    /// Period of the inactivity watchdog; `None` disables it.
    pub inactivity_check_interval: Option<Duration>,
    /// Additional attempts after a transient refresh failure.
    pub refresh_max_retries: u32,
    pub refresh_retry_delay: Duration,
    pub network_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(60),
            inactivity_window: Duration::from_secs(48 * 60 * 60),
            inactivity_check_interval: Some(Duration::from_secs(60)),
            refresh_max_retries: 2,
            refresh_retry_delay: Duration::from_millis(500),
            network_timeout: Duration::from_secs(15),
        }
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<String, SessionError>>>;

struct InFlightRefresh {
    future: RefreshFuture,
    abort: AbortHandle,
}

struct SessionInner {
    state: SessionState,
    credential: Option<Credential>,
    user: Option<UserRecord>,
    pending_identifier: Option<String>,
    refresh: Option<InFlightRefresh>,
    watchdog: Option<AbortHandle>,
    /// Bumped whenever the credential is replaced or invalidated so a refresh
    /// that finishes late cannot resurrect a dead session.
    generation: u64,
}

struct SessionShared {
    config: SessionConfig,
    store: Arc<dyn CredentialStore>,
    api: Arc<dyn AuthApi>,
    clock: Arc<dyn Clock>,
    inner: Mutex<SessionInner>,
    observers: Subject<SessionStateChange>,
}

#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<SessionShared>,
}

fn read_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn CredentialStore>,
        api: Arc<dyn AuthApi>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                config,
                store,
                api,
                clock,
                inner: Mutex::new(SessionInner {
                    state: SessionState::Unauthenticated,
                    credential: None,
                    user: None,
                    pending_identifier: None,
                    refresh: None,
                    watchdog: None,
                    generation: 0,
                }),
                observers: Subject::new("session"),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub async fn state(&self) -> SessionState {
        self.shared.inner.lock().await.state
    }

    pub async fn current_user(&self) -> Option<UserRecord> {
        self.shared.inner.lock().await.user.clone()
    }

    /// Observers run synchronously, in registration order, while the session
    /// lock is held. They must not block.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionStateChange) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.shared.observers.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.observers.remove_listener(id)
    }

    fn transition(&self, inner: &mut SessionInner, next: SessionState) {
        let previous = inner.state;
        if previous == next {
            return;
        }
        inner.state = next;
        info!(from = ?previous, to = ?next, "session state changed");
        self.shared.observers.notify(&SessionStateChange {
            previous,
            current: next,
        });
    }

    fn cancel_refresh(inner: &mut SessionInner) {
        if let Some(in_flight) = inner.refresh.take() {
            in_flight.abort.abort();
        }
    }

    fn stop_timers(inner: &mut SessionInner) {
        Self::cancel_refresh(inner);
        if let Some(watchdog) = inner.watchdog.take() {
            watchdog.abort();
        }
    }

    /// Forces `Expired`. Storage is left untouched; clearing is `sign_out`'s job.
    fn expire(&self, inner: &mut SessionInner) {
        inner.generation += 1;
        Self::stop_timers(inner);
        self.transition(inner, SessionState::Expired);
    }

    /// Loads a persisted credential at startup. Unreadable storage behaves like
    /// "never signed in".
    pub async fn restore(&self) -> SessionState {
        let mut inner = self.shared.inner.lock().await;
        if inner.credential.is_some() {
            return inner.state;
        }

        let loaded = match self.load_credential().await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "credential storage unreadable, starting signed out");
                None
            }
        };

        if let Some((credential, user)) = loaded {
            debug!(token = %redact_token(&credential.bearer_token), "restored credential");
            inner.credential = Some(credential);
            inner.user = user;
            inner.generation += 1;
            self.transition(&mut inner, SessionState::Authenticated);
            self.start_watchdog(&mut inner);
        }
        inner.state
    }

    async fn load_credential(
        &self,
    ) -> Result<Option<(Credential, Option<UserRecord>)>, StorageError> {
        let store = &self.shared.store;
        let Some(bearer_token) = store.get(KEY_BEARER_TOKEN).await? else {
            return Ok(None);
        };
        let Some(refresh_token) = store.get(KEY_REFRESH_TOKEN).await? else {
            return Ok(None);
        };

        // A missing timestamp restores as already elapsed.
        let expires_at = read_timestamp(store.get(KEY_EXPIRES_AT).await?).unwrap_or_default();
        let last_activity_at =
            read_timestamp(store.get(KEY_LAST_ACTIVITY_AT).await?).unwrap_or_default();
        let refresh_expires_at = read_timestamp(store.get(KEY_REFRESH_EXPIRES_AT).await?);

        let user = match store.get(KEY_USER_DATA).await? {
            Some(raw) => match serde_json::from_str::<UserRecord>(&raw) {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!(error = %e, "stored user record is unreadable");
                    None
                }
            },
            None => None,
        };

        Ok(Some((
            Credential {
                bearer_token,
                refresh_token,
                expires_at,
                refresh_expires_at,
                last_activity_at,
            },
            user,
        )))
    }

    async fn write_credential(
        &self,
        credential: &Credential,
        user: &UserRecord,
    ) -> Result<(), StorageError> {
        let store = &self.shared.store;
        store.set(KEY_BEARER_TOKEN, &credential.bearer_token).await?;
        store.set(KEY_REFRESH_TOKEN, &credential.refresh_token).await?;
        store
            .set(KEY_EXPIRES_AT, &credential.expires_at.to_rfc3339())
            .await?;
        match credential.refresh_expires_at {
            Some(at) => store.set(KEY_REFRESH_EXPIRES_AT, &at.to_rfc3339()).await?,
            None => store.remove(KEY_REFRESH_EXPIRES_AT).await?,
        }
        store
            .set(KEY_LAST_ACTIVITY_AT, &credential.last_activity_at.to_rfc3339())
            .await?;
        let user_json = serde_json::to_string(user).map_err(|_| StorageError::Corrupt {
            key: KEY_USER_DATA.to_string(),
        })?;
        store.set(KEY_USER_DATA, &user_json).await
    }

    /// New refresh token and bearer token land before the new expiry, so a
    /// partial write reads back as "expired" rather than "valid".
    async fn write_refreshed(
        &self,
        credential: &Credential,
        rotated: bool,
    ) -> Result<(), StorageError> {
        let store = &self.shared.store;
        if rotated {
            store.set(KEY_REFRESH_TOKEN, &credential.refresh_token).await?;
        }
        store.set(KEY_BEARER_TOKEN, &credential.bearer_token).await?;
        store
            .set(KEY_EXPIRES_AT, &credential.expires_at.to_rfc3339())
            .await?;
        if let Some(at) = credential.refresh_expires_at {
            store.set(KEY_REFRESH_EXPIRES_AT, &at.to_rfc3339()).await?;
        }
        Ok(())
    }

    async fn clear_persisted(&self) -> Result<(), StorageError> {
        let mut first_error = None;
        for key in CREDENTIAL_KEYS {
            if let Err(e) = self.shared.store.remove(key).await {
                warn!(key, error = %e, "failed to remove credential field");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Requests a one-time code for `identifier` (E.164 phone number or e-mail).
    pub async fn sign_in(&self, identifier: &str) -> Result<(), AuthError> {
        let identifier = identifier.trim();
        if !policy::is_valid_identifier(identifier) {
            return Err(AuthError::InvalidIdentifier);
        }
        self.ensure_can_sign_in("sign_in").await?;

        let api = self.shared.api.clone();
        match tokio::time::timeout(self.shared.config.network_timeout, api.request_code(identifier))
            .await
        {
            Err(_) => return Err(AuthError::Network("request timed out".to_string())),
            Ok(Err(e)) => {
                warn!(kind = ?e.kind, "code request failed");
                return Err(e.into());
            }
            Ok(Ok(())) => {}
        }

        let mut inner = self.shared.inner.lock().await;
        if !matches!(
            inner.state,
            SessionState::Unauthenticated | SessionState::Authenticating | SessionState::Expired
        ) {
            return Err(AuthError::InvalidState {
                state: inner.state,
                operation: "sign_in",
            });
        }
        inner.pending_identifier = Some(identifier.to_string());
        self.transition(&mut inner, SessionState::Authenticating);
        Ok(())
    }

    async fn ensure_can_sign_in(&self, operation: &'static str) -> Result<(), AuthError> {
        let state = self.shared.inner.lock().await.state;
        match state {
            SessionState::Unauthenticated | SessionState::Authenticating | SessionState::Expired => {
                Ok(())
            }
            state => Err(AuthError::InvalidState { state, operation }),
        }
    }

    /// Exchanges a one-time code for a credential. Failures leave the session
    /// in `Authenticating` and are never retried here.
    pub async fn verify_code(&self, identifier: &str, code: &str) -> Result<UserRecord, AuthError> {
        let identifier = identifier.trim();
        let code = code.trim();
        {
            let inner = self.shared.inner.lock().await;
            if inner.state != SessionState::Authenticating {
                return Err(AuthError::InvalidState {
                    state: inner.state,
                    operation: "verify_code",
                });
            }
            if inner.pending_identifier.as_deref() != Some(identifier) {
                return Err(AuthError::InvalidIdentifier);
            }
        }
        if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AuthError::InvalidCode);
        }

        let api = self.shared.api.clone();
        let verified = match tokio::time::timeout(
            self.shared.config.network_timeout,
            api.verify_code(identifier, code),
        )
        .await
        {
            Err(_) => return Err(AuthError::Network("request timed out".to_string())),
            Ok(Err(e)) => {
                warn!(kind = ?e.kind, "code verification failed");
                return Err(e.into());
            }
            Ok(Ok(verified)) => verified,
        };

        let credential = Credential {
            bearer_token: verified.bearer_token,
            refresh_token: verified.refresh_token,
            expires_at: verified.expires_at,
            refresh_expires_at: verified.refresh_expires_at,
            last_activity_at: self.shared.clock.now(),
        };
        let user = verified.user;

        let mut inner = self.shared.inner.lock().await;
        if inner.state != SessionState::Authenticating {
            return Err(AuthError::InvalidState {
                state: inner.state,
                operation: "verify_code",
            });
        }

        if let Err(e) = self.write_credential(&credential, &user).await {
            // Keep the session for this process; a restart reads "signed out".
            warn!(error = %e, "failed to persist credential");
            let _ = self.clear_persisted().await;
        }

        inner.generation += 1;
        Self::cancel_refresh(&mut inner);
        inner.credential = Some(credential);
        inner.user = Some(user.clone());
        inner.pending_identifier = None;
        self.transition(&mut inner, SessionState::Authenticated);
        self.start_watchdog(&mut inner);
        Ok(user)
    }

    /// True when there is no credential or it fails the expiry policy.
    pub async fn is_token_expired(&self) -> bool {
        let inner = self.shared.inner.lock().await;
        let config = &self.shared.config;
        let now = self.shared.clock.now();
        inner.credential.as_ref().map_or(true, |c| {
            policy::is_token_expired(c, now, config.safety_margin, config.inactivity_window)
        })
    }

    /// Returns a currently valid bearer token, refreshing it first when needed.
    pub async fn get_bearer_token(&self) -> Result<String, SessionError> {
        let pending = {
            let mut inner = self.shared.inner.lock().await;
            if !inner.state.is_signed_in() {
                return Err(SessionError::AuthExpired);
            }
            let Some(credential) = inner.credential.as_ref() else {
                return Err(SessionError::AuthExpired);
            };

            let now = self.shared.clock.now();
            let config = &self.shared.config;
            if !policy::is_token_expired(credential, now, config.safety_margin, config.inactivity_window)
            {
                return Ok(credential.bearer_token.clone());
            }
            if !policy::refresh_token_usable(credential, now, config.inactivity_window) {
                info!("credential expired and cannot be refreshed");
                self.expire(&mut inner);
                return Err(SessionError::AuthExpired);
            }
            self.join_refresh(&mut inner)
        };
        pending.await
    }

    /// Single-flight refresh: starts one if none is running, otherwise joins it.
    pub async fn refresh_id_token(&self) -> Result<String, SessionError> {
        let pending = {
            let mut inner = self.shared.inner.lock().await;
            if !inner.state.is_signed_in() {
                return Err(SessionError::AuthExpired);
            }
            let usable = inner.credential.as_ref().is_some_and(|c| {
                policy::refresh_token_usable(
                    c,
                    self.shared.clock.now(),
                    self.shared.config.inactivity_window,
                )
            });
            if !usable {
                self.expire(&mut inner);
                return Err(SessionError::AuthExpired);
            }
            self.join_refresh(&mut inner)
        };
        pending.await
    }

    fn join_refresh(&self, inner: &mut SessionInner) -> RefreshFuture {
        if let Some(in_flight) = &inner.refresh {
            debug!("joining in-flight token refresh");
            return in_flight.future.clone();
        }

        let refresh_token = inner
            .credential
            .as_ref()
            .map(|c| c.refresh_token.clone())
            .unwrap_or_default();
        let generation = inner.generation;
        let this = self.clone();

        // Spawned so a caller that gives up cannot abandon a refresh the
        // server has already honoured.
        let handle = tokio::spawn(async move { this.run_refresh(refresh_token, generation).await });
        let abort = handle.abort_handle();
        let future = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(SessionError::AuthExpired),
                Err(e) => Err(SessionError::RefreshFailed(e.to_string())),
            }
        }
        .boxed()
        .shared();

        inner.refresh = Some(InFlightRefresh {
            future: future.clone(),
            abort,
        });
        self.transition(inner, SessionState::Refreshing);
        future
    }

    async fn run_refresh(&self, refresh_token: String, generation: u64) -> Result<String, SessionError> {
        let config = &self.shared.config;
        let max_attempts = config.refresh_max_retries + 1;
        let mut attempt = 0;

        let outcome = loop {
            let result = match tokio::time::timeout(
                config.network_timeout,
                self.shared.api.refresh(&refresh_token),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(AuthApiError::transient("refresh timed out")),
            };

            match result {
                Ok(tokens) => break Ok(tokens),
                Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                    let delay = policy::refresh_retry_delay(config.refresh_retry_delay, attempt);
                    attempt += 1;
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %redact_secrets(&e.message),
                        "token refresh failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.invalidates_refresh_token() => {
                    warn!(kind = ?e.kind, "refresh token refused");
                    break Err(SessionError::RefreshRejected);
                }
                Err(e) => {
                    break Err(SessionError::RefreshFailed(
                        redact_secrets(&e.message).to_string(),
                    ))
                }
            }
        };

        self.finish_refresh(outcome, generation).await
    }

    async fn finish_refresh(
        &self,
        outcome: Result<RefreshedToken, SessionError>,
        generation: u64,
    ) -> Result<String, SessionError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.generation != generation {
            debug!("discarding refresh result for a replaced session");
            return Err(SessionError::AuthExpired);
        }
        inner.refresh = None;

        match outcome {
            Ok(tokens) => {
                let Some(credential) = inner.credential.as_mut() else {
                    return Err(SessionError::AuthExpired);
                };
                let rotated = tokens.refresh_token.is_some();
                if let Some(refresh_token) = tokens.refresh_token {
                    credential.refresh_token = refresh_token;
                }
                credential.bearer_token = tokens.bearer_token.clone();
                credential.expires_at = tokens.expires_at;
                if tokens.refresh_expires_at.is_some() {
                    credential.refresh_expires_at = tokens.refresh_expires_at;
                }
                let snapshot = credential.clone();

                if let Err(e) = self.write_refreshed(&snapshot, rotated).await {
                    warn!(error = %e, "failed to persist refreshed token");
                }
                info!(
                    token = %redact_token(&snapshot.bearer_token),
                    expires_at = %snapshot.expires_at,
                    rotated,
                    "token refreshed"
                );
                self.transition(&mut inner, SessionState::Authenticated);
                Ok(tokens.bearer_token)
            }
            Err(SessionError::RefreshRejected) => {
                warn!("refresh token rejected, session expired");
                self.expire(&mut inner);
                Err(SessionError::AuthExpired)
            }
            Err(e) => {
                warn!(error = %e, "token refresh gave up");
                self.transition(&mut inner, SessionState::Authenticated);
                Err(e)
            }
        }
    }

    /// Records user activity (app foregrounded). An already idle session is
    /// expired instead of extended.
    pub async fn update_last_activity(&self) -> Result<(), SessionError> {
        let mut inner = self.shared.inner.lock().await;
        if !inner.state.is_signed_in() {
            return Ok(());
        }
        let now = self.shared.clock.now();
        let window = self.shared.config.inactivity_window;

        let idle = match inner.credential.as_ref() {
            Some(credential) => policy::inactivity_exceeded(credential, now, window),
            None => return Ok(()),
        };
        if idle {
            info!("inactivity window elapsed before activity update");
            self.expire(&mut inner);
            return Err(SessionError::AuthExpired);
        }

        if let Some(credential) = inner.credential.as_mut() {
            credential.last_activity_at = now;
        }
        self.shared
            .store
            .set(KEY_LAST_ACTIVITY_AT, &now.to_rfc3339())
            .await?;
        debug!(at = %now, "activity recorded");
        Ok(())
    }

    /// Classifies an error raised by any other API call. Authentication
    /// failures force `Expired`; returns whether `err` was one.
    pub async fn handle_auth_error(&self, err: &AuthApiError) -> bool {
        if !err.is_auth_failure() {
            return false;
        }
        let mut inner = self.shared.inner.lock().await;
        if inner.state.is_signed_in() {
            warn!("api rejected credential, session expired");
            self.expire(&mut inner);
        }
        true
    }

    /// Clears every persisted credential field and returns to
    /// `Unauthenticated`. In-memory state is cleared even when storage fails.
    pub async fn sign_out(&self) -> Result<(), StorageError> {
        let mut inner = self.shared.inner.lock().await;
        inner.generation += 1;
        Self::stop_timers(&mut inner);
        inner.credential = None;
        inner.user = None;
        inner.pending_identifier = None;

        let cleared = self.clear_persisted().await;
        self.transition(&mut inner, SessionState::Unauthenticated);
        info!("signed out");
        cleared
    }

    /// Expires the session once the inactivity window has elapsed. Returns
    /// `false` when there is nothing left to watch.
    pub async fn check_inactivity(&self) -> bool {
        let mut inner = self.shared.inner.lock().await;
        if !inner.state.is_signed_in() {
            return false;
        }
        let idle = inner.credential.as_ref().is_some_and(|c| {
            policy::inactivity_exceeded(
                c,
                self.shared.clock.now(),
                self.shared.config.inactivity_window,
            )
        });
        if idle {
            info!("inactivity window elapsed");
            self.expire(&mut inner);
            return false;
        }
        true
    }

    fn start_watchdog(&self, inner: &mut SessionInner) {
        if let Some(previous) = inner.watchdog.take() {
            previous.abort();
        }
        let Some(period) = self.shared.config.inactivity_check_interval else {
            return;
        };

        let weak: Weak<SessionShared> = Arc::downgrade(&self.shared);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if !(SessionManager { shared }).check_inactivity().await {
                    break;
                }
            }
        });
        inner.watchdog = Some(handle.abort_handle());
    }

    /// Cancels the in-flight refresh and the inactivity watchdog.
    pub async fn shutdown(&self) {
        let mut inner = self.shared.inner.lock().await;
        Self::stop_timers(&mut inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCredentialStore;
    use crate::test_support::{epoch, user, FailingStore, ManualClock, MockAuthApi};
    use std::sync::Mutex as StdMutex;

    const PHONE: &str = "+15551234567";

    struct Harness {
        session: SessionManager,
        api: Arc<MockAuthApi>,
        clock: Arc<ManualClock>,
        store: MemoryCredentialStore,
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            inactivity_check_interval: None,
            ..SessionConfig::default()
        }
    }

    fn harness_with(config: SessionConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(epoch()));
        let api = Arc::new(MockAuthApi::new(clock.clone()));
        let store = MemoryCredentialStore::new();
        let session = SessionManager::new(
            config,
            Arc::new(store.clone()),
            api.clone(),
            clock.clone(),
        );
        Harness {
            session,
            api,
            clock,
            store,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config())
    }

    async fn sign_in(h: &Harness) {
        h.session.sign_in(PHONE).await.unwrap();
        h.session.verify_code(PHONE, "123456").await.unwrap();
    }

    fn record_transitions(session: &SessionManager) -> Arc<StdMutex<Vec<SessionState>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        session.add_listener(move |change| {
            sink.lock().unwrap().push(change.current);
            Ok(())
        });
        seen
    }

    #[tokio::test]
    async fn sign_in_flow_persists_credential() {
        let h = harness();
        let seen = record_transitions(&h.session);

        sign_in(&h).await;

        assert_eq!(h.session.state().await, SessionState::Authenticated);
        assert_eq!(h.session.current_user().await, Some(user()));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![SessionState::Authenticating, SessionState::Authenticated]
        );

        let stored = h.store.snapshot().await;
        assert_eq!(stored.get(KEY_BEARER_TOKEN).map(String::as_str), Some("bearer-1"));
        assert_eq!(stored.get(KEY_REFRESH_TOKEN).map(String::as_str), Some("refresh-1"));
        assert!(stored.contains_key(KEY_EXPIRES_AT));
        assert!(stored.contains_key(KEY_LAST_ACTIVITY_AT));
        let stored_user: UserRecord =
            serde_json::from_str(&stored[KEY_USER_DATA]).unwrap();
        assert_eq!(stored_user, user());
    }

    #[tokio::test]
    async fn malformed_identifier_never_reaches_the_api() {
        let h = harness();
        assert_eq!(
            h.session.sign_in("not-a-phone").await,
            Err(AuthError::InvalidIdentifier)
        );
        assert_eq!(h.api.request_calls(), 0);
        assert_eq!(h.session.state().await, SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn refused_code_request_leaves_session_signed_out() {
        let h = harness();
        let seen = record_transitions(&h.session);

        h.api.push_request(Err(AuthApiError::from_status(429, None)));
        assert_eq!(h.session.sign_in(PHONE).await, Err(AuthError::RateLimited));
        h.api.push_request(Err(AuthApiError::from_status(400, Some("invalid_identifier"))));
        assert_eq!(h.session.sign_in(PHONE).await, Err(AuthError::InvalidIdentifier));

        assert_eq!(h.api.request_calls(), 2);
        assert_eq!(h.session.state().await, SessionState::Unauthenticated);
        assert!(seen.lock().unwrap().is_empty());
        assert!(h.store.snapshot().await.is_empty());
        assert!(matches!(
            h.session.verify_code(PHONE, "123456").await,
            Err(AuthError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn sign_in_while_authenticated_is_refused() {
        let h = harness();
        sign_in(&h).await;

        assert_eq!(
            h.session.sign_in(PHONE).await,
            Err(AuthError::InvalidState {
                state: SessionState::Authenticated,
                operation: "sign_in",
            })
        );
        assert_eq!(h.api.request_calls(), 1);
        assert_eq!(h.session.state().await, SessionState::Authenticated);
    }

    #[tokio::test]
    async fn failed_verification_stays_authenticating() {
        let h = harness();
        h.session.sign_in(PHONE).await.unwrap();

        h.api
            .push_verify(Err(AuthApiError::new(AuthApiErrorKind::InvalidCode, "bad code")));
        assert_eq!(
            h.session.verify_code(PHONE, "000000").await,
            Err(AuthError::InvalidCode)
        );
        h.api
            .push_verify(Err(AuthApiError::new(AuthApiErrorKind::CodeExpired, "late")));
        assert_eq!(
            h.session.verify_code(PHONE, "000000").await,
            Err(AuthError::CodeExpired)
        );

        assert_eq!(h.api.verify_calls(), 2);
        assert_eq!(h.session.state().await, SessionState::Authenticating);
        assert!(h.store.snapshot().await.is_empty());

        h.session.verify_code(PHONE, "123456").await.unwrap();
        assert_eq!(h.session.state().await, SessionState::Authenticated);
    }

    #[tokio::test]
    async fn verify_requires_a_pending_sign_in() {
        let h = harness();
        assert!(matches!(
            h.session.verify_code(PHONE, "123456").await,
            Err(AuthError::InvalidState { .. })
        ));
        h.session.sign_in(PHONE).await.unwrap();
        assert_eq!(
            h.session.verify_code("+15550000000", "123456").await,
            Err(AuthError::InvalidIdentifier)
        );
    }

    #[tokio::test]
    async fn without_credential_token_is_auth_expired() {
        let h = harness();
        assert_eq!(h.session.get_bearer_token().await, Err(SessionError::AuthExpired));
        assert!(h.session.is_token_expired().await);
    }

    #[tokio::test(start_paused = true)]
    async fn token_served_until_margin_then_refreshed_once() {
        let h = harness();
        sign_in(&h).await;

        h.clock.advance_secs(3500);
        h.session.update_last_activity().await.unwrap();
        assert_eq!(h.session.get_bearer_token().await.unwrap(), "bearer-1");
        assert_eq!(h.api.refresh_calls(), 0);

        h.clock.advance_secs(101);
        assert!(h.session.is_token_expired().await);
        assert_eq!(h.session.get_bearer_token().await.unwrap(), "bearer-2");
        assert_eq!(h.api.refresh_calls(), 1);
        assert_eq!(h.session.state().await, SessionState::Authenticated);

        let stored = h.store.snapshot().await;
        assert_eq!(stored.get(KEY_BEARER_TOKEN).map(String::as_str), Some("bearer-2"));
        assert_eq!(stored.get(KEY_REFRESH_TOKEN).map(String::as_str), Some("refresh-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_refresh() {
        let h = harness();
        sign_in(&h).await;
        h.clock.advance_secs(3601);
        h.api.set_refresh_delay(Duration::from_millis(200));

        let calls = (0..8).map(|_| {
            let session = h.session.clone();
            async move { session.get_bearer_token().await }
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(h.api.refresh_calls(), 1);
        for result in results {
            assert_eq!(result.unwrap(), "bearer-2");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_survives_a_caller_giving_up() {
        let h = harness();
        sign_in(&h).await;
        h.clock.advance_secs(3601);
        h.api.set_refresh_delay(Duration::from_secs(2));

        let impatient = tokio::time::timeout(Duration::from_millis(100), h.session.get_bearer_token()).await;
        assert!(impatient.is_err());

        assert_eq!(h.session.refresh_id_token().await.unwrap(), "bearer-2");
        assert_eq!(h.api.refresh_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rotated_refresh_token_is_persisted() {
        let h = harness();
        sign_in(&h).await;
        h.api.push_refresh(Ok(RefreshedToken {
            bearer_token: "bearer-9".to_string(),
            refresh_token: Some("refresh-9".to_string()),
            expires_at: h.clock.now() + chrono::TimeDelta::seconds(3600),
            refresh_expires_at: None,
        }));

        assert_eq!(h.session.refresh_id_token().await.unwrap(), "bearer-9");
        let stored = h.store.snapshot().await;
        assert_eq!(stored.get(KEY_REFRESH_TOKEN).map(String::as_str), Some("refresh-9"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_refresh_failures_are_retried() {
        let h = harness();
        sign_in(&h).await;
        h.clock.advance_secs(3601);
        h.api.push_refresh(Err(AuthApiError::transient("503")));
        h.api.push_refresh(Err(AuthApiError::transient("503")));

        let token = h.session.get_bearer_token().await.unwrap();
        assert_eq!(token, "bearer-4");
        assert_eq!(h.api.refresh_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_gives_up_after_two_retries() {
        let h = harness();
        sign_in(&h).await;
        h.clock.advance_secs(3601);
        for _ in 0..3 {
            h.api.push_refresh(Err(AuthApiError::transient("connection reset")));
        }

        assert!(matches!(
            h.session.get_bearer_token().await,
            Err(SessionError::RefreshFailed(_))
        ));
        assert_eq!(h.api.refresh_calls(), 3);
        assert_eq!(h.session.state().await, SessionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_timeouts_count_as_transient() {
        let h = harness_with(SessionConfig {
            network_timeout: Duration::from_secs(1),
            ..test_config()
        });
        sign_in(&h).await;
        h.clock.advance_secs(3601);
        h.api.set_refresh_delay(Duration::from_secs(5));

        assert!(matches!(
            h.session.get_bearer_token().await,
            Err(SessionError::RefreshFailed(_))
        ));
        assert_eq!(h.api.refresh_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_refresh_expires_without_retry() {
        let h = harness();
        sign_in(&h).await;
        let seen = record_transitions(&h.session);
        h.clock.advance_secs(3601);
        h.api.push_refresh(Err(AuthApiError::rejected("invalid_grant")));

        assert_eq!(h.session.get_bearer_token().await, Err(SessionError::AuthExpired));
        assert_eq!(h.api.refresh_calls(), 1);
        assert_eq!(h.session.state().await, SessionState::Expired);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![SessionState::Refreshing, SessionState::Expired]
        );
        assert_eq!(h.session.get_bearer_token().await, Err(SessionError::AuthExpired));
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_refresh_request_expires_session() {
        let h = harness();
        sign_in(&h).await;
        h.clock.advance_secs(3601);
        h.api.push_refresh(Err(AuthApiError::from_status(400, None)));

        assert_eq!(h.session.get_bearer_token().await, Err(SessionError::AuthExpired));
        assert_eq!(h.session.state().await, SessionState::Expired);
        assert_eq!(h.session.get_bearer_token().await, Err(SessionError::AuthExpired));
        assert_eq!(h.api.refresh_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_expires_instead_of_refreshing() {
        let h = harness();
        h.api.push_verify(Ok(VerifiedSessionFixture::long_lived(&h)));
        h.session.sign_in(PHONE).await.unwrap();
        h.session.verify_code(PHONE, "123456").await.unwrap();

        h.clock.advance_secs(48 * 3600 + 1);
        assert_eq!(h.session.get_bearer_token().await, Err(SessionError::AuthExpired));
        assert_eq!(h.api.refresh_calls(), 0);
        assert_eq!(h.session.state().await, SessionState::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_update_after_idle_window_expires() {
        let h = harness();
        sign_in(&h).await;
        h.clock.advance_secs(48 * 3600 + 1);

        assert_eq!(
            h.session.update_last_activity().await,
            Err(SessionError::AuthExpired)
        );
        assert_eq!(h.session.state().await, SessionState::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_expires_idle_session() {
        let h = harness_with(SessionConfig {
            inactivity_check_interval: Some(Duration::from_secs(60)),
            ..test_config()
        });
        h.api.push_verify(Ok(VerifiedSessionFixture::long_lived(&h)));
        sign_in(&h).await;

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(h.session.state().await, SessionState::Authenticated);

        h.clock.advance_secs(48 * 3600 + 1);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(h.session.state().await, SessionState::Expired);
    }

    #[tokio::test]
    async fn auth_errors_force_expiry_without_clearing_storage() {
        let h = harness();
        sign_in(&h).await;

        assert!(!h.session.handle_auth_error(&AuthApiError::transient("502")).await);
        assert_eq!(h.session.state().await, SessionState::Authenticated);

        assert!(h.session.handle_auth_error(&AuthApiError::from_status(401, None)).await);
        assert_eq!(h.session.state().await, SessionState::Expired);
        assert_eq!(h.session.get_bearer_token().await, Err(SessionError::AuthExpired));
        assert!(h.store.snapshot().await.contains_key(KEY_REFRESH_TOKEN));

        assert!(h.session.handle_auth_error(&AuthApiError::from_status(403, None)).await);
        assert_eq!(h.session.state().await, SessionState::Expired);
    }

    #[tokio::test]
    async fn sign_out_clears_every_field() {
        let h = harness();
        sign_in(&h).await;
        h.session.sign_out().await.unwrap();

        assert_eq!(h.session.state().await, SessionState::Unauthenticated);
        assert_eq!(h.session.get_bearer_token().await, Err(SessionError::AuthExpired));
        assert_eq!(h.session.current_user().await, None);
        let stored = h.store.snapshot().await;
        for key in CREDENTIAL_KEYS {
            assert!(!stored.contains_key(key), "{key} survived sign-out");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sign_out_cancels_in_flight_refresh() {
        let h = harness();
        sign_in(&h).await;
        h.clock.advance_secs(3601);
        h.api.set_refresh_delay(Duration::from_secs(5));

        let waiting = {
            let session = h.session.clone();
            tokio::spawn(async move { session.get_bearer_token().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.session.state().await, SessionState::Refreshing);

        h.session.sign_out().await.unwrap();
        assert_eq!(waiting.await.unwrap(), Err(SessionError::AuthExpired));
        assert_eq!(h.session.state().await, SessionState::Unauthenticated);
        assert!(h.store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn restore_resumes_persisted_session() {
        let h = harness();
        let expires = epoch() + chrono::TimeDelta::seconds(3600);
        h.store.set(KEY_BEARER_TOKEN, "bearer-r").await.unwrap();
        h.store.set(KEY_REFRESH_TOKEN, "refresh-r").await.unwrap();
        h.store.set(KEY_EXPIRES_AT, &expires.to_rfc3339()).await.unwrap();
        h.store
            .set(KEY_LAST_ACTIVITY_AT, &epoch().to_rfc3339())
            .await
            .unwrap();
        h.store
            .set(KEY_USER_DATA, &serde_json::to_string(&user()).unwrap())
            .await
            .unwrap();

        assert_eq!(h.session.restore().await, SessionState::Authenticated);
        assert_eq!(h.session.get_bearer_token().await.unwrap(), "bearer-r");
        assert_eq!(h.session.current_user().await, Some(user()));
    }

    #[tokio::test(start_paused = true)]
    async fn restore_without_expiry_treats_token_as_expired() {
        let h = harness();
        h.store.set(KEY_BEARER_TOKEN, "bearer-r").await.unwrap();
        h.store.set(KEY_REFRESH_TOKEN, "refresh-r").await.unwrap();
        h.store
            .set(KEY_LAST_ACTIVITY_AT, &epoch().to_rfc3339())
            .await
            .unwrap();

        assert_eq!(h.session.restore().await, SessionState::Authenticated);
        assert!(h.session.is_token_expired().await);
        assert_eq!(h.session.get_bearer_token().await.unwrap(), "bearer-2");
        assert_eq!(h.api.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn unreadable_storage_restores_signed_out() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let session = SessionManager::new(
            test_config(),
            Arc::new(FailingStore),
            Arc::new(MockAuthApi::new(clock.clone())),
            clock,
        );
        assert_eq!(session.restore().await, SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn storage_failure_on_issue_keeps_in_memory_session() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let session = SessionManager::new(
            test_config(),
            Arc::new(FailingStore),
            Arc::new(MockAuthApi::new(clock.clone())),
            clock,
        );
        session.sign_in(PHONE).await.unwrap();
        session.verify_code(PHONE, "123456").await.unwrap();

        assert_eq!(session.state().await, SessionState::Authenticated);
        assert_eq!(session.get_bearer_token().await.unwrap(), "bearer-1");
        assert!(session.sign_out().await.is_err());
        assert_eq!(session.state().await, SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn removed_listener_is_not_notified() {
        let h = harness();
        let seen = Arc::new(StdMutex::new(0));
        let sink = seen.clone();
        let id = h.session.add_listener(move |_| {
            *sink.lock().unwrap() += 1;
            Ok(())
        });
        h.session.sign_in(PHONE).await.unwrap();
        assert!(h.session.remove_listener(id));
        h.session.verify_code(PHONE, "123456").await.unwrap();
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    struct VerifiedSessionFixture;

    impl VerifiedSessionFixture {
        /// A token that outlives the inactivity window, so only idleness can
        /// expire it.
        fn long_lived(h: &Harness) -> crate::types::VerifiedSession {
            crate::types::VerifiedSession {
                bearer_token: "bearer-1".to_string(),
                refresh_token: "refresh-1".to_string(),
                expires_at: h.clock.now() + chrono::TimeDelta::days(10),
                refresh_expires_at: None,
                user: user(),
            }
        }
    }
}
