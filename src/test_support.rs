//! Deterministic stand-ins for the clock, auth API, credential store and
//! realtime transport.

use crate::clock::Clock;
use crate::connection::{Channel, TokenSource, Transport};
use crate::error::{SessionError, StorageError, TransportError};
use crate::session::{AuthApi, AuthApiError};
use crate::store::CredentialStore;
use crate::types::{
    InboundFrame, OutboundFrame, RefreshedToken, UserRecord, VerifiedSession,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        let mut now = self.now.lock().unwrap();
        *now += TimeDelta::seconds(secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub(crate) fn user() -> UserRecord {
    UserRecord {
        id: "u-1".to_string(),
        display_name: "Ana".to_string(),
        onboarding_step: 2,
    }
}

/// Scripted auth API. Unscripted calls succeed with tokens that expire one
/// hour after the clock's current time.
pub(crate) struct MockAuthApi {
    clock: Arc<ManualClock>,
    pub refresh_delay: Mutex<Duration>,
    request_results: Mutex<VecDeque<Result<(), AuthApiError>>>,
    verify_results: Mutex<VecDeque<Result<VerifiedSession, AuthApiError>>>,
    refresh_results: Mutex<VecDeque<Result<RefreshedToken, AuthApiError>>>,
    request_calls: AtomicUsize,
    verify_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl MockAuthApi {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            refresh_delay: Mutex::new(Duration::ZERO),
            request_results: Mutex::new(VecDeque::new()),
            verify_results: Mutex::new(VecDeque::new()),
            refresh_results: Mutex::new(VecDeque::new()),
            request_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = delay;
    }

    pub fn push_request(&self, result: Result<(), AuthApiError>) {
        self.request_results.lock().unwrap().push_back(result);
    }

    pub fn push_verify(&self, result: Result<VerifiedSession, AuthApiError>) {
        self.verify_results.lock().unwrap().push_back(result);
    }

    pub fn push_refresh(&self, result: Result<RefreshedToken, AuthApiError>) {
        self.refresh_results.lock().unwrap().push_back(result);
    }

    pub fn request_calls(&self) -> usize {
        self.request_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthApi for MockAuthApi {
    async fn request_code(&self, _identifier: &str) -> Result<(), AuthApiError> {
        self.request_calls.fetch_add(1, Ordering::SeqCst);
        self.request_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn verify_code(
        &self,
        _identifier: &str,
        _code: &str,
    ) -> Result<VerifiedSession, AuthApiError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.verify_results.lock().unwrap().pop_front() {
            return result;
        }
        Ok(VerifiedSession {
            bearer_token: "bearer-1".to_string(),
            refresh_token: "refresh-1".to_string(),
            expires_at: self.clock.now() + TimeDelta::seconds(3600),
            refresh_expires_at: None,
            user: user(),
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedToken, AuthApiError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.refresh_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(result) = self.refresh_results.lock().unwrap().pop_front() {
            return result;
        }
        Ok(RefreshedToken {
            bearer_token: format!("bearer-{}", n + 1),
            refresh_token: None,
            expires_at: self.clock.now() + TimeDelta::seconds(3600),
            refresh_expires_at: None,
        })
    }
}

/// Store whose every call fails, as an unavailable keychain would.
pub(crate) struct FailingStore;

#[async_trait]
impl CredentialStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Err(StorageError::Unavailable("locked".to_string()))
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("locked".to_string()))
    }

    async fn remove(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("locked".to_string()))
    }
}

pub(crate) struct MockTokenSource {
    pub token: Mutex<Result<String, SessionError>>,
    pub unauthorized_reports: AtomicUsize,
}

impl MockTokenSource {
    pub fn valid() -> Self {
        Self {
            token: Mutex::new(Ok("bearer-1".to_string())),
            unauthorized_reports: AtomicUsize::new(0),
        }
    }

    pub fn expired() -> Self {
        Self {
            token: Mutex::new(Err(SessionError::AuthExpired)),
            unauthorized_reports: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TokenSource for MockTokenSource {
    async fn bearer_token(&self) -> Result<String, SessionError> {
        self.token.lock().unwrap().clone()
    }

    async fn report_unauthorized(&self) {
        self.unauthorized_reports.fetch_add(1, Ordering::SeqCst);
    }
}

/// How the next `open()` + `handshake()` pair behaves.
#[derive(Debug, Clone)]
pub(crate) enum Attempt {
    Accept,
    /// Handshake succeeds but every send fails.
    AcceptBroken,
    Refuse(TransportError),
    Hang,
}

/// The test's end of one accepted channel.
pub(crate) struct RemoteEnd {
    pub inbound: mpsc::UnboundedSender<Result<InboundFrame, TransportError>>,
    pub sent: Arc<Mutex<Vec<OutboundFrame>>>,
    pub token: String,
}

impl RemoteEnd {
    pub fn push_message(&self, sender_id: &str, content: &str) {
        let _ = self
            .inbound
            .send(Ok(InboundFrame::message(sender_id, content, None)));
    }

    /// Simulates the server dropping the connection.
    pub fn drop_connection(&self) {
        let _ = self.inbound.send(Err(TransportError::Closed));
    }

    pub fn sent(&self) -> Vec<OutboundFrame> {
        self.sent.lock().unwrap().clone()
    }
}

/// Scripted transport. Unscripted attempts are accepted.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    script: Arc<Mutex<VecDeque<Attempt>>>,
    opens: Arc<Mutex<Vec<tokio::time::Instant>>>,
    remotes: Arc<Mutex<Vec<Arc<RemoteEnd>>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, attempts: impl IntoIterator<Item = Attempt>) {
        self.script.lock().unwrap().extend(attempts);
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    pub fn open_times(&self) -> Vec<tokio::time::Instant> {
        self.opens.lock().unwrap().clone()
    }

    pub fn last_remote(&self) -> Arc<RemoteEnd> {
        self.remotes.lock().unwrap().last().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> Result<Box<dyn Channel>, TransportError> {
        self.opens.lock().unwrap().push(tokio::time::Instant::now());
        let attempt = self.script.lock().unwrap().pop_front().unwrap_or(Attempt::Accept);
        Ok(Box::new(MockChannel {
            attempt,
            inbound: None,
            sent: Arc::new(Mutex::new(Vec::new())),
            remotes: self.remotes.clone(),
        }))
    }
}

struct MockChannel {
    attempt: Attempt,
    inbound: Option<mpsc::UnboundedReceiver<Result<InboundFrame, TransportError>>>,
    sent: Arc<Mutex<Vec<OutboundFrame>>>,
    remotes: Arc<Mutex<Vec<Arc<RemoteEnd>>>>,
}

#[async_trait]
impl Channel for MockChannel {
    async fn handshake(&mut self, token: &str) -> Result<(), TransportError> {
        match self.attempt.clone() {
            Attempt::Accept | Attempt::AcceptBroken => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.inbound = Some(rx);
                self.remotes.lock().unwrap().push(Arc::new(RemoteEnd {
                    inbound: tx,
                    sent: self.sent.clone(),
                    token: token.to_string(),
                }));
                Ok(())
            }
            Attempt::Refuse(e) => Err(e),
            Attempt::Hang => std::future::pending().await,
        }
    }

    async fn send(&mut self, frame: &OutboundFrame) -> Result<(), TransportError> {
        if matches!(self.attempt, Attempt::AcceptBroken) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().unwrap().push(frame.clone());
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        match self.inbound.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    async fn close(&mut self) {
        self.inbound = None;
    }
}
