//! The task that owns the realtime channel. Every transition happens here, one
//! event at a time, so there is never more than one open channel or pending
//! reconnect.

use super::outbox::Outbox;
use super::{Command, ConnectResponder, ConnectionConfig, TokenSource, Transport};
use crate::clock::Clock;
use crate::connection::Channel;
use crate::error::{ConnectionError, SessionError, TransportError};
use crate::observer::Subject;
use crate::types::{ConnectionState, InAppMessage, InboundFrame, OutboundFrame, SendStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

enum Event {
    Command(Option<Command>),
    Inbound(Option<Result<InboundFrame, TransportError>>),
    ReconnectDue,
}

enum AttemptError {
    Session(SessionError),
    Unauthorized,
    Transport(TransportError),
}

async fn open_and_handshake(
    transport: &dyn Transport,
    token: &str,
) -> Result<Box<dyn Channel>, TransportError> {
    let mut channel = transport.open().await?;
    match channel.handshake(token).await {
        Ok(()) => Ok(channel),
        Err(e) => {
            channel.close().await;
            Err(e)
        }
    }
}

async fn open_channel(
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenSource>,
    handshake_timeout: Duration,
) -> Result<Box<dyn Channel>, AttemptError> {
    let token = tokens.bearer_token().await.map_err(AttemptError::Session)?;

    let handshake = open_and_handshake(transport.as_ref(), &token);
    match tokio::time::timeout(handshake_timeout, handshake).await {
        Err(_) => Err(AttemptError::Transport(TransportError::Timeout)),
        Ok(Err(TransportError::Unauthorized)) => Err(AttemptError::Unauthorized),
        Ok(Err(e)) => Err(AttemptError::Transport(e)),
        Ok(Ok(channel)) => Ok(channel),
    }
}

async fn recv_inbound(
    channel: &mut Option<Box<dyn Channel>>,
) -> Option<Result<InboundFrame, TransportError>> {
    match channel {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

pub(crate) struct Driver {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenSource>,
    clock: Arc<dyn Clock>,
    state_tx: watch::Sender<ConnectionState>,
    state_observers: Arc<Subject<ConnectionState>>,
    messages: Arc<Subject<InAppMessage>>,
    channel: Option<Box<dyn Channel>>,
    outbox: Outbox,
    attempt: u32,
    reconnect_at: Option<Instant>,
    foreground: bool,
    /// The host asked to be connected and has not asked to disconnect since.
    desired: bool,
    stopping: bool,
}

impl Driver {
    pub(crate) fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenSource>,
        clock: Arc<dyn Clock>,
        state_tx: watch::Sender<ConnectionState>,
        state_observers: Arc<Subject<ConnectionState>>,
        messages: Arc<Subject<InAppMessage>>,
    ) -> Self {
        let outbox = Outbox::new(config.outbound_queue_capacity);
        Self {
            config,
            transport,
            tokens,
            clock,
            state_tx,
            state_observers,
            messages,
            channel: None,
            outbox,
            attempt: 0,
            reconnect_at: None,
            foreground: true,
            desired: false,
            stopping: false,
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            info!(state = ?next, "connection state changed");
            self.state_observers.notify(&next);
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        debug!("connection driver started");
        while !self.stopping {
            let event = tokio::select! {
                cmd = rx.recv() => Event::Command(cmd),
                inbound = recv_inbound(&mut self.channel) => Event::Inbound(inbound),
                _ = sleep_until(self.reconnect_at) => Event::ReconnectDue,
            };

            match event {
                Event::Command(None) | Event::Command(Some(Command::Shutdown)) => {
                    self.stopping = true;
                }
                Event::Command(Some(cmd)) => self.handle_command(cmd, &mut rx).await,
                Event::Inbound(Some(Ok(frame))) => self.dispatch(frame),
                Event::Inbound(Some(Err(e))) => self.connection_lost(e).await,
                Event::Inbound(None) => self.connection_lost(TransportError::Closed).await,
                Event::ReconnectDue => {
                    self.reconnect_at = None;
                    debug!(attempt = self.attempt, "reconnect timer fired");
                    self.connect_now(&mut rx, Vec::new()).await;
                }
            }
        }

        self.reconnect_at = None;
        self.close_channel().await;
        self.set_state(ConnectionState::Disconnected);
        debug!("connection driver stopped");
    }

    async fn handle_command(&mut self, cmd: Command, rx: &mut mpsc::UnboundedReceiver<Command>) {
        match cmd {
            Command::Connect { respond_to } => {
                self.desired = true;
                if self.state() == ConnectionState::Connected {
                    if let Some(tx) = respond_to {
                        let _ = tx.send(Ok(()));
                    }
                    return;
                }
                self.connect_now(rx, respond_to.into_iter().collect()).await;
            }
            Command::Disconnect { respond_to } => {
                self.disconnect().await;
                if let Some(tx) = respond_to {
                    let _ = tx.send(());
                }
            }
            Command::Send { frame, respond_to } => {
                let status = self.send(frame).await;
                let _ = respond_to.send(status);
            }
            Command::Lifecycle(foreground) => self.set_foreground(foreground, rx).await,
            Command::Shutdown => self.stopping = true,
        }
    }

    async fn disconnect(&mut self) {
        self.desired = false;
        self.reconnect_at = None;
        self.attempt = 0;
        self.close_channel().await;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn set_foreground(&mut self, foreground: bool, rx: &mut mpsc::UnboundedReceiver<Command>) {
        self.foreground = foreground;
        if !foreground {
            if self.state() == ConnectionState::Reconnecting {
                info!("backgrounded, pending reconnect cancelled");
                self.reconnect_at = None;
                self.set_state(ConnectionState::Disconnected);
            }
            return;
        }
        if self.desired && self.state() != ConnectionState::Connected {
            info!("foregrounded, reconnecting now");
            self.connect_now(rx, Vec::new()).await;
        }
    }

    /// Runs one connection attempt. Commands that arrive meanwhile are still
    /// served: a disconnect or shutdown abandons the attempt, extra connects
    /// share its outcome, sends are queued.
    async fn connect_now(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<Command>,
        mut waiters: Vec<ConnectResponder>,
    ) {
        self.reconnect_at = None;
        self.set_state(ConnectionState::Connecting);

        let mut disconnect_acks = Vec::new();
        let attempt = open_channel(
            self.transport.clone(),
            self.tokens.clone(),
            self.config.handshake_timeout,
        );
        tokio::pin!(attempt);

        let outcome = loop {
            tokio::select! {
                result = &mut attempt => break Some(result),
                cmd = rx.recv() => match cmd {
                    None | Some(Command::Shutdown) => {
                        self.stopping = true;
                        break None;
                    }
                    Some(Command::Disconnect { respond_to }) => {
                        disconnect_acks.extend(respond_to);
                        break None;
                    }
                    Some(Command::Connect { respond_to }) => waiters.extend(respond_to),
                    Some(Command::Send { frame, respond_to }) => {
                        self.enqueue(frame);
                        let _ = respond_to.send(SendStatus::Queued);
                    }
                    Some(Command::Lifecycle(foreground)) => self.foreground = foreground,
                },
            }
        };

        let result = match outcome {
            None => {
                info!("connect attempt abandoned");
                self.disconnect().await;
                if self.stopping {
                    Err(ConnectionError::ShutDown)
                } else {
                    Err(ConnectionError::Cancelled)
                }
            }
            Some(Ok(channel)) => {
                self.channel = Some(channel);
                self.attempt = 0;
                self.set_state(ConnectionState::Connected);
                self.flush_outbox().await;
                if self.channel.is_some() {
                    Ok(())
                } else {
                    Err(ConnectionError::Unreachable)
                }
            }
            Some(Err(AttemptError::Unauthorized)) => {
                warn!("realtime handshake refused the credential");
                self.tokens.report_unauthorized().await;
                self.desired = false;
                self.set_state(ConnectionState::Disconnected);
                Err(ConnectionError::Session(SessionError::AuthExpired))
            }
            Some(Err(AttemptError::Session(e))) => {
                if matches!(e, SessionError::AuthExpired | SessionError::RefreshRejected) {
                    info!("no valid credential, not connecting");
                    self.desired = false;
                    self.set_state(ConnectionState::Disconnected);
                    Err(ConnectionError::Session(SessionError::AuthExpired))
                } else {
                    warn!(error = %e, "could not obtain token for connect");
                    self.retry_or_stop();
                    Err(ConnectionError::Session(e))
                }
            }
            Some(Err(AttemptError::Transport(e))) => {
                warn!(error = %e, "connect attempt failed");
                self.retry_or_stop();
                Err(ConnectionError::Unreachable)
            }
        };

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        for ack in disconnect_acks {
            let _ = ack.send(());
        }
    }

    fn retry_or_stop(&mut self) {
        if self.foreground && self.desired {
            self.schedule_reconnect();
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.config.backoff.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.reconnect_at = Some(Instant::now() + delay);
        info!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        self.set_state(ConnectionState::Reconnecting);
    }

    async fn connection_lost(&mut self, reason: TransportError) {
        warn!(error = %reason, "realtime channel lost");
        self.close_channel().await;
        self.retry_or_stop();
    }

    async fn close_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
    }

    fn enqueue(&mut self, frame: OutboundFrame) {
        if self.outbox.push(frame).is_some() {
            warn!(
                capacity = self.config.outbound_queue_capacity,
                "outbound queue full, dropped oldest frame"
            );
        }
    }

    async fn send(&mut self, frame: OutboundFrame) -> SendStatus {
        let Some(channel) = self.channel.as_mut() else {
            self.enqueue(frame);
            return SendStatus::Queued;
        };
        match channel.send(&frame).await {
            Ok(()) => SendStatus::Sent,
            Err(e) => {
                self.enqueue(frame);
                self.connection_lost(e).await;
                SendStatus::Queued
            }
        }
    }

    async fn flush_outbox(&mut self) {
        if self.outbox.len() > 0 {
            debug!(frames = self.outbox.len(), "flushing outbound queue");
        }
        while let Some(frame) = self.outbox.pop() {
            let Some(channel) = self.channel.as_mut() else {
                self.outbox.requeue_front(frame);
                return;
            };
            if let Err(e) = channel.send(&frame).await {
                self.outbox.requeue_front(frame);
                self.connection_lost(e).await;
                return;
            }
        }
    }

    fn dispatch(&self, frame: InboundFrame) {
        let kind = frame.kind.clone();
        match frame.into_message(self.clock.now()) {
            Some(message) => {
                let delivered = self.messages.notify(&message);
                debug!(listeners = delivered, "message dispatched");
            }
            None => debug!(kind = %kind, "ignoring inbound frame"),
        }
    }
}
