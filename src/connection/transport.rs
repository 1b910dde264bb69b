use crate::error::TransportError;
use crate::types::{InboundFrame, OutboundFrame};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Opens realtime channels. One call per connection attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Channel>, TransportError>;
}

/// One bidirectional realtime channel.
#[async_trait]
pub trait Channel: Send {
    /// Presents the bearer token. [`TransportError::Unauthorized`] means the
    /// server refused the credential itself.
    async fn handshake(&mut self, token: &str) -> Result<(), TransportError>;

    async fn send(&mut self, frame: &OutboundFrame) -> Result<(), TransportError>;

    /// Next inbound frame; `None` once the peer has closed the channel.
    /// Must be cancel safe.
    async fn recv(&mut self) -> Option<Result<InboundFrame, TransportError>>;

    async fn close(&mut self);
}

fn io_error(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
    TransportError::Io(e.to_string())
}

pub(crate) fn classify_handshake_reply(text: &str) -> Result<(), TransportError> {
    let reply: Value = serde_json::from_str(text)
        .map_err(|e| TransportError::Handshake(format!("unreadable reply: {e}")))?;
    match reply.get("type").and_then(|v| v.as_str()) {
        Some("authenticated") => Ok(()),
        Some("unauthorized") => Err(TransportError::Unauthorized),
        Some(other) => Err(TransportError::Handshake(format!(
            "unexpected reply `{other}`"
        ))),
        None => Err(TransportError::Handshake("reply has no type".to_string())),
    }
}

/// WebSocket transport speaking JSON text frames.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<Box<dyn Channel>, TransportError> {
        let (stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(io_error)?;
        Ok(Box::new(WebSocketChannel { stream }))
    }
}

struct WebSocketChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Channel for WebSocketChannel {
    async fn handshake(&mut self, token: &str) -> Result<(), TransportError> {
        let hello = json!({ "type": "authenticate", "token": token }).to_string();
        self.stream
            .send(Message::Text(hello.into()))
            .await
            .map_err(io_error)?;

        while let Some(msg) = self.stream.next().await {
            match msg.map_err(io_error)? {
                Message::Text(text) => return classify_handshake_reply(text.as_str()),
                Message::Close(_) => return Err(TransportError::Closed),
                _ => continue,
            }
        }
        Err(TransportError::Closed)
    }

    async fn send(&mut self, frame: &OutboundFrame) -> Result<(), TransportError> {
        let json = serde_json::to_string(frame).map_err(|e| TransportError::Io(e.to_string()))?;
        self.stream
            .send(Message::Text(json.into()))
            .await
            .map_err(io_error)
    }

    async fn recv(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => match serde_json::from_str::<InboundFrame>(text.as_str()) {
                    Ok(frame) => return Some(Ok(frame)),
                    Err(e) => debug!(error = %e, "ignoring unreadable frame"),
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(io_error(e))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
