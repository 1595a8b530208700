//! WebSocket-equivalent transport.
//!
//! The connection state machine only sees [`Transport`] and
//! [`TransportStream`]; [`WebSocketTransport`] is the production
//! implementation over `tokio-tungstenite`.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};

use crate::FirehoseError;

/// Normal closure code.
pub const CLOSE_NORMAL: u16 = 1000;

/// How long to wait for the peer's close acknowledgement.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Inbound data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    Binary(Vec<u8>),
    Text(String),
    /// Peer sent a close frame.
    Closed { code: Option<u16>, reason: String },
}

/// Transport-level failure.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    /// The underlying connection is gone; no further reads will succeed.
    pub closed: bool,
}

impl TransportError {
    /// Failure after which the connection is unusable.
    pub fn closed(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            closed: true,
        }
    }

    /// Failure of a single read; the connection stays usable.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            closed: false,
        }
    }
}

impl From<TransportError> for FirehoseError {
    fn from(err: TransportError) -> Self {
        FirehoseError::Transport(err.message)
    }
}

/// Opens stream connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn TransportStream>, TransportError>;
}

/// One open connection.
///
/// `next` returning `None` means the peer went away.
#[async_trait]
pub trait TransportStream: Send {
    async fn next(&mut self) -> Option<Result<TransportMessage, TransportError>>;

    /// Close with a status code and reason. Best-effort.
    async fn close(&mut self, code: u16, reason: &str);
}

/// Transport over `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn TransportStream>, TransportError> {
        let (ws, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::closed(format!("connection failed: {}", e)))?;
        debug!(status = %response.status(), "websocket handshake complete");
        Ok(Box::new(WebSocketConnection { ws }))
    }
}

struct WebSocketConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportStream for WebSocketConnection {
    async fn next(&mut self) -> Option<Result<TransportMessage, TransportError>> {
        loop {
            let message = match self.ws.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(classify_ws_error(e))),
            };

            match message {
                Message::Binary(data) => return Some(Ok(TransportMessage::Binary(data))),
                Message::Text(text) => return Some(Ok(TransportMessage::Text(text))),
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                        None => (None, String::new()),
                    };
                    return Some(Ok(TransportMessage::Closed { code, reason }));
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    // tungstenite queues the pong reply and flushes it on the next read
                    trace!("control frame");
                }
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.to_string()),
        };
        if let Err(e) = self.ws.close(Some(frame)).await {
            debug!(error = %e, "websocket close failed");
        }
        // Drain until the peer acknowledges so the socket shuts down cleanly.
        let ws = &mut self.ws;
        let drained = tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, async {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;
        if drained.is_err() {
            debug!("peer did not acknowledge close, dropping socket");
        }
    }
}

fn classify_ws_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Capacity(e) => {
            TransportError::transient(format!("message exceeds capacity: {}", e))
        }
        other => TransportError::closed(format!("read error: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_conversion() {
        let err: FirehoseError = TransportError::closed("stream ended").into();
        assert!(matches!(err, FirehoseError::Transport(ref m) if m == "stream ended"));
    }

    #[test]
    fn test_capacity_error_is_transient() {
        let err = classify_ws_error(tungstenite::Error::Capacity(
            tungstenite::error::CapacityError::MessageTooLong {
                size: 10,
                max_size: 5,
            },
        ));
        assert!(!err.closed);
        assert!(classify_ws_error(tungstenite::Error::ConnectionClosed).closed);
    }
}
