//! Error types for the firehose client.

use thiserror::Error;

use crate::event::EventKind;

/// Errors that can occur while consuming the event stream.
#[derive(Debug, Error)]
pub enum FirehoseError {
    /// Frame bytes could not be decoded into a header and body map.
    #[error("frame decode error at byte {offset}: {cause}")]
    FrameDecode {
        /// Byte offset into the payload where decoding failed.
        offset: usize,
        /// Human-readable cause.
        cause: String,
    },

    /// Frame could not be encoded.
    #[error("frame encode error: {0}")]
    FrameEncode(String),

    /// A known event kind is missing a required body field.
    #[error("malformed {kind} event: missing required field `{field}`")]
    MalformedEvent { kind: EventKind, field: &'static str },

    /// Socket-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The relay rejected the resumption cursor as being ahead of its
    /// current position.
    #[error("cursor {cursor:?} is ahead of the server: {message}")]
    CursorAheadOfServer {
        cursor: Option<i64>,
        message: String,
    },

    /// Reconnection retry budget was exhausted.
    #[error("reconnect failed after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    /// The connection has been closed and cannot be used for this operation.
    #[error("connection closed: {0}")]
    Closed(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// XRPC error from server.
    #[error("XRPC error: {error} - {message}")]
    Xrpc { error: String, message: String },

    /// Invalid response from server.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CAR parsing error.
    #[error("CAR parse error: {0}")]
    CarParse(String),

    /// Invalid client configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FirehoseError {
    pub(crate) fn decode(offset: usize, cause: impl Into<String>) -> Self {
        Self::FrameDecode {
            offset,
            cause: cause.into(),
        }
    }

    /// Whether this error ends the connection without further retries.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FirehoseError::CursorAheadOfServer { .. } | FirehoseError::ReconnectExhausted { .. }
        )
    }
}
