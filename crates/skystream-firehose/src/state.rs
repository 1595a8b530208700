//! Connection status reported to callers.

use std::fmt;

use crate::FirehoseError;
use crate::transport::CLOSE_NORMAL;

/// Lifecycle state of a firehose connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal for automatic reconnection; the reason says why.
    Closed(CloseReason),
}

impl ConnectionStatus {
    /// Connecting, connected or reconnecting.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting | ConnectionStatus::Connected | ConnectionStatus::Reconnecting
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionStatus::Closed(_))
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => f.write_str("disconnected"),
            ConnectionStatus::Connecting => f.write_str("connecting"),
            ConnectionStatus::Connected => f.write_str("connected"),
            ConnectionStatus::Reconnecting => f.write_str("reconnecting"),
            ConnectionStatus::Closed(reason) => write!(f, "closed ({})", reason),
        }
    }
}

/// Why a connection reached `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Caller called `disconnect`.
    Requested { code: u16, reason: String },
    /// Retry budget ran out after transport failures.
    ReconnectExhausted { attempts: u32, last_error: String },
    /// Relay rejected the cursor as ahead of its position.
    CursorAheadOfServer { cursor: Option<i64>, message: String },
    /// Transport closed with auto-reconnect disabled.
    TransportClosed { error: String },
    /// The consumer dropped the event stream.
    SinkDropped,
}

impl CloseReason {
    /// Fatal error equivalent, for reasons that are not a plain close.
    pub fn to_error(&self) -> Option<FirehoseError> {
        match self {
            CloseReason::ReconnectExhausted {
                attempts,
                last_error,
            } => Some(FirehoseError::ReconnectExhausted {
                attempts: *attempts,
                last_error: last_error.clone(),
            }),
            CloseReason::CursorAheadOfServer { cursor, message } => {
                Some(FirehoseError::CursorAheadOfServer {
                    cursor: *cursor,
                    message: message.clone(),
                })
            }
            CloseReason::TransportClosed { error } => Some(FirehoseError::Transport(error.clone())),
            CloseReason::Requested { .. } | CloseReason::SinkDropped => None,
        }
    }

    /// Close frame to send on the way out.
    pub(crate) fn close_frame(&self) -> (u16, String) {
        match self {
            CloseReason::Requested { code, reason } => (*code, reason.clone()),
            other => (CLOSE_NORMAL, other.to_string()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested { code, reason } => {
                write!(f, "disconnect requested ({}): {}", code, reason)
            }
            CloseReason::ReconnectExhausted {
                attempts,
                last_error,
            } => write!(f, "reconnect exhausted after {} attempts: {}", attempts, last_error),
            CloseReason::CursorAheadOfServer { cursor, message } => {
                write!(f, "cursor {:?} ahead of server: {}", cursor, message)
            }
            CloseReason::TransportClosed { error } => write!(f, "transport closed: {}", error),
            CloseReason::SinkDropped => f.write_str("event stream dropped"),
        }
    }
}

/// Close request delivered to the receive task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CloseRequest {
    pub code: u16,
    pub reason: String,
}

impl From<CloseRequest> for CloseReason {
    fn from(req: CloseRequest) -> Self {
        CloseReason::Requested {
            code: req.code,
            reason: req.reason,
        }
    }
}
