//! AT Protocol event-stream client.
//!
//! Subscribes to a relay's repository event stream
//! (`com.atproto.sync.subscribeRepos`), decodes each binary frame, classifies
//! it into a typed event, tracks the sequence cursor, and keeps the
//! connection alive across disconnects using the relay's rollback window.
//!
//! ## Features
//!
//! - **Frames**: two concatenated DAG-CBOR maps (header + body), binary or
//!   base64 text
//! - **Events**: commit, handle, identity, account, info, error and unknown
//!   kinds
//! - **Cursor**: monotonic sequence tracking with advisory gap detection
//! - **Reconnection**: exponential backoff within a retry budget, resuming
//!   from the last delivered sequence
//! - **Backfill**: optional `listRepos` enumeration after history truncation
//! - **CAR**: record extraction from commit block payloads

pub mod car;
mod client;
mod config;
mod connection;
pub mod cursor;
mod error;
pub mod event;
pub mod fetch;
pub mod frame;
pub mod json;
pub mod recovery;
mod sink;
mod state;
pub mod transport;

pub use car::{CommitRecord, parse_commit_blocks};
pub use client::{FirehoseClient, FirehoseClientBuilder};
pub use config::{DEFAULT_RELAY_URL, FirehoseConfig, SUBSCRIBE_REPOS, http_url_for_relay, stream_url_for_host};
pub use cursor::{Observation, SequenceTracker};
pub use error::FirehoseError;
pub use event::{
    AccountEvent, CommitEvent, ErrorEvent, EventKind, HandleEvent, IdentityEvent, InfoEvent,
    OpAction, RepoOp, StreamEvent, UnknownEvent, classify,
};
pub use fetch::{HttpXrpcClient, XrpcFetch};
pub use frame::{EventFrame, IpldMap, RawPayload, decode_frame, decode_payload, encode_frame};
pub use recovery::{RepoHead, ResumePlan};
pub use sink::{Diagnostic, EventStream, FirehoseMessage};
pub use state::{CloseReason, ConnectionStatus};
pub use transport::{Transport, TransportError, TransportMessage, TransportStream, WebSocketTransport};
