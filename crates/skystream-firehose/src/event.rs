//! Event classification.
//!
//! Turns a decoded [`EventFrame`] into a closed [`StreamEvent`] variant so
//! consumers match on one enum instead of re-inspecting header fields.

use std::fmt;

use chrono::{DateTime, Utc};
use ipld_core::cid::Cid;
use ipld_core::ipld::Ipld;
use tracing::trace;

use crate::FirehoseError;
use crate::frame::{EventFrame, IpldMap, OP_ERROR, ipld_i64};

/// Info name sent when the requested cursor predates the rollback window.
pub const INFO_OUTDATED_CURSOR: &str = "OutdatedCursor";

/// Error name sent when the requested cursor is ahead of the relay.
pub const ERROR_FUTURE_CURSOR: &str = "FutureCursor";

/// Error name sent before the relay drops a consumer that fell behind.
pub const ERROR_CONSUMER_TOO_SLOW: &str = "ConsumerTooSlow";

/// Event kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Commit,
    HandleChange,
    IdentityChange,
    AccountStatus,
    Info,
    Error,
    Unknown,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Commit => "commit",
            EventKind::HandleChange => "handle",
            EventKind::IdentityChange => "identity",
            EventKind::AccountStatus => "account",
            EventKind::Info => "info",
            EventKind::Error => "error",
            EventKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A classified stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Commit(CommitEvent),
    HandleChange(HandleEvent),
    IdentityChange(IdentityEvent),
    AccountStatus(AccountEvent),
    Info(InfoEvent),
    Error(ErrorEvent),
    Unknown(UnknownEvent),
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::Commit(_) => EventKind::Commit,
            StreamEvent::HandleChange(_) => EventKind::HandleChange,
            StreamEvent::IdentityChange(_) => EventKind::IdentityChange,
            StreamEvent::AccountStatus(_) => EventKind::AccountStatus,
            StreamEvent::Info(_) => EventKind::Info,
            StreamEvent::Error(_) => EventKind::Error,
            StreamEvent::Unknown(_) => EventKind::Unknown,
        }
    }

    /// Originating sequence number, when the frame carried one.
    pub fn seq(&self) -> Option<i64> {
        match self {
            StreamEvent::Commit(e) => Some(e.seq),
            StreamEvent::HandleChange(e) => Some(e.seq),
            StreamEvent::IdentityChange(e) => Some(e.seq),
            StreamEvent::AccountStatus(e) => Some(e.seq),
            StreamEvent::Info(_) | StreamEvent::Error(_) => None,
            StreamEvent::Unknown(e) => e.seq,
        }
    }

    /// The decoded body map.
    pub fn body(&self) -> &IpldMap {
        match self {
            StreamEvent::Commit(e) => &e.body,
            StreamEvent::HandleChange(e) => &e.body,
            StreamEvent::IdentityChange(e) => &e.body,
            StreamEvent::AccountStatus(e) => &e.body,
            StreamEvent::Info(e) => &e.body,
            StreamEvent::Error(e) => &e.body,
            StreamEvent::Unknown(e) => &e.body,
        }
    }
}

/// Repository commit (`#commit`).
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEvent {
    pub seq: i64,
    /// Repository DID.
    pub repo: String,
    /// Repository revision (TID format).
    pub rev: String,
    /// Revision of the previous commit (None for the first commit).
    pub since: Option<String>,
    /// Repo commit object CID.
    pub commit: Option<Cid>,
    pub ops: Vec<RepoOp>,
    /// CAR-encoded blocks (empty when absent).
    pub blocks: Vec<u8>,
    /// DEPRECATED: set when the commit was too large to inline.
    pub too_big: bool,
    pub time: Option<DateTime<Utc>>,
    pub body: IpldMap,
}

/// Repository write operation inside a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoOp {
    pub action: OpAction,
    /// Path: "collection/rkey".
    pub path: String,
    /// CID of the record (for create/update).
    pub cid: Option<Cid>,
}

impl RepoOp {
    /// Collection and record key, or None if the path is malformed.
    pub fn collection_and_rkey(&self) -> Option<(&str, &str)> {
        parse_record_path(&self.path)
    }
}

/// Commit operation action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpAction {
    Create,
    Update,
    Delete,
    Other(String),
}

impl OpAction {
    pub fn as_str(&self) -> &str {
        match self {
            OpAction::Create => "create",
            OpAction::Update => "update",
            OpAction::Delete => "delete",
            OpAction::Other(other) => other,
        }
    }
}

impl From<&str> for OpAction {
    fn from(action: &str) -> Self {
        match action {
            "create" => OpAction::Create,
            "update" => OpAction::Update,
            "delete" => OpAction::Delete,
            other => OpAction::Other(other.to_string()),
        }
    }
}

/// Handle change (`#handle`).
#[derive(Debug, Clone, PartialEq)]
pub struct HandleEvent {
    pub seq: i64,
    pub did: String,
    pub handle: String,
    pub time: Option<DateTime<Utc>>,
    pub body: IpldMap,
}

/// Identity change (`#identity`).
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityEvent {
    pub seq: i64,
    pub did: String,
    pub handle: Option<String>,
    pub time: Option<DateTime<Utc>>,
    pub body: IpldMap,
}

/// Account status change (`#account`).
#[derive(Debug, Clone, PartialEq)]
pub struct AccountEvent {
    pub seq: i64,
    pub did: String,
    pub active: bool,
    /// Reason for inactivity (e.g. "takendown", "suspended", "deleted").
    pub status: Option<String>,
    pub time: Option<DateTime<Utc>>,
    pub body: IpldMap,
}

/// Informational notice (`#info`).
#[derive(Debug, Clone, PartialEq)]
pub struct InfoEvent {
    pub name: String,
    pub message: Option<String>,
    pub body: IpldMap,
}

impl InfoEvent {
    /// The relay no longer retains history back to the requested cursor.
    pub fn is_outdated_cursor(&self) -> bool {
        self.name == INFO_OUTDATED_CURSOR
    }
}

/// Server error frame (`op = -1`).
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub error: String,
    pub message: Option<String>,
    pub body: IpldMap,
}

impl ErrorEvent {
    pub fn is_future_cursor(&self) -> bool {
        self.error == ERROR_FUTURE_CURSOR
    }

    pub fn is_consumer_too_slow(&self) -> bool {
        self.error == ERROR_CONSUMER_TOO_SLOW
    }
}

/// Frame with an absent or unrecognized kind.
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownEvent {
    pub tag: Option<String>,
    pub op: Option<i64>,
    pub seq: Option<i64>,
    pub header: IpldMap,
    pub body: IpldMap,
}

/// Classify a decoded frame.
///
/// Unknown or missing kinds never fail; a known kind without its required
/// fields fails with [`FirehoseError::MalformedEvent`].
pub fn classify(frame: EventFrame) -> Result<StreamEvent, FirehoseError> {
    let op = frame.op();

    if op == Some(OP_ERROR) {
        let (_, body) = frame.into_parts();
        let fields = Fields::new(EventKind::Error, &body);
        let error = fields.string("error")?;
        let message = fields.opt_string("message");
        return Ok(StreamEvent::Error(ErrorEvent {
            error,
            message,
            body,
        }));
    }

    // Anything but an error frame is classified by its `t` alone.
    let kind = frame.kind_tag().map(kind_for_tag).unwrap_or(EventKind::Unknown);

    match kind {
        EventKind::Commit => classify_commit(frame),
        EventKind::HandleChange => {
            let (_, body) = frame.into_parts();
            let fields = Fields::new(kind, &body);
            Ok(StreamEvent::HandleChange(HandleEvent {
                seq: fields.int("seq")?,
                did: fields.string("did")?,
                handle: fields.string("handle")?,
                time: fields.time(),
                body,
            }))
        }
        EventKind::IdentityChange => {
            let (_, body) = frame.into_parts();
            let fields = Fields::new(kind, &body);
            Ok(StreamEvent::IdentityChange(IdentityEvent {
                seq: fields.int("seq")?,
                did: fields.string("did")?,
                handle: fields.opt_string("handle"),
                time: fields.time(),
                body,
            }))
        }
        EventKind::AccountStatus => {
            let (_, body) = frame.into_parts();
            let fields = Fields::new(kind, &body);
            Ok(StreamEvent::AccountStatus(AccountEvent {
                seq: fields.int("seq")?,
                did: fields.string("did")?,
                active: fields.boolean("active")?,
                status: fields.opt_string("status"),
                time: fields.time(),
                body,
            }))
        }
        EventKind::Info => {
            let (_, body) = frame.into_parts();
            let fields = Fields::new(kind, &body);
            Ok(StreamEvent::Info(InfoEvent {
                name: fields.string("name")?,
                message: fields.opt_string("message"),
                body,
            }))
        }
        EventKind::Error | EventKind::Unknown => {
            trace!(tag = ?frame.kind_tag(), op = ?op, "unrecognized event kind");
            let tag = frame.kind_tag().map(str::to_string);
            let seq = frame.seq();
            let (header, body) = frame.into_parts();
            Ok(StreamEvent::Unknown(UnknownEvent {
                tag,
                op,
                seq,
                header,
                body,
            }))
        }
    }
}

/// Map a header `t` value to a kind. Both `#commit` and the fully
/// qualified `com.atproto.sync.subscribeRepos#commit` are accepted.
fn kind_for_tag(tag: &str) -> EventKind {
    let fragment = tag.rsplit_once('#').map_or(tag, |(_, fragment)| fragment);
    match fragment {
        "commit" => EventKind::Commit,
        "handle" => EventKind::HandleChange,
        "identity" => EventKind::IdentityChange,
        "account" => EventKind::AccountStatus,
        "info" => EventKind::Info,
        _ => EventKind::Unknown,
    }
}

fn classify_commit(frame: EventFrame) -> Result<StreamEvent, FirehoseError> {
    let (_, body) = frame.into_parts();
    let fields = Fields::new(EventKind::Commit, &body);

    let seq = fields.int("seq")?;
    let repo = fields.string("repo")?;
    let rev = fields.string("rev")?;

    let ops = match body.get("ops") {
        Some(Ipld::List(items)) => items
            .iter()
            .map(parse_op)
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(fields.missing("ops")),
    };

    let commit = match body.get("commit") {
        Some(Ipld::Link(cid)) => Some(*cid),
        _ => None,
    };
    let blocks = match body.get("blocks") {
        Some(Ipld::Bytes(bytes)) => bytes.clone(),
        _ => Vec::new(),
    };
    let too_big = matches!(body.get("tooBig"), Some(Ipld::Bool(true)));
    let since = fields.opt_string("since");
    let time = fields.time();

    Ok(StreamEvent::Commit(CommitEvent {
        seq,
        repo,
        rev,
        since,
        commit,
        ops,
        blocks,
        too_big,
        time,
        body,
    }))
}

fn parse_op(item: &Ipld) -> Result<RepoOp, FirehoseError> {
    let missing = |field| FirehoseError::MalformedEvent {
        kind: EventKind::Commit,
        field,
    };

    let Ipld::Map(op) = item else {
        return Err(missing("ops"));
    };

    let action = match op.get("action") {
        Some(Ipld::String(action)) => OpAction::from(action.as_str()),
        _ => return Err(missing("ops.action")),
    };
    let path = match op.get("path") {
        Some(Ipld::String(path)) => path.clone(),
        _ => return Err(missing("ops.path")),
    };
    let cid = match op.get("cid") {
        Some(Ipld::Link(cid)) => Some(*cid),
        _ => None,
    };

    Ok(RepoOp { action, path, cid })
}

/// Parse a record path into collection and rkey.
/// Returns None if the path is malformed (empty components).
pub fn parse_record_path(path: &str) -> Option<(&str, &str)> {
    let mut parts = path.split('/');
    let collection = parts.next().filter(|s| !s.is_empty())?;
    let rkey = parts.next().filter(|s| !s.is_empty())?;
    Some((collection, rkey))
}

/// Required/optional field accessors over a body map.
struct Fields<'a> {
    kind: EventKind,
    body: &'a IpldMap,
}

impl<'a> Fields<'a> {
    fn new(kind: EventKind, body: &'a IpldMap) -> Self {
        Self { kind, body }
    }

    fn missing(&self, field: &'static str) -> FirehoseError {
        FirehoseError::MalformedEvent {
            kind: self.kind,
            field,
        }
    }

    fn string(&self, field: &'static str) -> Result<String, FirehoseError> {
        match self.body.get(field) {
            Some(Ipld::String(s)) => Ok(s.clone()),
            _ => Err(self.missing(field)),
        }
    }

    fn opt_string(&self, field: &str) -> Option<String> {
        match self.body.get(field) {
            Some(Ipld::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    fn int(&self, field: &'static str) -> Result<i64, FirehoseError> {
        self.body
            .get(field)
            .and_then(ipld_i64)
            .ok_or_else(|| self.missing(field))
    }

    fn boolean(&self, field: &'static str) -> Result<bool, FirehoseError> {
        match self.body.get(field) {
            Some(Ipld::Bool(b)) => Ok(*b),
            _ => Err(self.missing(field)),
        }
    }

    fn time(&self) -> Option<DateTime<Utc>> {
        self.opt_string("time")
            .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}
