//! Gap recovery policy.
//!
//! Decides how a connection resumes after a disconnect and how it reacts to
//! the relay's rollback-window notices:
//!
//! - no cursor: start from the oldest retained frame;
//! - cursor inside the window: the relay replays everything after it;
//! - cursor older than the window: the relay sends `#info OutdatedCursor`
//!   and continues from its oldest frame (forwarded as a normal event,
//!   optionally followed by an out-of-band repository listing);
//! - cursor ahead of the relay: `FutureCursor` error frame, fatal.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::FirehoseError;
use crate::event::StreamEvent;
use crate::fetch::XrpcFetch;
use crate::state::CloseReason;

/// Repository enumeration method used for out-of-band backfill.
pub const LIST_REPOS: &str = "com.atproto.sync.listRepos";

/// Page size requested from `listRepos`.
const LIST_REPOS_PAGE_SIZE: u32 = 1000;

/// How the next connection should position itself in the relay's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePlan {
    /// Start from the beginning of the relay's retained history.
    FromOldest,
    /// Ask the relay to replay every frame after `cursor`.
    Replay { cursor: i64 },
}

impl ResumePlan {
    /// Plan for a resumption cursor.
    pub fn for_cursor(cursor: Option<i64>) -> Self {
        match cursor {
            Some(cursor) => ResumePlan::Replay { cursor },
            None => ResumePlan::FromOldest,
        }
    }

    /// Cursor to send as the connect-time query parameter.
    pub fn cursor(&self) -> Option<i64> {
        match self {
            ResumePlan::FromOldest => None,
            ResumePlan::Replay { cursor } => Some(*cursor),
        }
    }
}

/// What the receive loop does after forwarding an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Continue,
    /// History before the cursor is gone; enumerate repos out-of-band.
    Backfill,
    /// Stop and close the connection.
    Close(CloseReason),
}

/// Inspect a classified event for rollback-window signals.
pub fn assess(event: &StreamEvent, requested_cursor: Option<i64>, backfill_enabled: bool) -> Directive {
    match event {
        StreamEvent::Error(err) if err.is_future_cursor() => {
            warn!(
                cursor = ?requested_cursor,
                message = ?err.message,
                "relay rejected cursor as ahead of its position"
            );
            Directive::Close(CloseReason::CursorAheadOfServer {
                cursor: requested_cursor,
                message: err.message.clone().unwrap_or_else(|| err.error.clone()),
            })
        }
        StreamEvent::Error(err) => {
            warn!(error = %err.error, message = ?err.message, "firehose error frame received");
            Directive::Continue
        }
        StreamEvent::Info(notice) if notice.is_outdated_cursor() => {
            info!(
                cursor = ?requested_cursor,
                message = ?notice.message,
                "cursor predates rollback window, relay resumes from oldest frame"
            );
            if backfill_enabled {
                Directive::Backfill
            } else {
                Directive::Continue
            }
        }
        StreamEvent::Info(notice) => {
            debug!(name = %notice.name, message = ?notice.message, "firehose info");
            Directive::Continue
        }
        _ => Directive::Continue,
    }
}

/// Bounded retry counter for transport-level failures.
///
/// Counts consecutive reconnection attempts; reset once a frame is
/// delivered on a new connection.
#[derive(Debug)]
pub struct RetryBudget {
    budget: u32,
    attempts: u32,
    backoff: ExponentialBackoff,
    max_interval: Duration,
    last_error: Option<String>,
}

impl RetryBudget {
    pub fn new(budget: u32, backoff: ExponentialBackoff) -> Self {
        let max_interval = backoff.max_interval;
        Self {
            budget,
            attempts: 0,
            backoff,
            max_interval,
            last_error: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.budget
    }

    /// Count an attempt and return the delay to wait before making it.
    pub fn begin_attempt(&mut self) -> Duration {
        self.attempts += 1;
        self.backoff.next_backoff().unwrap_or(self.max_interval)
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    pub fn reset(&mut self) {
        if self.attempts > 0 {
            debug!(attempts = self.attempts, "connection healthy, retry budget restored");
        }
        self.attempts = 0;
        self.last_error = None;
        self.backoff.reset();
    }

    /// Close reason once the budget is spent.
    pub fn exhausted_reason(&self) -> CloseReason {
        CloseReason::ReconnectExhausted {
            attempts: self.attempts,
            last_error: self
                .last_error
                .clone()
                .unwrap_or_else(|| "no reconnection attempts allowed".to_string()),
        }
    }
}

/// Repository head as listed by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepoHead {
    pub did: String,
    /// Current commit CID.
    pub head: String,
    pub rev: String,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListReposPage {
    #[serde(default)]
    cursor: Option<String>,
    repos: Vec<RepoHead>,
}

/// Out-of-band repository enumeration after history truncation.
///
/// The stream cannot replay frames older than the rollback window, so the
/// consumer instead learns every repository's current head and re-fetches
/// the ones it cares about.
pub struct OutOfBandBackfill {
    fetch: Arc<dyn XrpcFetch>,
    max_pages: usize,
}

impl OutOfBandBackfill {
    pub fn new(fetch: Arc<dyn XrpcFetch>, max_pages: usize) -> Self {
        Self { fetch, max_pages }
    }

    /// List repository heads, following pagination up to the page limit.
    pub async fn list_repo_heads(&self) -> Result<Vec<RepoHead>, FirehoseError> {
        let mut heads = Vec::new();
        let mut cursor: Option<String> = None;

        for page_num in 0..self.max_pages {
            let mut params = vec![("limit", LIST_REPOS_PAGE_SIZE.to_string())];
            if let Some(ref c) = cursor {
                params.push(("cursor", c.clone()));
            }

            let value = self.fetch.query(LIST_REPOS, &params).await?;
            let page: ListReposPage = serde_json::from_value(value)?;
            debug!(page = page_num, repos = page.repos.len(), "listed repos");

            let page_empty = page.repos.is_empty();
            heads.extend(page.repos);

            match page.cursor {
                Some(next) if !page_empty => cursor = Some(next),
                _ => return Ok(heads),
            }
        }

        warn!(
            max_pages = self.max_pages,
            repos = heads.len(),
            "backfill page limit reached, repository listing is partial"
        );
        Ok(heads)
    }
}
