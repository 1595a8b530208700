//! Event sink delivered to consumers.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

use crate::event::{EventKind, StreamEvent};
use crate::recovery::RepoHead;

/// Item delivered through the event sink.
#[derive(Debug, Clone, PartialEq)]
pub enum FirehoseMessage {
    /// A classified stream event.
    Event(StreamEvent),
    /// Non-fatal problem worth surfacing (dropped frame, gap, ...).
    Diagnostic(Diagnostic),
    /// Repository heads to re-fetch after history truncation.
    Resync(Vec<RepoHead>),
}

/// Non-fatal diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A frame failed to decode or classify and was dropped.
    DroppedFrame {
        kind: Option<EventKind>,
        error: String,
    },
    /// Sequence numbers skipped from `after` to `before`.
    Gap { after: i64, before: i64 },
    /// A single read failed; the connection stayed open.
    ReadError { message: String },
    /// Out-of-band backfill failed.
    BackfillFailed { error: String },
}

/// Receiving half of the event sink.
///
/// Bounded: when the consumer falls behind, the receive loop waits rather
/// than buffering without limit.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<FirehoseMessage>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::Receiver<FirehoseMessage>) -> Self {
        Self { rx }
    }

    /// Next message, or None once the client and its tasks are gone.
    pub async fn recv(&mut self) -> Option<FirehoseMessage> {
        self.rx.recv().await
    }

    /// Next message if one is ready.
    pub fn try_recv(&mut self) -> Option<FirehoseMessage> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = FirehoseMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
