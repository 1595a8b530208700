//! Receive loop and (re)connection routines.
//!
//! One [`Session`] task per live connection owns the transport stream and
//! the sequence tracker. It decodes and classifies frames in arrival order,
//! forwards them to the sink, and drives reconnection when the transport
//! goes away. Every suspension point races the shutdown signal so a
//! `disconnect()` from another task interrupts it promptly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::config::FirehoseConfig;
use crate::cursor::SequenceTracker;
use crate::event::classify;
use crate::fetch::XrpcFetch;
use crate::frame::{RawPayload, decode_payload};
use crate::recovery::{Directive, OutOfBandBackfill, ResumePlan, RetryBudget, assess};
use crate::sink::{Diagnostic, FirehoseMessage};
use crate::state::{CloseReason, CloseRequest, ConnectionStatus};
use crate::transport::{Transport, TransportMessage, TransportStream};

/// State shared between the client handle and its receive task.
pub(crate) struct Shared {
    pub config: FirehoseConfig,
    pub transport: Arc<dyn Transport>,
    pub fetch: Option<Arc<dyn XrpcFetch>>,
    pub status: watch::Sender<ConnectionStatus>,
    pub cursor: watch::Sender<Option<i64>>,
    pub shutdown: watch::Sender<Option<CloseRequest>>,
    pub sink: mpsc::Sender<FirehoseMessage>,
}

impl Shared {
    pub fn set_status(&self, status: ConnectionStatus) {
        match &status {
            ConnectionStatus::Closed(reason) => info!(reason = %reason, "firehose closed"),
            other => debug!(status = %other, "firehose status changed"),
        }
        self.status.send_replace(status);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }
}

/// Wait until a close has been requested.
///
/// A dropped sender means the client handle is gone, which counts as a
/// request to close.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<Option<CloseRequest>>) -> CloseRequest {
    loop {
        if let Some(req) = rx.borrow_and_update().clone() {
            return req;
        }
        if rx.changed().await.is_err() {
            return CloseRequest {
                code: 1001,
                reason: "client dropped".to_string(),
            };
        }
    }
}

/// Open a connection, retrying transport failures within `retry`.
///
/// With `immediate`, the first attempt is made without waiting for the
/// backoff interval.
pub(crate) async fn open_with_retry(
    shared: &Shared,
    shutdown: &mut watch::Receiver<Option<CloseRequest>>,
    plan: ResumePlan,
    retry: &mut RetryBudget,
    immediate: bool,
) -> Result<Box<dyn TransportStream>, CloseReason> {
    let url = shared.config.stream_url(plan.cursor());
    let mut first = true;

    loop {
        if retry.exhausted() {
            error!(attempts = retry.attempts(), "firehose reconnect budget exhausted");
            return Err(retry.exhausted_reason());
        }

        let delay = retry.begin_attempt();
        let delay = if immediate && first { Duration::ZERO } else { delay };
        first = false;

        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");
            tokio::select! {
                biased;
                req = shutdown_requested(shutdown) => return Err(req.into()),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(url = %url, attempt = retry.attempts(), plan = ?plan, "connecting to firehose");

        let result = tokio::select! {
            biased;
            req = shutdown_requested(shutdown) => return Err(req.into()),
            result = shared.transport.connect(&url) => result,
        };

        match result {
            Ok(stream) => {
                info!(attempt = retry.attempts(), "firehose connected");
                return Ok(stream);
            }
            Err(e) => {
                warn!(error = %e, attempt = retry.attempts(), "firehose connection attempt failed");
                retry.record_failure(e.message);
            }
        }
    }
}

/// Outcome of handling one payload.
enum Flow {
    Continue,
    Stop(CloseReason),
}

/// Receive loop for one logical connection.
pub(crate) struct Session {
    shared: Arc<Shared>,
    stream: Box<dyn TransportStream>,
    tracker: SequenceTracker,
    /// Cursor the current transport connection was opened with.
    requested_cursor: Option<i64>,
    retry: RetryBudget,
    shutdown: watch::Receiver<Option<CloseRequest>>,
    /// Whether a frame has been delivered since the last (re)connect.
    delivered: bool,
}

impl Session {
    pub fn new(
        shared: Arc<Shared>,
        stream: Box<dyn TransportStream>,
        tracker: SequenceTracker,
        requested_cursor: Option<i64>,
        retry: RetryBudget,
        shutdown: watch::Receiver<Option<CloseRequest>>,
    ) -> Self {
        Self {
            shared,
            stream,
            tracker,
            requested_cursor,
            retry,
            shutdown,
            delivered: false,
        }
    }

    /// Run until closed. The transport stream is closed or dropped on every
    /// exit path.
    pub async fn run(mut self) {
        let read_timeout = self.shared.config.read_timeout;

        loop {
            let lost = tokio::select! {
                biased;

                req = shutdown_requested(&mut self.shutdown) => {
                    info!(code = req.code, reason = %req.reason, "firehose received shutdown signal");
                    self.finish(req.into()).await;
                    return;
                }

                result = timeout(read_timeout, self.stream.next()) => match result {
                    Ok(Some(Ok(TransportMessage::Binary(data)))) => {
                        match self.handle_payload(RawPayload::Binary(&data)).await {
                            Flow::Continue => continue,
                            Flow::Stop(reason) => {
                                self.finish(reason).await;
                                return;
                            }
                        }
                    }
                    Ok(Some(Ok(TransportMessage::Text(text)))) => {
                        match self.handle_payload(RawPayload::Text(&text)).await {
                            Flow::Continue => continue,
                            Flow::Stop(reason) => {
                                self.finish(reason).await;
                                return;
                            }
                        }
                    }
                    Ok(Some(Ok(TransportMessage::Closed { code, reason }))) => {
                        info!(code = ?code, reason = %reason, "firehose connection closed by server");
                        format!("closed by server ({:?}): {}", code, reason)
                    }
                    Ok(Some(Err(e))) if !e.closed => {
                        warn!(error = %e, "firehose read error, continuing");
                        let diagnostic = Diagnostic::ReadError { message: e.message };
                        if let Flow::Stop(reason) = self.diagnose(diagnostic).await {
                            self.finish(reason).await;
                            return;
                        }
                        continue;
                    }
                    Ok(Some(Err(e))) => e.message,
                    Ok(None) => "stream ended".to_string(),
                    Err(_) => {
                        warn!("firehose read timeout after {}s - connection may be stale", read_timeout.as_secs());
                        "read timeout".to_string()
                    }
                },
            };

            error!(error = %lost, cursor = ?self.tracker.snapshot(), "firehose transport lost");

            if !self.shared.config.auto_reconnect {
                self.shared
                    .set_status(ConnectionStatus::Closed(CloseReason::TransportClosed { error: lost }));
                return;
            }

            self.retry.record_failure(lost);
            if let Err(reason) = self.reconnect().await {
                self.shared.set_status(ConnectionStatus::Closed(reason));
                return;
            }
        }
    }

    /// Replace the dead transport with a new connection resuming from the
    /// tracker's cursor.
    async fn reconnect(&mut self) -> Result<(), CloseReason> {
        self.shared.set_status(ConnectionStatus::Reconnecting);

        let plan = ResumePlan::for_cursor(self.tracker.snapshot());
        let stream =
            open_with_retry(&self.shared, &mut self.shutdown, plan, &mut self.retry, false).await?;

        self.stream = stream;
        self.requested_cursor = plan.cursor();
        self.delivered = false;
        self.shared.set_status(ConnectionStatus::Connected);
        Ok(())
    }

    /// Close the transport and publish the close reason.
    async fn finish(&mut self, reason: CloseReason) {
        let (code, text) = reason.close_frame();
        self.stream.close(code, &text).await;
        self.shared.set_status(ConnectionStatus::Closed(reason));
    }

    async fn handle_payload(&mut self, payload: RawPayload<'_>) -> Flow {
        let frame = match decode_payload(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to decode firehose frame, dropping");
                return self
                    .diagnose(Diagnostic::DroppedFrame {
                        kind: None,
                        error: e.to_string(),
                    })
                    .await;
            }
        };

        let event = match classify(frame) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "malformed firehose event, dropping");
                let kind = match &e {
                    crate::FirehoseError::MalformedEvent { kind, .. } => Some(*kind),
                    _ => None,
                };
                return self
                    .diagnose(Diagnostic::DroppedFrame {
                        kind,
                        error: e.to_string(),
                    })
                    .await;
            }
        };

        let directive = assess(
            &event,
            self.requested_cursor,
            self.shared.config.backfill_on_outdated_cursor,
        );
        let seq = event.seq();
        trace!(kind = %event.kind(), seq = ?seq, "firehose event");

        // Once a permit is held the send cannot fail, so the cursor may
        // advance before the event becomes visible to the consumer.
        let permit = tokio::select! {
            biased;
            req = shutdown_requested(&mut self.shutdown) => return Flow::Stop(req.into()),
            permit = self.shared.sink.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return Flow::Stop(CloseReason::SinkDropped),
            },
        };

        let observation = seq.map(|seq| self.tracker.observe(seq));
        if observation.is_some() {
            self.shared.cursor.send_replace(self.tracker.snapshot());
        }
        permit.send(FirehoseMessage::Event(event));

        if !self.delivered {
            self.delivered = true;
            self.retry.reset();
        }

        if let Some((after, before)) = observation.and_then(|o| o.gap) {
            debug!(after, before, "sequence gap detected");
            if let Flow::Stop(reason) = self.diagnose(Diagnostic::Gap { after, before }).await {
                return Flow::Stop(reason);
            }
        }

        match directive {
            Directive::Continue => Flow::Continue,
            Directive::Close(reason) => Flow::Stop(reason),
            Directive::Backfill => self.backfill().await,
        }
    }

    /// Enumerate relay repositories after history truncation.
    async fn backfill(&mut self) -> Flow {
        let Some(fetch) = self.shared.fetch.clone() else {
            warn!("cursor outdated but no fetch capability configured, skipping backfill");
            return Flow::Continue;
        };

        let backfill = OutOfBandBackfill::new(fetch, self.shared.config.backfill_max_pages);
        info!("starting out-of-band repository backfill");

        let result = tokio::select! {
            biased;
            req = shutdown_requested(&mut self.shutdown) => return Flow::Stop(req.into()),
            result = backfill.list_repo_heads() => result,
        };

        let message = match result {
            Ok(heads) => {
                info!(repos = heads.len(), "backfill listed repositories");
                FirehoseMessage::Resync(heads)
            }
            Err(e) => {
                warn!(error = %e, "out-of-band backfill failed");
                FirehoseMessage::Diagnostic(Diagnostic::BackfillFailed {
                    error: e.to_string(),
                })
            }
        };
        self.deliver(message).await
    }

    async fn diagnose(&mut self, diagnostic: Diagnostic) -> Flow {
        self.deliver(FirehoseMessage::Diagnostic(diagnostic)).await
    }

    async fn deliver(&mut self, message: FirehoseMessage) -> Flow {
        tokio::select! {
            biased;
            req = shutdown_requested(&mut self.shutdown) => Flow::Stop(req.into()),
            result = self.shared.sink.send(message) => match result {
                Ok(()) => Flow::Continue,
                Err(_) => Flow::Stop(CloseReason::SinkDropped),
            },
        }
    }
}
