//! Firehose client handle.
//!
//! [`FirehoseClient`] owns one logical connection to a relay's event stream.
//! Events arrive on the [`EventStream`] returned alongside it; status changes
//! are published on a `watch` channel.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::FirehoseError;
use crate::config::FirehoseConfig;
use crate::connection::{Session, Shared, open_with_retry};
use crate::cursor::SequenceTracker;
use crate::fetch::XrpcFetch;
use crate::recovery::{ResumePlan, RetryBudget};
use crate::sink::EventStream;
use crate::state::{CloseReason, CloseRequest, ConnectionStatus};
use crate::transport::{Transport, WebSocketTransport};

/// Close code sent when the client handle is dropped while connected.
const CLOSE_GOING_AWAY: u16 = 1001;

/// Client for a relay's repository event stream.
///
/// ```no_run
/// # async fn example() -> Result<(), skystream_firehose::FirehoseError> {
/// use skystream_firehose::{FirehoseClient, FirehoseConfig, FirehoseMessage};
///
/// let (client, mut events) = FirehoseClient::builder(FirehoseConfig::default()).build()?;
/// client.connect(None).await?;
///
/// while let Some(message) = events.recv().await {
///     if let FirehoseMessage::Event(event) = message {
///         println!("{} {:?}", event.kind(), event.seq());
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct FirehoseClient {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for a [`FirehoseClient`] with injected collaborators.
pub struct FirehoseClientBuilder {
    config: FirehoseConfig,
    transport: Option<Arc<dyn Transport>>,
    fetch: Option<Arc<dyn XrpcFetch>>,
}

impl FirehoseClientBuilder {
    pub fn new(config: FirehoseConfig) -> Self {
        Self {
            config,
            transport: None,
            fetch: None,
        }
    }

    /// Use a custom transport instead of WebSockets.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Fetch capability for out-of-band backfill.
    pub fn fetch(mut self, fetch: Arc<dyn XrpcFetch>) -> Self {
        self.fetch = Some(fetch);
        self
    }

    /// Validate the configuration and create the client and its event stream.
    pub fn build(self) -> Result<(FirehoseClient, EventStream), FirehoseError> {
        self.config.validate()?;

        if self.config.backfill_on_outdated_cursor && self.fetch.is_none() {
            warn!("outdated cursor backfill enabled without a fetch capability; it will be skipped");
        }

        let (sink_tx, sink_rx) = mpsc::channel(self.config.sink_capacity);
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (cursor_tx, _) = watch::channel(None);
        let (shutdown_tx, _) = watch::channel(None);

        let shared = Arc::new(Shared {
            config: self.config,
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(WebSocketTransport)),
            fetch: self.fetch,
            status: status_tx,
            cursor: cursor_tx,
            shutdown: shutdown_tx,
            sink: sink_tx,
        });

        let client = FirehoseClient {
            shared,
            task: Mutex::new(None),
        };
        Ok((client, EventStream::new(sink_rx)))
    }
}

impl FirehoseClient {
    /// Start building a client.
    pub fn builder(config: FirehoseConfig) -> FirehoseClientBuilder {
        FirehoseClientBuilder::new(config)
    }

    /// Open the stream, resuming after `cursor` when given or from the
    /// oldest retained frame otherwise.
    ///
    /// Returns once the connection is open and the receive loop is running.
    /// A no-op while a connection is already active.
    pub async fn connect(&self, cursor: Option<i64>) -> Result<(), FirehoseError> {
        let budget = self.shared.config.retry_budget;
        self.start(cursor, budget, ConnectionStatus::Connecting).await
    }

    /// Re-open the stream after a disconnect or close.
    ///
    /// `cursor` defaults to the last delivered sequence. The first attempt is
    /// immediate; further attempts back off until `retry_budget` attempts
    /// have failed, which closes the connection with `ReconnectExhausted`.
    pub async fn reconnect(&self, cursor: Option<i64>, retry_budget: u32) -> Result<(), FirehoseError> {
        let cursor = cursor.or_else(|| self.current_cursor());
        self.start(cursor, retry_budget, ConnectionStatus::Reconnecting)
            .await
    }

    /// Close the connection with the given close code and reason.
    ///
    /// Interrupts any pending open, read, backoff or backfill, and waits for
    /// the receive task to finish.
    pub async fn disconnect(&self, code: u16, reason: impl Into<String>) -> Result<(), FirehoseError> {
        let request = CloseRequest {
            code,
            reason: reason.into(),
        };
        info!(code, reason = %request.reason, "firehose disconnect requested");

        // Sent before taking the lock so a pending connect is interrupted.
        self.shared.shutdown.send_replace(Some(request.clone()));

        let mut task = self.task.lock().await;
        self.shared.shutdown.send_replace(Some(request.clone()));

        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "firehose receive task failed");
            }
        }

        if !self.shared.status().is_closed() {
            self.shared
                .set_status(ConnectionStatus::Closed(request.into()));
        }
        Ok(())
    }

    /// Last sequence number delivered, or None before any sequenced event.
    ///
    /// A cursor passed to `connect` or `reconnect` is not reported here until
    /// the relay has delivered an event on it, so a rejected cursor is never
    /// handed back.
    pub fn current_cursor(&self) -> Option<i64> {
        *self.shared.cursor.borrow()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    /// Receiver notified on every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Wait until the connection reaches `Closed` and return the reason.
    pub async fn wait_closed(&self) -> CloseReason {
        let mut rx = self.shared.status.subscribe();
        loop {
            if let ConnectionStatus::Closed(reason) = &*rx.borrow_and_update() {
                return reason.clone();
            }
            if rx.changed().await.is_err() {
                return CloseReason::Requested {
                    code: CLOSE_GOING_AWAY,
                    reason: "client dropped".to_string(),
                };
            }
        }
    }

    pub fn config(&self) -> &FirehoseConfig {
        &self.shared.config
    }

    async fn start(
        &self,
        cursor: Option<i64>,
        retry_budget: u32,
        initial: ConnectionStatus,
    ) -> Result<(), FirehoseError> {
        let mut task = self.task.lock().await;

        let current = self.shared.status();
        if current.is_active() {
            info!(status = %current, "firehose already active, ignoring connect");
            return Ok(());
        }

        // A previous session may have closed on its own; reap it.
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "previous firehose receive task failed");
            }
        }

        self.shared.shutdown.send_replace(None);
        let mut shutdown = self.shared.shutdown.subscribe();
        self.shared.set_status(initial);

        let plan = ResumePlan::for_cursor(cursor);
        let mut retry = RetryBudget::new(retry_budget, self.shared.config.backoff());

        let stream = match open_with_retry(&self.shared, &mut shutdown, plan, &mut retry, true).await {
            Ok(stream) => stream,
            Err(reason) => {
                let error = reason
                    .to_error()
                    .unwrap_or_else(|| FirehoseError::Closed(reason.to_string()));
                self.shared.set_status(ConnectionStatus::Closed(reason));
                return Err(error);
            }
        };

        // The requested cursor only seeds gap detection and reconnect URLs;
        // `current_cursor()` moves once a sequenced event is delivered.
        let mut tracker = SequenceTracker::default();
        tracker.resume_from(plan.cursor());
        self.shared.set_status(ConnectionStatus::Connected);

        let session = Session::new(
            self.shared.clone(),
            stream,
            tracker,
            plan.cursor(),
            retry,
            shutdown,
        );
        *task = Some(tokio::spawn(session.run()));
        Ok(())
    }
}

impl Drop for FirehoseClient {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(Some(CloseRequest {
            code: CLOSE_GOING_AWAY,
            reason: "going away".to_string(),
        }));
    }
}
