//! `skystream subscribe`: follow a relay and print or log its events.

use std::io::Write;
use std::sync::Arc;

use miette::Result;
use serde_json::{Value, json};
use skystream_firehose::{
    CloseReason, FirehoseClient, FirehoseConfig, FirehoseMessage, HttpXrpcClient, StreamEvent,
    http_url_for_relay, stream_url_for_host,
};
use tracing::{info, trace, warn};

use crate::cursor_file::CursorFile;

/// Page limit for repository listing after an outdated cursor.
const BACKFILL_MAX_PAGES: usize = 100;

pub struct SubscribeOptions {
    pub relay_url: String,
    pub cursor: Option<i64>,
    pub cursor_file: CursorFile,
    pub retry_budget: u32,
    pub auto_reconnect: bool,
    pub json: bool,
    /// Save the cursor after this many events.
    pub save_every: u64,
    pub backfill: bool,
    pub access_token: Option<String>,
}

pub async fn run(opts: SubscribeOptions) -> Result<()> {
    // Accept a relay's HTTP host URL as well as its WebSocket URL.
    let relay_url = stream_url_for_host(&opts.relay_url);

    let mut config = FirehoseConfig::new(&relay_url)
        .with_retry_budget(opts.retry_budget)
        .with_auto_reconnect(opts.auto_reconnect);
    if opts.backfill {
        config = config.with_outdated_cursor_backfill(BACKFILL_MAX_PAGES);
    }

    let mut builder = FirehoseClient::builder(config);
    if opts.backfill {
        let mut fetch = HttpXrpcClient::new(http_url_for_relay(&relay_url))
            .map_err(|e| miette::miette!("failed to create HTTP client: {}", e))?;
        if let Some(token) = opts.access_token {
            fetch = fetch.with_access_token(token);
        }
        builder = builder.fetch(Arc::new(fetch));
    }
    let (client, mut events) = builder.build().map_err(|e| miette::miette!("{}", e))?;

    let start = match opts.cursor {
        Some(cursor) => Some(cursor),
        None => opts.cursor_file.load()?,
    };
    info!(
        relay = %relay_url,
        cursor = ?start,
        cursor_file = %opts.cursor_file.path().display(),
        "subscribing to relay"
    );

    client
        .connect(start)
        .await
        .map_err(|e| miette::miette!("failed to connect: {}", e))?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut since_save = 0u64;
    let mut last_saved = start;

    let closed = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("received shutdown signal");
                client
                    .disconnect(1000, "shutdown")
                    .await
                    .map_err(|e| miette::miette!("{}", e))?;
                break None;
            }

            message = events.recv() => {
                let Some(message) = message else {
                    break None;
                };
                handle_message(&message, opts.json)?;

                if matches!(message, FirehoseMessage::Event(_)) {
                    since_save += 1;
                    if since_save >= opts.save_every {
                        last_saved = save_cursor(&client, &opts.cursor_file, last_saved)?;
                        since_save = 0;
                    }
                }
            }

            reason = client.wait_closed() => {
                break Some(reason);
            }
        }
    };

    // Messages delivered before the close are still owed to the output.
    while let Some(message) = events.try_recv() {
        handle_message(&message, opts.json)?;
    }
    save_cursor(&client, &opts.cursor_file, last_saved)?;

    info!(cursor = ?client.current_cursor(), "subscription ended");
    exit_status(closed)
}

/// Map the close reason to the process result: fatal closes fail the run.
fn exit_status(closed: Option<CloseReason>) -> Result<()> {
    let Some(reason) = closed else {
        return Ok(());
    };
    match reason.to_error() {
        Some(e) if e.is_fatal() => {
            warn!(reason = %reason, "subscription closed");
            Err(miette::miette!("{}", e))
        }
        Some(e) => {
            warn!(error = %e, "subscription closed");
            Ok(())
        }
        None => Ok(()),
    }
}

/// Persist the client's cursor if it moved since the last save.
fn save_cursor(client: &FirehoseClient, file: &CursorFile, last_saved: Option<i64>) -> Result<Option<i64>> {
    let current = client.current_cursor();
    if let Some(cursor) = current {
        if current != last_saved {
            file.store(cursor)?;
        }
    }
    Ok(current)
}

fn handle_message(message: &FirehoseMessage, json: bool) -> Result<()> {
    if json {
        if let Some(value) = message_json(message) {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", value)
                .map_err(|e| miette::miette!("failed to write output: {}", e))?;
        }
    }

    match message {
        FirehoseMessage::Event(event) if !json => log_event(event),
        FirehoseMessage::Event(_) => {}
        FirehoseMessage::Diagnostic(diagnostic) => {
            warn!(diagnostic = ?diagnostic, "stream diagnostic");
        }
        FirehoseMessage::Resync(heads) => {
            info!(repos = heads.len(), "repositories need re-sync after outdated cursor");
        }
    }
    Ok(())
}

fn log_event(event: &StreamEvent) {
    match event {
        StreamEvent::Commit(commit) => {
            info!(
                seq = commit.seq,
                repo = %commit.repo,
                rev = %commit.rev,
                ops = commit.ops.len(),
                too_big = commit.too_big,
                "commit"
            );
        }
        StreamEvent::HandleChange(e) => info!(seq = e.seq, did = %e.did, handle = %e.handle, "handle"),
        StreamEvent::IdentityChange(e) => {
            info!(seq = e.seq, did = %e.did, handle = ?e.handle, "identity")
        }
        StreamEvent::AccountStatus(e) => {
            info!(seq = e.seq, did = %e.did, active = e.active, status = ?e.status, "account")
        }
        StreamEvent::Info(e) => info!(name = %e.name, message = ?e.message, "relay info"),
        StreamEvent::Error(e) => warn!(error = %e.error, message = ?e.message, "relay error"),
        StreamEvent::Unknown(e) => trace!(tag = ?e.tag, seq = ?e.seq, "unrecognized event"),
    }
}

/// JSON line for a message; diagnostics are logged only.
fn message_json(message: &FirehoseMessage) -> Option<Value> {
    match message {
        FirehoseMessage::Event(event) => Some(event.to_json()),
        FirehoseMessage::Resync(heads) => Some(json!({
            "kind": "resync",
            "repos": heads
                .iter()
                .map(|h| json!({ "did": h.did, "head": h.head, "rev": h.rev, "active": h.active }))
                .collect::<Vec<_>>(),
        })),
        FirehoseMessage::Diagnostic(_) => None,
    }
}
