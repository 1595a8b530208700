//! `skystream decode`: decode and classify a single captured frame.

use std::path::Path;

use miette::Result;
use serde_json::Value;
use skystream_firehose::{CommitRecord, RawPayload, StreamEvent, classify, decode_payload};

/// Read a frame from a file (raw bytes) or base64 text and render it.
pub async fn run(file: Option<&Path>, base64: Option<&str>) -> Result<()> {
    let value = match (file, base64) {
        (Some(path), None) => {
            let data = tokio::fs::read(path)
                .await
                .map_err(|e| miette::miette!("failed to read {}: {}", path.display(), e))?;
            decode(RawPayload::Binary(&data)).await?
        }
        (None, Some(text)) => decode(RawPayload::Text(text)).await?,
        _ => return Err(miette::miette!("exactly one of --file or --base64 is required")),
    };

    let output = serde_json::to_string_pretty(&value)
        .map_err(|e| miette::miette!("failed to render JSON: {}", e))?;
    println!("{}", output);
    Ok(())
}

/// Decode, classify and render one frame. Commits include their resolved
/// records.
pub async fn decode(payload: RawPayload<'_>) -> Result<Value> {
    let frame = decode_payload(payload).map_err(|e| miette::miette!("{}", e))?;
    let event = classify(frame).map_err(|e| miette::miette!("{}", e))?;

    let mut value = event.to_json();
    if let StreamEvent::Commit(commit) = &event {
        let records = commit
            .records()
            .await
            .map_err(|e| miette::miette!("{}", e))?;
        value["records"] = Value::Array(records.iter().map(CommitRecord::to_json).collect());
    }
    Ok(value)
}
