//! Shared fixtures for client integration tests.
//!
//! `ScriptedTransport` plays back one script per connection attempt and
//! records every URL it was asked to open.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ipld_core::ipld::Ipld;

use skystream_firehose::{
    FirehoseClient, FirehoseConfig, FirehoseMessage, IpldMap, Transport, TransportError,
    TransportMessage, TransportStream, encode_frame,
};

pub const RELAY: &str = "ws://relay.test";

/// One step of a scripted connection.
#[derive(Debug, Clone)]
pub enum Step {
    Message(TransportMessage),
    Error(TransportError),
    /// Stream ends without a close frame.
    End,
    /// Never yields again.
    Hang,
}

/// Outcome of one connection attempt.
#[derive(Debug, Clone)]
pub enum Script {
    Refuse(String),
    Accept(Vec<Step>),
}

#[derive(Default)]
struct Recorded {
    scripts: VecDeque<Script>,
    urls: Vec<String>,
    closes: Vec<(u16, String)>,
}

/// Transport that replays scripted connections in order.
///
/// Once the scripts run out every further attempt is refused.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<Recorded>>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Script>) -> Self {
        let transport = Self::default();
        transport.inner.lock().unwrap().scripts = scripts.into();
        transport
    }

    pub fn push(&self, script: Script) {
        self.inner.lock().unwrap().scripts.push_back(script);
    }

    pub fn urls(&self) -> Vec<String> {
        self.inner.lock().unwrap().urls.clone()
    }

    pub fn closes(&self) -> Vec<(u16, String)> {
        self.inner.lock().unwrap().closes.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn TransportStream>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.urls.push(url.to_string());
        match inner.scripts.pop_front() {
            Some(Script::Accept(steps)) => Ok(Box::new(ScriptedStream {
                steps: steps.into(),
                recorded: self.inner.clone(),
            })),
            Some(Script::Refuse(message)) => Err(TransportError::closed(message)),
            None => Err(TransportError::closed("no scripted connection")),
        }
    }
}

struct ScriptedStream {
    steps: VecDeque<Step>,
    recorded: Arc<Mutex<Recorded>>,
}

#[async_trait]
impl TransportStream for ScriptedStream {
    async fn next(&mut self) -> Option<Result<TransportMessage, TransportError>> {
        match self.steps.pop_front() {
            Some(Step::Message(message)) => Some(Ok(message)),
            Some(Step::Error(error)) => Some(Err(error)),
            Some(Step::End) => None,
            Some(Step::Hang) | None => std::future::pending().await,
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        self.recorded
            .lock()
            .unwrap()
            .closes
            .push((code, reason.to_string()));
    }
}

fn s(value: &str) -> Ipld {
    Ipld::String(value.to_string())
}

fn map(entries: Vec<(&str, Ipld)>) -> IpldMap {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn frame(header: IpldMap, body: IpldMap) -> Step {
    Step::Message(TransportMessage::Binary(
        encode_frame(&header, &body).unwrap(),
    ))
}

fn message_header(t: &str) -> IpldMap {
    map(vec![("op", Ipld::Integer(1)), ("t", s(t))])
}

pub fn commit(seq: i64) -> Step {
    frame(
        message_header("#commit"),
        map(vec![
            ("seq", Ipld::Integer(seq as i128)),
            ("repo", s("did:plc:alice")),
            ("rev", s(&format!("rev{}", seq))),
            (
                "ops",
                Ipld::List(vec![Ipld::Map(map(vec![
                    ("action", s("create")),
                    ("path", s(&format!("app.bsky.feed.post/{}", seq))),
                ]))]),
            ),
            ("blocks", Ipld::Bytes(Vec::new())),
            ("time", s("2024-01-01T00:00:00.000Z")),
        ]),
    )
}

pub fn handle(seq: i64, handle: &str) -> Step {
    frame(
        message_header("#handle"),
        map(vec![
            ("seq", Ipld::Integer(seq as i128)),
            ("did", s("did:plc:alice")),
            ("handle", s(handle)),
        ]),
    )
}

pub fn info(name: &str) -> Step {
    frame(
        message_header("#info"),
        map(vec![("name", s(name)), ("message", s("cursor too old"))]),
    )
}

pub fn error_frame(name: &str) -> Step {
    frame(
        map(vec![("op", Ipld::Integer(-1))]),
        map(vec![("error", s(name)), ("message", s("cursor in the future"))]),
    )
}

pub fn unknown(t: &str, seq: i64) -> Step {
    frame(
        message_header(t),
        map(vec![("seq", Ipld::Integer(seq as i128))]),
    )
}

/// Re-send a binary frame as a base64 text message.
pub fn as_text(step: Step) -> Step {
    match step {
        Step::Message(TransportMessage::Binary(data)) => {
            Step::Message(TransportMessage::Text(STANDARD.encode(data)))
        }
        other => other,
    }
}

/// Bytes that are not two CBOR maps.
pub fn garbage() -> Step {
    Step::Message(TransportMessage::Binary(vec![0xa1, 0x62, 0x6f, 0x70]))
}

pub fn server_close() -> Step {
    Step::Message(TransportMessage::Closed {
        code: Some(1011),
        reason: "internal error".to_string(),
    })
}

/// Fast-retry configuration against the scripted relay.
pub fn config() -> FirehoseConfig {
    FirehoseConfig::new(RELAY)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
        .with_sink_capacity(64)
}

pub fn client(
    transport: &ScriptedTransport,
    config: FirehoseConfig,
) -> (FirehoseClient, skystream_firehose::EventStream) {
    FirehoseClient::builder(config)
        .transport(Arc::new(transport.clone()))
        .build()
        .unwrap()
}

pub fn url(cursor: Option<i64>) -> String {
    match cursor {
        Some(c) => format!("{}/xrpc/com.atproto.sync.subscribeRepos?cursor={}", RELAY, c),
        None => format!("{}/xrpc/com.atproto.sync.subscribeRepos", RELAY),
    }
}

/// Receive the next message, failing the test after a few seconds.
pub async fn next(events: &mut skystream_firehose::EventStream) -> FirehoseMessage {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for message")
        .expect("event stream closed")
}

/// Receive the next event's sequence number, skipping diagnostics.
pub async fn next_seq(events: &mut skystream_firehose::EventStream) -> Option<i64> {
    loop {
        if let FirehoseMessage::Event(event) = next(events).await {
            return event.seq();
        }
    }
}
