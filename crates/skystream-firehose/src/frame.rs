//! Frame decoding for the event stream wire format.
//!
//! Every stream message is two DAG-CBOR maps written back to back: a header
//! (`op`, `t`) followed by a kind-specific body. Text-framed messages carry
//! the same bytes base64-encoded.

use std::collections::BTreeMap;
use std::io::Cursor;

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use ipld_core::ipld::Ipld;

use crate::FirehoseError;

/// Header `op` value for regular messages.
pub const OP_MESSAGE: i64 = 1;

/// Header `op` value for error frames.
pub const OP_ERROR: i64 = -1;

/// A decoded map value (header or body).
pub type IpldMap = BTreeMap<String, Ipld>;

/// Standard alphabet, padding optional.
const TEXT_FRAME_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Raw payload as it arrives from the transport.
#[derive(Debug, Clone, Copy)]
pub enum RawPayload<'a> {
    /// Binary WebSocket message.
    Binary(&'a [u8]),
    /// Text WebSocket message holding base64 of the binary form.
    Text(&'a str),
}

/// One decoded header + body pair.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    header: IpldMap,
    body: IpldMap,
}

impl EventFrame {
    /// Build a frame from already-decoded maps.
    pub fn new(header: IpldMap, body: IpldMap) -> Self {
        Self { header, body }
    }

    pub fn header(&self) -> &IpldMap {
        &self.header
    }

    pub fn body(&self) -> &IpldMap {
        &self.body
    }

    pub fn into_parts(self) -> (IpldMap, IpldMap) {
        (self.header, self.body)
    }

    /// Header operation (1 = message, -1 = error).
    pub fn op(&self) -> Option<i64> {
        self.header.get("op").and_then(ipld_i64)
    }

    /// Header kind discriminator (e.g. `#commit`).
    pub fn kind_tag(&self) -> Option<&str> {
        match self.header.get("t") {
            Some(Ipld::String(t)) => Some(t),
            _ => None,
        }
    }

    /// Sequence number. The protocol places it in the body; a header `seq`
    /// is accepted as a fallback.
    pub fn seq(&self) -> Option<i64> {
        self.body
            .get("seq")
            .and_then(ipld_i64)
            .or_else(|| self.header.get("seq").and_then(ipld_i64))
    }
}

/// Read an integer IPLD value as `i64`.
pub(crate) fn ipld_i64(value: &Ipld) -> Option<i64> {
    match value {
        Ipld::Integer(n) => i64::try_from(*n).ok(),
        _ => None,
    }
}

/// Decode a payload of either framing.
pub fn decode_payload(payload: RawPayload<'_>) -> Result<EventFrame, FirehoseError> {
    match payload {
        RawPayload::Binary(data) => decode_frame(data),
        RawPayload::Text(text) => decode_base64_frame(text),
    }
}

/// Decode a base64 text frame.
pub fn decode_base64_frame(text: &str) -> Result<EventFrame, FirehoseError> {
    let text = text.trim();
    let data = TEXT_FRAME_ENGINE.decode(text).map_err(|e| {
        let offset = match e {
            base64::DecodeError::InvalidByte(offset, _)
            | base64::DecodeError::InvalidLastSymbol(offset, _) => offset,
            _ => text.len(),
        };
        FirehoseError::decode(offset, format!("invalid base64 text frame: {}", e))
    })?;
    decode_frame(&data)
}

/// Decode a binary frame into its header and body maps.
///
/// Fails if either value is malformed or not a map, if the body is missing,
/// or if bytes remain after the body.
pub fn decode_frame(data: &[u8]) -> Result<EventFrame, FirehoseError> {
    if data.is_empty() {
        return Err(FirehoseError::decode(0, "empty frame"));
    }

    let header_end = map_value_end(data, 0, "header")?;
    if header_end == data.len() {
        return Err(FirehoseError::decode(
            header_end,
            "frame ends after header, body map missing",
        ));
    }

    let body_end = map_value_end(data, header_end, "body")?;
    if body_end != data.len() {
        return Err(FirehoseError::decode(
            body_end,
            format!("{} trailing bytes after body map", data.len() - body_end),
        ));
    }

    let header = decode_map(&data[..header_end], 0, "header")?;
    let body = decode_map(&data[header_end..], header_end, "body")?;

    Ok(EventFrame { header, body })
}

/// Encode a header and body into wire bytes.
pub fn encode_frame(header: &IpldMap, body: &IpldMap) -> Result<Vec<u8>, FirehoseError> {
    let mut data = serde_ipld_dagcbor::to_vec(header)
        .map_err(|e| FirehoseError::FrameEncode(format!("header: {}", e)))?;
    let body = serde_ipld_dagcbor::to_vec(body)
        .map_err(|e| FirehoseError::FrameEncode(format!("body: {}", e)))?;
    data.extend(body);
    Ok(data)
}

/// Find where the CBOR value starting at `start` ends, requiring a map.
fn map_value_end(data: &[u8], start: usize, what: &str) -> Result<usize, FirehoseError> {
    // ciborium reads exactly one value and leaves the cursor at its end,
    // which is what splits the two concatenated values.
    let mut cursor = Cursor::new(&data[start..]);
    let value: ciborium::Value = ciborium::from_reader(&mut cursor).map_err(|e| {
        let (offset, cause) = match e {
            ciborium::de::Error::Io(io) => (data.len(), format!("truncated {}: {}", what, io)),
            ciborium::de::Error::Syntax(pos) => {
                (start + pos, format!("invalid CBOR syntax in {}", what))
            }
            ciborium::de::Error::Semantic(pos, msg) => {
                (start + pos.unwrap_or(0), format!("invalid {}: {}", what, msg))
            }
            ciborium::de::Error::RecursionLimitExceeded => {
                (start, format!("{} nesting exceeds recursion limit", what))
            }
        };
        FirehoseError::decode(offset, cause)
    })?;

    if !value.is_map() {
        return Err(FirehoseError::decode(
            start,
            format!("{} is {}, expected a map", what, cbor_kind(&value)),
        ));
    }

    Ok(start + cursor.position() as usize)
}

/// Decode one map value into the IPLD data model.
fn decode_map(bytes: &[u8], offset: usize, what: &str) -> Result<IpldMap, FirehoseError> {
    match serde_ipld_dagcbor::from_slice::<Ipld>(bytes) {
        Ok(Ipld::Map(map)) => Ok(map),
        Ok(_) => Err(FirehoseError::decode(offset, format!("{} is not a map", what))),
        Err(e) => Err(FirehoseError::decode(
            offset,
            format!("invalid DAG-CBOR in {}: {}", what, e),
        )),
    }
}

fn cbor_kind(value: &ciborium::Value) -> &'static str {
    match value {
        ciborium::Value::Integer(_) => "an integer",
        ciborium::Value::Bytes(_) => "a byte string",
        ciborium::Value::Float(_) => "a float",
        ciborium::Value::Text(_) => "a text string",
        ciborium::Value::Bool(_) => "a boolean",
        ciborium::Value::Null => "null",
        ciborium::Value::Tag(_, _) => "a tagged value",
        ciborium::Value::Array(_) => "an array",
        ciborium::Value::Map(_) => "a map",
        _ => "an unsupported value",
    }
}
