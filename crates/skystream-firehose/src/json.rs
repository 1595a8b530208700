//! Conversion of decoded values to the AT Protocol JSON representation.
//!
//! CID links become `{"$link": "<cid>"}` and byte strings become
//! `{"$bytes": "<base64>"}`, matching how the protocol renders DAG-CBOR as
//! JSON.

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use ipld_core::ipld::Ipld;
use serde_json::{Map, Value, json};

use crate::car::CommitRecord;
use crate::event::StreamEvent;
use crate::frame::IpldMap;

/// Convert an IPLD value to JSON.
pub fn ipld_to_json(value: &Ipld) -> Value {
    match value {
        Ipld::Null => Value::Null,
        Ipld::Bool(b) => Value::Bool(*b),
        Ipld::Integer(n) => match i64::try_from(*n) {
            Ok(n) => Value::from(n),
            // Out of i64 range; render as a string rather than lose precision.
            Err(_) => Value::String(n.to_string()),
        },
        Ipld::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Ipld::String(s) => Value::String(s.clone()),
        Ipld::Bytes(bytes) => json!({ "$bytes": STANDARD_NO_PAD.encode(bytes) }),
        Ipld::List(items) => Value::Array(items.iter().map(ipld_to_json).collect()),
        Ipld::Map(map) => map_to_json(map),
        Ipld::Link(cid) => json!({ "$link": cid.to_string() }),
    }
}

/// Convert a decoded map to a JSON object.
pub fn map_to_json(map: &IpldMap) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), ipld_to_json(v)))
            .collect::<Map<String, Value>>(),
    )
}

impl CommitRecord {
    /// JSON rendering of a resolved operation.
    pub fn to_json(&self) -> Value {
        json!({
            "action": self.action.as_str(),
            "collection": self.collection,
            "rkey": self.rkey,
            "cid": self.cid.map(|cid| cid.to_string()),
            "record": self.record.as_ref().map(ipld_to_json),
        })
    }
}

impl StreamEvent {
    /// JSON rendering: `{"kind": ..., "seq": ..., "body": {...}}`.
    pub fn to_json(&self) -> Value {
        json!({
            "kind": self.kind().to_string(),
            "seq": self.seq(),
            "body": map_to_json(self.body()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_and_bytes() {
        assert_eq!(ipld_to_json(&Ipld::Integer(42)), json!(42));
        assert_eq!(ipld_to_json(&Ipld::Bool(true)), json!(true));
        assert_eq!(
            ipld_to_json(&Ipld::Bytes(vec![1, 2, 3])),
            json!({ "$bytes": "AQID" })
        );
        assert_eq!(
            ipld_to_json(&Ipld::Integer(i128::from(i64::MAX) + 1)),
            json!("9223372036854775808")
        );
    }

    #[test]
    fn test_nested_map() {
        let mut inner = IpldMap::new();
        inner.insert("name".to_string(), Ipld::String("alice".to_string()));
        let mut outer = IpldMap::new();
        outer.insert("user".to_string(), Ipld::Map(inner));
        outer.insert(
            "tags".to_string(),
            Ipld::List(vec![Ipld::String("a".to_string()), Ipld::Null]),
        );

        assert_eq!(
            map_to_json(&outer),
            json!({ "user": { "name": "alice" }, "tags": ["a", null] })
        );
    }

    #[test]
    fn test_commit_record_json() {
        let record = CommitRecord {
            action: crate::event::OpAction::Delete,
            collection: "app.bsky.feed.post".to_string(),
            rkey: "3kabc".to_string(),
            cid: None,
            record: None,
        };

        assert_eq!(
            record.to_json(),
            json!({
                "action": "delete",
                "collection": "app.bsky.feed.post",
                "rkey": "3kabc",
                "cid": null,
                "record": null,
            })
        );
    }
}
