//! Property tests for frame decoding and classification.

use std::collections::BTreeMap;

use ipld_core::ipld::Ipld;
use proptest::prelude::*;

use skystream_firehose::{
    EventFrame, EventKind, FirehoseError, IpldMap, StreamEvent, classify, decode_frame,
    encode_frame,
};

fn leaf() -> impl Strategy<Value = Ipld> {
    prop_oneof![
        Just(Ipld::Null),
        any::<bool>().prop_map(Ipld::Bool),
        any::<i64>().prop_map(|i| Ipld::Integer(i as i128)),
        "[a-zA-Z0-9:#./ ]{0,24}".prop_map(Ipld::String),
        prop::collection::vec(any::<u8>(), 0..32).prop_map(Ipld::Bytes),
    ]
}

fn value() -> impl Strategy<Value = Ipld> {
    leaf().prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Ipld::List),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..4).prop_map(Ipld::Map),
        ]
    })
}

fn ipld_map() -> impl Strategy<Value = IpldMap> {
    prop::collection::btree_map("[a-z]{1,8}", value(), 0..6)
}

fn header_for(t: &str) -> IpldMap {
    BTreeMap::from([
        ("op".to_string(), Ipld::Integer(1)),
        ("t".to_string(), Ipld::String(t.to_string())),
    ])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn decode_inverts_encode(header in ipld_map(), body in ipld_map()) {
        let bytes = encode_frame(&header, &body).unwrap();
        let frame = decode_frame(&bytes).unwrap();
        prop_assert_eq!(frame.header(), &header);
        prop_assert_eq!(frame.body(), &body);
    }

    #[test]
    fn header_without_body_fails_at_header_end(header in ipld_map()) {
        let bytes = encode_frame(&header, &IpldMap::new()).unwrap();
        let header_len = serde_ipld_dagcbor::to_vec(&header).unwrap().len();

        let err = decode_frame(&bytes[..header_len]).unwrap_err();
        prop_assert!(
            matches!(err, FirehoseError::FrameDecode { offset, .. } if offset == header_len),
            "unexpected error: {:?}",
            err
        );
    }

    #[test]
    fn truncated_frames_never_panic(header in ipld_map(), body in ipld_map(), cut in any::<prop::sample::Index>()) {
        let bytes = encode_frame(&header, &body).unwrap();
        let cut = cut.index(bytes.len());
        prop_assert!(decode_frame(&bytes[..cut]).is_err());
    }

    #[test]
    fn unrecognized_tags_classify_as_unknown(fragment in "[a-z]{1,12}", body in ipld_map()) {
        prop_assume!(!matches!(
            fragment.as_str(),
            "commit" | "handle" | "identity" | "account" | "info"
        ));

        let tag = format!("#{}", fragment);
        let event = classify(EventFrame::new(header_for(&tag), body)).unwrap();
        prop_assert_eq!(event.kind(), EventKind::Unknown);
    }

    #[test]
    fn known_tags_classify_or_report_malformed(
        tag in prop::sample::select(vec!["#commit", "#handle", "#identity", "#account", "#info"]),
        body in ipld_map()
    ) {
        match classify(EventFrame::new(header_for(tag), body)) {
            Ok(event) => prop_assert_ne!(event.kind(), EventKind::Unknown),
            Err(FirehoseError::MalformedEvent { kind, .. }) => prop_assert_ne!(kind, EventKind::Unknown),
            Err(other) => prop_assert!(false, "unexpected error: {:?}", other),
        }
    }
}

#[test]
fn unknown_event_keeps_header_and_seq() {
    let body = BTreeMap::from([("seq".to_string(), Ipld::Integer(42))]);
    let event = classify(EventFrame::new(header_for("xyz#unknown"), body)).unwrap();

    match event {
        StreamEvent::Unknown(unknown) => {
            assert_eq!(unknown.tag.as_deref(), Some("xyz#unknown"));
            assert_eq!(unknown.seq, Some(42));
            assert_eq!(unknown.op, Some(1));
        }
        other => panic!("expected unknown, got {:?}", other),
    }
}
