//! Property-based tests for envelope decoding
//!
//! Clients control every byte of a text frame, so decoding must never panic
//! and must classify every input as either a valid frame or a typed error.

use proptest::prelude::*;
use serde_json::{Value, json};
use switchyard_proto::{ClientFrame, Envelope, Kind, MAX_MESSAGE_LENGTH, Payload, ProtocolError};
use uuid::Uuid;

/// Strategy for arbitrary JSON leaf values
fn arbitrary_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-z0-9 ]{0,16}".prop_map(Value::String),
    ]
}

/// Strategy for flat JSON objects with arbitrary keys
fn arbitrary_object() -> impl Strategy<Value = serde_json::Map<String, Value>> {
    prop::collection::btree_map("[a-z_]{1,12}", arbitrary_leaf(), 0..6)
        .prop_map(|m| m.into_iter().collect())
}

#[test]
fn prop_parse_never_panics_on_arbitrary_text() {
    proptest!(|(text in ".{0,256}")| {
        let _ = ClientFrame::parse(&text);
        let _ = Envelope::from_json(&text);
    });
}

#[test]
fn prop_unknown_types_rejected() {
    proptest!(|(name in "[a-z_]{1,16}", payload in arbitrary_object())| {
        prop_assume!(Kind::from_wire(&name).is_none());

        let text = json!({ "type": name, "payload": payload }).to_string();
        prop_assert_eq!(ClientFrame::parse(&text), Err(ProtocolError::UnknownKind(name)));
    });
}

#[test]
fn prop_message_length_boundary() {
    proptest!(|(len in 0usize..(MAX_MESSAGE_LENGTH + 64))| {
        let content = "x".repeat(len);
        let result = Payload::decode(Kind::Message, json!({ "content": content }));

        if (1..=MAX_MESSAGE_LENGTH).contains(&len) {
            prop_assert!(result.is_ok());
        } else {
            prop_assert!(result.is_err());
        }
    });
}

#[test]
fn prop_signaling_extra_fields_survive_relay() {
    proptest!(|(extra in arbitrary_object(), sdp in "[ -~]{0,64}")| {
        let mut body = extra.clone();
        body.remove("target_id");
        body.insert("sdp".to_string(), Value::String(sdp));
        let body = Value::Object(body);

        let text = json!({ "type": "offer", "payload": body.clone() }).to_string();
        let frame = ClientFrame::parse(&text).unwrap();
        let env = frame
            .into_envelope(Uuid::from_u128(1), Uuid::from_u128(2), chrono::DateTime::<chrono::Utc>::UNIX_EPOCH, || {
                Uuid::from_u128(3)
            })
            .unwrap();

        let relayed: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        prop_assert_eq!(&relayed["payload"], &body);
        prop_assert_eq!(&relayed["correlation_id"], &json!(Uuid::from_u128(3)));
    });
}

#[test]
fn prop_server_kinds_never_accepted_from_clients() {
    proptest!(|(count in 0usize..100)| {
        for kind in Kind::ALL.into_iter().filter(|k| k.is_server_emitted()) {
            let payload = if kind == Kind::Error {
                json!({ "code": "x", "message": "y" })
            } else {
                json!({ "member_count": count })
            };
            let text = json!({ "type": kind.as_str(), "payload": payload }).to_string();
            prop_assert_eq!(ClientFrame::parse(&text), Err(ProtocolError::ServerOnly(kind)));
        }
    });
}
