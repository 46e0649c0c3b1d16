#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Wire-format tests for the Pulsewire protocol.
//!
//! Fixtures are written byte by byte or as literal JSON so that a change to
//! the encoder cannot silently move both sides of a comparison.

use serde_json::{json, Value};

use pulsewire_client::codec::{self, BinaryMessageType, DecodeError, OutboundEncoding, HEADER_LEN};
use pulsewire_client::error_codes::{ErrorCode, ReconnectStrategy};
use pulsewire_client::protocol::{
    ConnectionEstablished, ControlEvent, Credential, ErrorPayload, MemberAdded, Namespace,
    SubscribePayload, SubscriptionSucceeded,
};
use pulsewire_client::{Frame, Message};

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

/// Build a binary frame from a raw type tag and payload.
fn frame(tag: u32, payload: &[u8]) -> Vec<u8> {
    let mut bytes = tag.to_le_bytes().to_vec();
    bytes.extend_from_slice(&u32::try_from(payload.len()).unwrap().to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// `metadataLength | metadata | tail` payload for type `0x02`.
fn metadata_payload(metadata: &[u8], tail: &[u8]) -> Vec<u8> {
    let mut payload = u32::try_from(metadata.len()).unwrap().to_le_bytes().to_vec();
    payload.extend_from_slice(metadata);
    payload.extend_from_slice(tail);
    payload
}

// ════════════════════════════════════════════════════════════════════
// Text frames
// ════════════════════════════════════════════════════════════════════

#[test]
fn text_frame_fixture_decodes() {
    let message = codec::decode(&Frame::Text(
        r#"{"event":"order-created","channel":"private-orders","data":{"id":7}}"#.into(),
    ))
    .unwrap();
    assert_eq!(message.event, "order-created");
    assert_eq!(message.channel.as_deref(), Some("private-orders"));
    assert_eq!(message.data, json!({"id": 7}));
    assert_eq!(message.binary_data, None);
}

#[test]
fn missing_data_decodes_as_null() {
    let message = codec::decode_text(r#"{"event":"pulsewire:ping"}"#).unwrap();
    assert_eq!(message.data, Value::Null);
    assert_eq!(message.channel, None);
}

#[test]
fn string_data_holding_json_is_parsed_once() {
    let message =
        codec::decode_text(r#"{"event":"e","data":"{\"nested\":\"[1,2]\"}"}"#).unwrap();
    assert_eq!(message.data, json!({"nested": "[1,2]"}));

    let plain = codec::decode_text(r#"{"event":"e","data":"{not json"}"#).unwrap();
    assert_eq!(plain.data, json!("{not json"));
}

#[test]
fn text_frame_without_event_is_invalid_json() {
    let err = codec::decode_text(r#"{"data":1}"#).unwrap_err();
    assert!(matches!(err, DecodeError::InvalidJson(_)));
}

#[test]
fn text_encoding_omits_empty_fields() {
    let ping = Namespace::default().message(ControlEvent::Ping, Value::Null);
    assert_eq!(codec::encode_text(&ping).unwrap(), r#"{"event":"pulsewire:ping"}"#);

    let client_event = Message::new("client-typing", json!(true)).with_channel("private-chat");
    let encoded: Value = serde_json::from_str(&codec::encode_text(&client_event).unwrap()).unwrap();
    assert_eq!(
        encoded,
        json!({"event": "client-typing", "channel": "private-chat", "data": true})
    );
}

// ════════════════════════════════════════════════════════════════════
// Binary frames
// ════════════════════════════════════════════════════════════════════

#[test]
fn json_binary_frame_fixture_decodes() {
    let bytes = frame(0x01, br#"{"event":"tick","data":[1,2,3]}"#);
    let message = codec::decode(&Frame::Binary(bytes)).unwrap();
    assert_eq!(message.event, "tick");
    assert_eq!(message.data, json!([1, 2, 3]));
}

#[test]
fn metadata_binary_frame_fixture_decodes() {
    let payload = metadata_payload(br#"{"event":"upload","channel":"files"}"#, &[0, 159, 146, 150]);
    let message = codec::decode_binary(&frame(0x02, &payload)).unwrap();
    assert_eq!(message.event, "upload");
    assert_eq!(message.channel.as_deref(), Some("files"));
    assert_eq!(message.binary_data, Some(vec![0, 159, 146, 150]));
}

#[test]
fn metadata_frame_with_empty_tail_has_empty_binary_data() {
    let payload = metadata_payload(br#"{"event":"upload"}"#, &[]);
    let message = codec::decode_binary(&frame(0x02, &payload)).unwrap();
    assert_eq!(message.binary_data, Some(Vec::new()));
}

#[test]
fn compressed_frame_is_passed_through_as_json() {
    let message = codec::decode_binary(&frame(0x03, br#"{"event":"zipped"}"#)).unwrap();
    assert_eq!(message.event, "zipped");
}

#[test]
fn json_bytes_in_a_binary_frame_are_accepted() {
    let message = codec::decode(&Frame::Binary(br#" {"event":"raw","data":1}"#.to_vec())).unwrap();
    assert_eq!(message.event, "raw");
    assert_eq!(message.data, json!(1));
}

#[test]
fn truncated_metadata_is_reported_as_truncation() {
    // metadataLength says 20, only 15 metadata bytes follow.
    let mut payload = 20u32.to_le_bytes().to_vec();
    payload.extend_from_slice(br#"{"event":"abcd""#);
    assert_eq!(payload.len(), 4 + 15);

    let err = codec::decode_binary(&frame(0x02, &payload)).unwrap_err();
    assert!(
        matches!(
            err,
            DecodeError::MetadataTruncated {
                declared: 20,
                available: 15
            }
        ),
        "got {err:?}"
    );
    assert!(err.to_string().contains("truncated"));
}

#[test]
fn malformed_binary_frames_are_classified() {
    assert!(codec::decode_binary(&[1, 0, 0]).unwrap_err().is_not_binary());

    assert!(matches!(
        codec::decode_binary(&frame(0x07, b"{}")).unwrap_err(),
        DecodeError::UnknownMessageType(7)
    ));
    assert!(matches!(
        codec::decode_binary(&frame(0x01, b"")).unwrap_err(),
        DecodeError::EmptyPayload
    ));

    let mut short = frame(0x01, br#"{"event":"x"}"#);
    short.truncate(HEADER_LEN + 4);
    assert!(matches!(
        codec::decode_binary(&short).unwrap_err(),
        DecodeError::Truncated {
            declared: 13,
            available: 4
        }
    ));

    assert!(matches!(
        codec::decode_binary(&frame(0x02, &[1, 0])).unwrap_err(),
        DecodeError::MissingMetadataLength { available: 2 }
    ));
    assert!(matches!(
        codec::decode_binary(&frame(0x01, &[0xff, 0xfe])).unwrap_err(),
        DecodeError::InvalidUtf8(_)
    ));
}

#[test]
fn binary_json_encoding_matches_fixture_layout() {
    let message = Message::new("tick", Value::Null);
    let bytes = codec::encode_binary(BinaryMessageType::Json, &message).unwrap();
    assert_eq!(bytes, frame(0x01, br#"{"event":"tick"}"#));
}

#[test]
fn binary_with_metadata_encoding_carries_the_tail() {
    let message = Message::new("upload", json!({"name": "a.bin"}))
        .with_channel("files")
        .with_binary_data(vec![1, 2, 3]);
    let bytes = codec::encode_binary(BinaryMessageType::BinaryWithMetadata, &message).unwrap();

    assert_eq!(bytes[..4], 2u32.to_le_bytes());
    let decoded = codec::decode_binary(&bytes).unwrap();
    assert_eq!(decoded, message);
}

#[test]
fn outbound_encoding_selects_frame_kind() {
    let message = Message::new("e", json!(1));
    assert!(matches!(
        codec::encode(&message, OutboundEncoding::Text).unwrap(),
        Frame::Text(_)
    ));
    let Frame::Binary(bytes) = codec::encode(&message, OutboundEncoding::Binary).unwrap() else {
        panic!("expected binary frame");
    };
    assert_eq!(bytes[..4], 1u32.to_le_bytes());
}

// ════════════════════════════════════════════════════════════════════
// Control payloads
// ════════════════════════════════════════════════════════════════════

#[test]
fn namespace_classifies_only_its_own_events() {
    let ns = Namespace::new("acme");
    assert_eq!(ns.classify("acme:member_added"), Some(ControlEvent::MemberAdded));
    assert_eq!(ns.classify("acme:unknown"), None);
    assert_eq!(ns.classify("pulsewire:ping"), None);
    assert_eq!(ns.classify("order-created"), None);
    assert_eq!(ns.event(ControlEvent::SubscriptionError), "acme:subscription_error");
}

#[test]
fn connection_established_fixture() {
    let message = codec::decode_text(
        r#"{"event":"pulsewire:connection_established","data":"{\"socket_id\":\"123.456\",\"activity_timeout\":30}"}"#,
    )
    .unwrap();
    let payload: ConnectionEstablished = message.payload().unwrap();
    assert_eq!(payload.socket_id, "123.456");
    assert_eq!(payload.activity_timeout, Some(30));
}

#[test]
fn subscribe_payload_omits_absent_auth() {
    let public = SubscribePayload {
        channel: "news".into(),
        auth: None,
        channel_data: None,
    };
    assert_eq!(serde_json::to_value(&public).unwrap(), json!({"channel": "news"}));
}

#[test]
fn presence_snapshot_fixture_accepts_numeric_ids() {
    let payload: SubscriptionSucceeded = serde_json::from_value(json!({
        "presence": {"hash": {"1": {"name": "a"}, "2": null}, "me": 1, "count": 2}
    }))
    .unwrap();
    let presence = payload.presence.unwrap();
    assert_eq!(presence.me.as_deref(), Some("1"));
    assert_eq!(presence.hash.len(), 2);
}

#[test]
fn member_added_rejects_non_scalar_ids() {
    let ok: MemberAdded = serde_json::from_value(json!({"user_id": 5})).unwrap();
    assert_eq!(ok.user_id, "5");
    assert_eq!(ok.user_info, Value::Null);
    assert!(serde_json::from_value::<MemberAdded>(json!({"user_id": {"x": 1}})).is_err());
}

#[test]
fn error_payload_and_codes() {
    let payload: ErrorPayload =
        serde_json::from_value(json!({"code": 4100, "message": "Over capacity"})).unwrap();
    assert_eq!(payload.code, Some(4100));

    let code = ErrorCode::from_code(4100).unwrap();
    assert_eq!(code, ErrorCode::OverCapacity);
    assert_eq!(code.strategy(), ReconnectStrategy::Backoff);
    assert_eq!(ReconnectStrategy::for_code(Some(4009)), ReconnectStrategy::Fatal);
    assert_eq!(ReconnectStrategy::for_code(Some(4250)), ReconnectStrategy::Immediate);
    assert_eq!(ReconnectStrategy::for_code(Some(4301)), ReconnectStrategy::Informational);
    assert_eq!(ReconnectStrategy::for_code(None), ReconnectStrategy::Informational);
}

// ════════════════════════════════════════════════════════════════════
// Credentials
// ════════════════════════════════════════════════════════════════════

#[test]
fn credentials_are_classified_by_prefix() {
    assert!(matches!(Credential::parse("sk_live_1"), Credential::SecretKey(_)));
    assert!(matches!(Credential::parse("pk_live_1"), Credential::PublicKey(_)));
    assert!(matches!(Credential::parse("ct_abc"), Credential::ChannelToken(_)));
    assert!(matches!(Credential::parse("278d425bdf160c739803"), Credential::Legacy(_)));

    assert!(Credential::parse("pk_x").requires_discovery());
    assert!(!Credential::parse("sk_x").requires_discovery());
    assert!(!Credential::parse("legacy").awaits_connection_established());
    assert!(Credential::parse("sk_x").awaits_connection_established());
}

#[test]
fn credential_debug_never_prints_the_secret() {
    let rendered = format!("{:?}", Credential::parse("sk_live_topsecret"));
    assert!(!rendered.contains("topsecret"));
}
