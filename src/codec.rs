//! Wire codec: text JSON frames and length-prefixed binary frames.
//!
//! Binary frame layout (all integers little-endian):
//!
//! ```text
//! 0..4   message type  (0x01 JSON, 0x02 binary + metadata, 0x03 compressed)
//! 4..8   payload length
//! 8..    payload
//! ```
//!
//! A `0x02` payload is itself `metadata length (u32) | metadata JSON | tail`.
//! The tail is handed to the caller untouched in [`Message::binary_data`].
//!
//! `0x03` is reserved for compressed payloads. No compression scheme has been
//! agreed on the wire, so the payload is read and written as plain UTF-8 JSON.

use serde_json::Value;
use thiserror::Error;

use crate::protocol::Message;
use crate::transport::Frame;

/// Size of the fixed binary frame header.
pub const HEADER_LEN: usize = 8;

/// Binary frame message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryMessageType {
    /// UTF-8 JSON payload.
    Json,
    /// Metadata JSON followed by a raw binary tail.
    BinaryWithMetadata,
    /// Reserved for compression; currently a plain JSON pass-through.
    Compressed,
}

impl BinaryMessageType {
    /// Numeric wire tag.
    pub fn tag(self) -> u32 {
        match self {
            Self::Json => 0x01,
            Self::BinaryWithMetadata => 0x02,
            Self::Compressed => 0x03,
        }
    }

    fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Json),
            0x02 => Some(Self::BinaryWithMetadata),
            0x03 => Some(Self::Compressed),
            _ => None,
        }
    }
}

/// How outbound messages are framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutboundEncoding {
    /// JSON in a text frame.
    #[default]
    Text,
    /// JSON in a binary frame of type `0x01`.
    Binary,
}

/// A frame that could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The buffer does not carry a binary header at all.
    #[error("not a binary frame: {reason}")]
    NotBinary {
        /// What was missing.
        reason: String,
    },

    /// Header declares a message type outside `0x01..=0x03`.
    #[error("unknown binary message type 0x{0:02x}")]
    UnknownMessageType(u32),

    /// Header declares a zero-length payload.
    #[error("binary frame has an empty payload")]
    EmptyPayload,

    /// Header declares more payload bytes than the frame carries.
    #[error("binary payload truncated: declared {declared} bytes, {available} available")]
    Truncated {
        /// Declared payload length.
        declared: usize,
        /// Bytes actually present after the header.
        available: usize,
    },

    /// A binary-with-metadata payload is too short to hold its metadata length.
    #[error("binary payload too short for a metadata length ({available} bytes)")]
    MissingMetadataLength {
        /// Payload bytes present.
        available: usize,
    },

    /// Metadata length exceeds the bytes remaining in the payload.
    #[error("metadata truncated: declared {declared} bytes, {available} available")]
    MetadataTruncated {
        /// Declared metadata length.
        declared: usize,
        /// Bytes actually present after the metadata length.
        available: usize,
    },

    /// A JSON segment is not valid UTF-8.
    #[error("payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// A JSON segment does not parse as a message.
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl DecodeError {
    /// `true` when the buffer is not a binary protocol frame at all, as opposed
    /// to a binary frame that is malformed.
    pub fn is_not_binary(&self) -> bool {
        matches!(self, Self::NotBinary { .. })
    }
}

/// A message that could not be encoded.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The message could not be serialized.
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A length does not fit the 32-bit length fields.
    #[error("segment of {0} bytes exceeds the 32-bit length field")]
    TooLarge(usize),
}

// ── Decoding ────────────────────────────────────────────────────────

/// Decode a transport frame into a [`Message`].
pub fn decode(frame: &Frame) -> Result<Message, DecodeError> {
    match frame {
        Frame::Text(text) => decode_text(text),
        Frame::Binary(bytes) => decode_binary(bytes),
    }
}

/// Decode a text JSON frame. String `data` holding embedded JSON is parsed
/// once.
pub fn decode_text(text: &str) -> Result<Message, DecodeError> {
    parse_message(text).map(normalize)
}

/// Parse a message envelope exactly as written, without touching `data`.
fn parse_message(text: &str) -> Result<Message, DecodeError> {
    Ok(serde_json::from_str(text)?)
}

/// Decode a binary frame.
///
/// JSON carried inside a binary frame is accepted first and treated like a
/// text frame; only when that fails is the buffer read as a length-prefixed
/// protocol frame. Protocol frame payloads are parsed as written.
pub fn decode_binary(bytes: &[u8]) -> Result<Message, DecodeError> {
    if looks_like_json(bytes) {
        if let Ok(text) = std::str::from_utf8(bytes) {
            if let Ok(message) = decode_text(text) {
                return Ok(message);
            }
        }
    }

    let (tag, rest) = read_u32(bytes).ok_or_else(|| not_binary(bytes.len()))?;
    let (declared, body) = read_u32(rest).ok_or_else(|| not_binary(bytes.len()))?;
    let kind = BinaryMessageType::from_tag(tag).ok_or(DecodeError::UnknownMessageType(tag))?;

    let declared = declared as usize;
    if declared == 0 {
        return Err(DecodeError::EmptyPayload);
    }
    let payload = body.get(..declared).ok_or(DecodeError::Truncated {
        declared,
        available: body.len(),
    })?;

    match kind {
        BinaryMessageType::Json | BinaryMessageType::Compressed => {
            parse_message(std::str::from_utf8(payload)?)
        }
        BinaryMessageType::BinaryWithMetadata => {
            let (meta_len, rest) = read_u32(payload).ok_or(DecodeError::MissingMetadataLength {
                available: payload.len(),
            })?;
            let meta_len = meta_len as usize;
            if meta_len > rest.len() {
                return Err(DecodeError::MetadataTruncated {
                    declared: meta_len,
                    available: rest.len(),
                });
            }
            let (metadata, tail) = rest.split_at(meta_len);
            let mut message = parse_message(std::str::from_utf8(metadata)?)?;
            message.binary_data = Some(tail.to_vec());
            Ok(message)
        }
    }
}

fn not_binary(len: usize) -> DecodeError {
    DecodeError::NotBinary {
        reason: format!("{len} bytes is shorter than the {HEADER_LEN}-byte header"),
    }
}

fn read_u32(bytes: &[u8]) -> Option<(u32, &[u8])> {
    let (head, rest) = bytes.split_first_chunk::<4>()?;
    Some((u32::from_le_bytes(*head), rest))
}

fn looks_like_json(bytes: &[u8]) -> bool {
    matches!(
        bytes.iter().copied().find(|b| !b.is_ascii_whitespace()),
        Some(b'{') | Some(b'[')
    )
}

/// A string `data` holding embedded JSON is parsed once; anything that does
/// not parse stays a string.
fn normalize(mut message: Message) -> Message {
    if let Value::String(raw) = &message.data {
        let trimmed = raw.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
                message.data = parsed;
            }
        }
    }
    message
}

// ── Encoding ────────────────────────────────────────────────────────

/// Encode a message as a text JSON frame body.
pub fn encode_text(message: &Message) -> Result<String, EncodeError> {
    Ok(serde_json::to_string(message)?)
}

/// Encode a message as a binary frame of the given type.
///
/// For [`BinaryMessageType::BinaryWithMetadata`] the message (minus its
/// binary tail) becomes the metadata and `binary_data` becomes the tail.
pub fn encode_binary(kind: BinaryMessageType, message: &Message) -> Result<Vec<u8>, EncodeError> {
    let json = serde_json::to_vec(message)?;
    let payload = match kind {
        BinaryMessageType::Json | BinaryMessageType::Compressed => json,
        BinaryMessageType::BinaryWithMetadata => {
            let tail = message.binary_data.as_deref().unwrap_or_default();
            let mut payload = Vec::with_capacity(4 + json.len() + tail.len());
            payload.extend_from_slice(&length_field(json.len())?);
            payload.extend_from_slice(&json);
            payload.extend_from_slice(tail);
            payload
        }
    };

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&kind.tag().to_le_bytes());
    frame.extend_from_slice(&length_field(payload.len())?);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Encode a message into a transport frame.
pub fn encode(message: &Message, encoding: OutboundEncoding) -> Result<Frame, EncodeError> {
    match encoding {
        OutboundEncoding::Text => encode_text(message).map(Frame::Text),
        OutboundEncoding::Binary => encode_binary(BinaryMessageType::Json, message).map(Frame::Binary),
    }
}

fn length_field(len: usize) -> Result<[u8; 4], EncodeError> {
    u32::try_from(len)
        .map(u32::to_le_bytes)
        .map_err(|_| EncodeError::TooLarge(len))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(tag: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = tag.to_le_bytes().to_vec();
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn text_frame_with_embedded_json_is_normalized() {
        let msg = decode_text(r#"{"event":"order","data":"{\"id\":7}","channel":"orders"}"#).unwrap();
        assert_eq!(msg.data, json!({"id": 7}));
        assert_eq!(msg.channel.as_deref(), Some("orders"));
    }

    #[test]
    fn embedded_json_that_fails_to_parse_stays_a_string() {
        let msg = decode_text(r#"{"event":"note","data":"{not json"}"#).unwrap();
        assert_eq!(msg.data, json!("{not json"));
    }

    #[test]
    fn plain_string_data_is_untouched() {
        let msg = decode_text(r#"{"event":"note","data":"42"}"#).unwrap();
        assert_eq!(msg.data, json!("42"));
    }

    #[test]
    fn json_inside_binary_frame_is_accepted() {
        let msg = decode_binary(br#"  {"event":"tick","data":{"n":1}}"#).unwrap();
        assert_eq!(msg.event, "tick");
        assert_eq!(msg.data, json!({"n": 1}));
    }

    #[test]
    fn type_one_frame_decodes() {
        let bytes = frame(0x01, br#"{"event":"tick"}"#);
        assert_eq!(decode_binary(&bytes).unwrap().event, "tick");
    }

    #[test]
    fn type_three_is_plain_json() {
        let bytes = frame(0x03, br#"{"event":"packed","data":[1,2]}"#);
        let msg = decode_binary(&bytes).unwrap();
        assert_eq!(msg.data, json!([1, 2]));
    }

    #[test]
    fn type_two_keeps_tail_verbatim() {
        let meta = br#"{"event":"file","channel":"uploads"}"#;
        let tail = [0x00, 0xff, 0x10, 0x7b];
        let mut payload = (meta.len() as u32).to_le_bytes().to_vec();
        payload.extend_from_slice(meta);
        payload.extend_from_slice(&tail);

        let msg = decode_binary(&frame(0x02, &payload)).unwrap();
        assert_eq!(msg.event, "file");
        assert_eq!(msg.binary_data.as_deref(), Some(&tail[..]));
    }

    #[test]
    fn short_buffer_is_not_binary() {
        let err = decode_binary(&[0x01, 0x00, 0x00]).unwrap_err();
        assert!(err.is_not_binary());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = decode_binary(&frame(0x09, b"{}")).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownMessageType(0x09)));
        assert!(!err.is_not_binary());
    }

    #[test]
    fn zero_length_payload_is_rejected() {
        let err = decode_binary(&frame(0x01, b"")).unwrap_err();
        assert!(matches!(err, DecodeError::EmptyPayload));
    }

    #[test]
    fn declared_length_beyond_buffer_is_truncation() {
        let mut bytes = 0x01u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(br#"{"event":"x"}"#);
        let err = decode_binary(&bytes).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Truncated {
                declared: 100,
                available: 13
            }
        ));
    }

    #[test]
    fn metadata_length_beyond_payload_is_truncation_not_json_error() {
        let mut payload = 20u32.to_le_bytes().to_vec();
        payload.extend_from_slice(br#"{"event":"abcd""#);
        assert_eq!(payload.len(), 4 + 15);
        let err = decode_binary(&frame(0x02, &payload)).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MetadataTruncated {
                declared: 20,
                available: 15
            }
        ));
    }

    #[test]
    fn unparseable_payload_is_a_json_error() {
        let err = decode_binary(&frame(0x01, b"{oops")).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidJson(_)));
    }

    #[test]
    fn invalid_utf8_payload() {
        let err = decode_binary(&frame(0x01, &[0xc3, 0x28])).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidUtf8(_)));
    }

    #[test]
    fn encoder_writes_exact_header_layout() {
        let msg = Message::new("a", Value::Null);
        let bytes = encode_binary(BinaryMessageType::Json, &msg).unwrap();
        let body = br#"{"event":"a"}"#;
        assert_eq!(&bytes[..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &(body.len() as u32).to_le_bytes());
        assert_eq!(&bytes[8..], body);
    }

    #[test]
    fn metadata_frame_layout() {
        let msg = Message::new("f", Value::Null).with_binary_data(vec![9, 8]);
        let bytes = encode_binary(BinaryMessageType::BinaryWithMetadata, &msg).unwrap();
        let meta = br#"{"event":"f"}"#;
        assert_eq!(&bytes[..4], &[2, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &((4 + meta.len() + 2) as u32).to_le_bytes());
        assert_eq!(&bytes[8..12], &(meta.len() as u32).to_le_bytes());
        assert_eq!(&bytes[12..12 + meta.len()], meta);
        assert_eq!(&bytes[12 + meta.len()..], &[9, 8]);
    }

    #[test]
    fn binary_frames_round_trip_data_as_written() {
        let values = [
            json!("[1,2]"),
            json!("{\"a\":1}"),
            json!("  {\"padded\": true}"),
            json!("plain"),
            json!({"nested": {"list": [1, "two", null], "flag": false}}),
            json!([{"a": "{\"b\":2}"}]),
            json!(12.5),
            Value::Null,
        ];
        for data in values {
            let msg = Message::new("note", data.clone()).with_channel("private-notes");
            for kind in [BinaryMessageType::Json, BinaryMessageType::Compressed] {
                let bytes = encode_binary(kind, &msg).unwrap();
                assert_eq!(decode_binary(&bytes).unwrap(), msg, "{kind:?} with {data}");
            }
        }
    }

    #[test]
    fn metadata_frames_round_trip_data_and_tail() {
        let large: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
        let tails = [Vec::new(), vec![0x00, 0xff], b"{\"looks\":\"json\"}".to_vec(), large];
        let values = [json!("{\"a\":1}"), json!("[true]"), json!({"size": 3}), Value::Null];
        for tail in &tails {
            for data in &values {
                let msg = Message::new("file", data.clone()).with_binary_data(tail.clone());
                let bytes = encode_binary(BinaryMessageType::BinaryWithMetadata, &msg).unwrap();
                let decoded = decode_binary(&bytes).unwrap();
                assert_eq!(decoded.data, *data);
                assert_eq!(decoded.binary_data.as_deref(), Some(tail.as_slice()));
                assert_eq!(decoded, msg);
            }
        }
    }

    #[test]
    fn json_inside_binary_frame_is_normalized_like_text() {
        let msg = decode_binary(br#"{"event":"order","data":"{\"id\":7}"}"#).unwrap();
        assert_eq!(msg.data, json!({"id": 7}));
    }

    #[test]
    fn outbound_encoding_selects_frame_kind() {
        let msg = Message::new("x", json!({"k": 1}));
        assert!(matches!(encode(&msg, OutboundEncoding::Text).unwrap(), Frame::Text(_)));
        let Frame::Binary(bytes) = encode(&msg, OutboundEncoding::Binary).unwrap() else {
            panic!("expected binary frame");
        };
        assert_eq!(decode_binary(&bytes).unwrap(), msg);
    }
}
