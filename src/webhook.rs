//! Webhook verification and parsing.
//!
//! The service signs each webhook body with the application secret and sends
//! the key and hex signature in request headers. The event taxonomy is not
//! final, so unknown event names are kept as [`WebhookEventKind::Other`].

use serde::Deserialize;
use serde_json::Value;

use crate::error::{PulsewireError, Result};
use crate::signature;

/// Header carrying the application key.
pub const KEY_HEADER: &str = "X-Pulsewire-Key";

/// Header carrying the hex HMAC-SHA256 of the body.
pub const SIGNATURE_HEADER: &str = "X-Pulsewire-Signature";

/// A verified webhook delivery.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Webhook {
    pub time_ms: u64,
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebhookEvent {
    pub name: WebhookEventKind,
    pub channel: String,
    /// Client event name, for `client_event`.
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub socket_id: Option<String>,
    #[serde(default, deserialize_with = "optional_user_id")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum WebhookEventKind {
    ChannelOccupied,
    ChannelVacated,
    MemberAdded,
    MemberRemoved,
    ClientEvent,
    Other(String),
}

impl From<String> for WebhookEventKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "channel_occupied" => Self::ChannelOccupied,
            "channel_vacated" => Self::ChannelVacated,
            "member_added" => Self::MemberAdded,
            "member_removed" => Self::MemberRemoved,
            "client_event" => Self::ClientEvent,
            _ => Self::Other(name),
        }
    }
}

impl WebhookEventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ChannelOccupied => "channel_occupied",
            Self::ChannelVacated => "channel_vacated",
            Self::MemberAdded => "member_added",
            Self::MemberRemoved => "member_removed",
            Self::ClientEvent => "client_event",
            Self::Other(name) => name,
        }
    }
}

fn optional_user_id<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(crate::protocol::id_from_value))
}

/// Check the key header and body signature, then parse the body.
///
/// The key comparison is not secret-dependent; the signature is checked in
/// constant time.
///
/// # Errors
///
/// [`PulsewireError::InvalidWebhook`] for a wrong key or a bad signature,
/// [`PulsewireError::Serialization`] if a correctly signed body is not a
/// webhook payload.
pub fn verify_webhook(
    app_key: &str,
    secret: &str,
    key_header: &str,
    signature_header: &str,
    body: &[u8],
) -> Result<Webhook> {
    if key_header != app_key {
        return Err(PulsewireError::InvalidWebhook(format!(
            "unexpected key {key_header:?}"
        )));
    }
    if !signature::verify(secret, body, signature_header.trim()) {
        return Err(PulsewireError::InvalidWebhook("signature mismatch".into()));
    }
    Ok(serde_json::from_slice(body)?)
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

    const KEY: &str = "app-key";
    const SECRET: &str = "app-secret";

    const BODY: &str = r#"{"time_ms":1700000000000,"events":[
        {"name":"channel_occupied","channel":"orders"},
        {"name":"member_added","channel":"presence-room","user_id":7},
        {"name":"client_event","channel":"private-chat","event":"client-typing","data":"{\"on\":true}","socket_id":"1.2"},
        {"name":"cache_miss","channel":"cache-x"}
    ]}"#;

    #[test]
    fn parses_a_signed_delivery() {
        let sig = signature::sign(SECRET, BODY.as_bytes()).unwrap();
        let webhook = verify_webhook(KEY, SECRET, KEY, &sig, BODY.as_bytes()).unwrap();
        assert_eq!(webhook.time_ms, 1_700_000_000_000);
        assert_eq!(webhook.events.len(), 4);
        assert_eq!(webhook.events[0].name, WebhookEventKind::ChannelOccupied);
        assert_eq!(webhook.events[1].user_id.as_deref(), Some("7"));
        assert_eq!(webhook.events[2].event.as_deref(), Some("client-typing"));
        assert_eq!(webhook.events[2].socket_id.as_deref(), Some("1.2"));
        assert_eq!(
            webhook.events[3].name,
            WebhookEventKind::Other("cache_miss".into())
        );
        assert_eq!(webhook.events[3].name.as_str(), "cache_miss");
    }

    #[test]
    fn wrong_key_is_rejected() {
        let sig = signature::sign(SECRET, BODY.as_bytes()).unwrap();
        let err = verify_webhook(KEY, SECRET, "other-key", &sig, BODY.as_bytes()).unwrap_err();
        assert!(matches!(err, PulsewireError::InvalidWebhook(_)));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let sig = signature::sign(SECRET, BODY.as_bytes()).unwrap();
        let tampered = BODY.replace("orders", "ordert");
        let err = verify_webhook(KEY, SECRET, KEY, &sig, tampered.as_bytes()).unwrap_err();
        assert!(matches!(err, PulsewireError::InvalidWebhook(_)));
    }

    #[test]
    fn signed_garbage_is_a_parse_error() {
        let body = b"not json";
        let sig = signature::sign(SECRET, body).unwrap();
        let err = verify_webhook(KEY, SECRET, KEY, &sig, body).unwrap_err();
        assert!(matches!(err, PulsewireError::Serialization(_)));
    }
}
