//! Wire-level protocol types for the Pulsewire duplex connection.
//!
//! Every frame, text or binary, carries a [`Message`] envelope
//! `{event, data, channel?}`. Control events are namespaced as
//! `<ns>:<name>` (for example `pulsewire:subscribe`); see [`Namespace`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

// ── Message envelope ────────────────────────────────────────────────

/// A decoded message exchanged over the duplex connection.
///
/// `binary_data` is never part of the JSON form. It is populated only when
/// the message arrived as a binary-with-metadata frame, and is written as the
/// raw tail when encoding one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Event name, either a namespaced control event or an application event.
    pub event: String,
    /// Event payload. `null` when absent.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Channel the event belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Raw binary tail of a binary-with-metadata frame.
    #[serde(skip)]
    pub binary_data: Option<Vec<u8>>,
}

impl Message {
    /// Create a message with no channel.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            channel: None,
            binary_data: None,
        }
    }

    /// Attach a channel name.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Attach a binary tail.
    #[must_use]
    pub fn with_binary_data(mut self, bytes: Vec<u8>) -> Self {
        self.binary_data = Some(bytes);
        self
    }

    /// Deserialize `data` into a typed payload.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

// ── Control events ──────────────────────────────────────────────────

/// Protocol-reserved control events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlEvent {
    Ping,
    Pong,
    ConnectionEstablished,
    Subscribe,
    Unsubscribe,
    SubscriptionSucceeded,
    SubscriptionError,
    MemberAdded,
    MemberRemoved,
    Error,
}

impl ControlEvent {
    const ALL: [Self; 10] = [
        Self::Ping,
        Self::Pong,
        Self::ConnectionEstablished,
        Self::Subscribe,
        Self::Unsubscribe,
        Self::SubscriptionSucceeded,
        Self::SubscriptionError,
        Self::MemberAdded,
        Self::MemberRemoved,
        Self::Error,
    ];

    /// The un-namespaced event name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::ConnectionEstablished => "connection_established",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::SubscriptionSucceeded => "subscription_succeeded",
            Self::SubscriptionError => "subscription_error",
            Self::MemberAdded => "member_added",
            Self::MemberRemoved => "member_removed",
            Self::Error => "error",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control event namespace (`pulsewire` by default).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    /// Create a namespace. The `:` separator is added automatically.
    pub fn new(name: impl Into<String>) -> Self {
        let mut prefix = name.into();
        prefix.push(':');
        Self { prefix }
    }

    /// Fully qualified name for a control event, e.g. `pulsewire:ping`.
    pub fn event(&self, control: ControlEvent) -> String {
        format!("{}{}", self.prefix, control.as_str())
    }

    /// Classify an inbound event name. Returns `None` for application events
    /// and for unknown names inside the namespace.
    pub fn classify(&self, event: &str) -> Option<ControlEvent> {
        event
            .strip_prefix(self.prefix.as_str())
            .and_then(ControlEvent::from_name)
    }

    /// Build a control message with the given payload.
    pub fn message(&self, control: ControlEvent, data: Value) -> Message {
        Message::new(self.event(control), data)
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new("pulsewire")
    }
}

// ── Control payloads ────────────────────────────────────────────────

/// Payload of `<ns>:connection_established`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEstablished {
    /// Service-assigned connection id.
    pub socket_id: String,
    /// Inactivity window advertised by the service, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_timeout: Option<u64>,
}

/// Payload of `<ns>:subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<String>,
}

/// Payload of `<ns>:unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribePayload {
    pub channel: String,
}

/// Presence snapshot embedded in a presence channel's
/// `subscription_succeeded` payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PresenceSnapshot {
    /// Member info keyed by member id.
    #[serde(default)]
    pub hash: HashMap<String, Value>,
    /// The local client's own member id.
    #[serde(default, deserialize_with = "optional_id")]
    pub me: Option<String>,
}

/// Payload of `<ns>:subscription_succeeded`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SubscriptionSucceeded {
    #[serde(default)]
    pub presence: Option<PresenceSnapshot>,
}

/// Payload of `<ns>:member_added`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MemberAdded {
    #[serde(deserialize_with = "id")]
    pub user_id: String,
    #[serde(default)]
    pub user_info: Value,
}

/// Payload of `<ns>:member_removed`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MemberRemoved {
    #[serde(deserialize_with = "id")]
    pub user_id: String,
}

/// Payload of `<ns>:error`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub message: String,
}

/// Member ids arrive as strings or numbers; both are normalized to strings.
pub(crate) fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    id_from_value(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected string or number id, got {value}")))
}

fn optional_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(None);
    }
    id_from_value(&value)
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom(format!("expected string or number id, got {value}")))
}

// ── Credentials ─────────────────────────────────────────────────────

/// An application credential, classified by its literal prefix.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// `sk_…`: server-only key with full API access.
    SecretKey(String),
    /// `pk_…`: subscriber key; connects through discovery.
    PublicKey(String),
    /// `ct_…`: short-lived channel token issued by the authorization exchange.
    ChannelToken(String),
    /// Any other string: a shared-secret application key.
    Legacy(String),
}

impl Credential {
    /// Classify a raw credential string.
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.starts_with("sk_") {
            Self::SecretKey(raw)
        } else if raw.starts_with("pk_") {
            Self::PublicKey(raw)
        } else if raw.starts_with("ct_") {
            Self::ChannelToken(raw)
        } else {
            Self::Legacy(raw)
        }
    }

    /// The raw credential string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::SecretKey(s) | Self::PublicKey(s) | Self::ChannelToken(s) | Self::Legacy(s) => s,
        }
    }

    /// Whether a discovery round-trip must precede the transport open.
    pub fn requires_discovery(&self) -> bool {
        matches!(self, Self::PublicKey(_))
    }

    /// Whether `connected` additionally requires a `connection_established`
    /// frame. Legacy keys are connected as soon as the transport opens.
    pub fn awaits_connection_established(&self) -> bool {
        !matches!(self, Self::Legacy(_))
    }
}

// Keys are secrets; keep them out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::SecretKey(_) => "SecretKey",
            Self::PublicKey(_) => "PublicKey",
            Self::ChannelToken(_) => "ChannelToken",
            Self::Legacy(_) => "Legacy",
        };
        write!(f, "{kind}(..)")
    }
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

    #[test]
    fn message_omits_absent_fields() {
        let msg = Message::new("pulsewire:ping", Value::Null);
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"event":"pulsewire:ping"}"#
        );
    }

    #[test]
    fn message_never_serializes_binary_tail() {
        let msg = Message::new("upload", json!({"name": "a.bin"})).with_binary_data(vec![1, 2, 3]);
        let v: Value = serde_json::to_value(&msg).unwrap();
        assert!(v.get("binary_data").is_none());
    }

    #[test]
    fn namespace_round_trips_every_control_event() {
        let ns = Namespace::new("acme");
        for control in ControlEvent::ALL {
            assert_eq!(ns.classify(&ns.event(control)), Some(control));
        }
        assert_eq!(ns.classify("pulsewire:ping"), None);
        assert_eq!(ns.classify("acme:bogus"), None);
        assert_eq!(ns.classify("order-created"), None);
    }

    #[test]
    fn presence_snapshot_accepts_numeric_ids() {
        let payload: SubscriptionSucceeded = serde_json::from_value(json!({
            "presence": {"hash": {"7": {"name": "Ada"}}, "me": 7}
        }))
        .unwrap();
        let presence = payload.presence.unwrap();
        assert_eq!(presence.me.as_deref(), Some("7"));
        assert_eq!(presence.hash["7"], json!({"name": "Ada"}));
    }

    #[test]
    fn member_added_rejects_object_id() {
        let err = serde_json::from_value::<MemberAdded>(json!({"user_id": {"x": 1}}));
        assert!(err.is_err());
    }

    #[test]
    fn credential_prefixes() {
        assert!(matches!(Credential::parse("sk_live_1"), Credential::SecretKey(_)));
        assert!(matches!(Credential::parse("pk_live_1"), Credential::PublicKey(_)));
        assert!(matches!(Credential::parse("ct_abc"), Credential::ChannelToken(_)));
        assert!(matches!(Credential::parse("app-key"), Credential::Legacy(_)));
        assert!(Credential::parse("pk_x").requires_discovery());
        assert!(!Credential::parse("legacy").awaits_connection_established());
    }

    #[test]
    fn credential_debug_hides_secret() {
        let rendered = format!("{:?}", Credential::parse("sk_super_secret"));
        assert_eq!(rendered, "SecretKey(..)");
    }
}
