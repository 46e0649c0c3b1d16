//! Channels, presence membership and the per-client channel registry.
//!
//! The registry is owned by the session task; nothing here is shared across
//! threads or locked.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;
use tracing::warn;

use crate::protocol::{id_from_value, Message, PresenceSnapshot};

const PRESENCE_PREFIX: &str = "presence-";
const PRIVATE_PREFIX: &str = "private-";

/// Channel type, derived from the name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

impl ChannelKind {
    /// `presence-…` → presence, `private-…` → private, anything else → public.
    pub fn from_name(name: &str) -> Self {
        if name.starts_with(PRESENCE_PREFIX) {
            Self::Presence
        } else if name.starts_with(PRIVATE_PREFIX) {
            Self::Private
        } else {
            Self::Public
        }
    }

    /// Private and presence channels need an authorization string.
    pub fn requires_auth(self) -> bool {
        !matches!(self, Self::Public)
    }
}

/// Where a channel is in its subscribe handshake on the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionStatus {
    /// Registered, handshake not started (or reset by a disconnect).
    #[default]
    Unsubscribed,
    /// Waiting for the authorization exchange.
    Authorizing,
    /// Subscribe frame sent, waiting for `subscription_succeeded`.
    Pending,
    /// Confirmed by the service.
    Subscribed,
}

/// A presence channel member.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub id: String,
    pub info: Value,
}

/// Presence membership keyed by member id.
#[derive(Debug, Clone, Default)]
pub struct Members {
    members: HashMap<String, Value>,
    me: Option<String>,
}

impl Members {
    /// Add a member, replacing the info of an existing id. Returns the
    /// member as stored.
    pub fn add(&mut self, id: impl Into<String>, info: Value) -> Member {
        let id = id.into();
        self.members.insert(id.clone(), info.clone());
        Member { id, info }
    }

    /// Remove a member. Removing an absent id is a no-op and returns `None`.
    pub fn remove(&mut self, id: &str) -> Option<Member> {
        self.members.remove(id).map(|info| Member {
            id: id.to_string(),
            info,
        })
    }

    pub fn get(&self, id: &str) -> Option<Member> {
        self.members.get(id).map(|info| Member {
            id: id.to_string(),
            info: info.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The local client's own member id, once subscribed.
    pub fn my_id(&self) -> Option<&str> {
        self.me.as_deref()
    }

    /// Snapshot of all members, ordered by id.
    pub fn to_vec(&self) -> Vec<Member> {
        let mut out: Vec<Member> = self
            .members
            .iter()
            .map(|(id, info)| Member {
                id: id.clone(),
                info: info.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Replace the membership with a `subscription_succeeded` snapshot.
    fn hydrate(&mut self, snapshot: PresenceSnapshot, fallback_me: Option<String>) {
        self.members = snapshot.hash;
        self.me = snapshot.me.or(fallback_me);
    }

    fn clear(&mut self) {
        self.members.clear();
        self.me = None;
    }
}

/// Presence-only channel state.
#[derive(Debug, Clone)]
pub struct PresenceState {
    user_data: Value,
    members: Members,
}

impl PresenceState {
    /// User data sent with every authorization and subscribe.
    pub fn user_data(&self) -> &Value {
        &self.user_data
    }

    pub fn members(&self) -> &Members {
        &self.members
    }

    pub fn members_mut(&mut self) -> &mut Members {
        &mut self.members
    }

    /// `user_data` as the `channel_data` string sent on the wire.
    pub fn channel_data(&self) -> String {
        self.user_data.to_string()
    }

    fn user_id(&self) -> Option<String> {
        self.user_data.get("user_id").and_then(id_from_value)
    }
}

/// Channel variant. Presence-only data lives on the presence arm.
#[derive(Debug, Clone)]
pub enum ChannelVariant {
    Public,
    Private,
    Presence(PresenceState),
}

/// A message handler registered on a channel.
pub type Handler = Box<dyn Fn(&Message) + Send + Sync + 'static>;

struct Binding {
    /// `None` matches every event.
    event: Option<String>,
    handler: Handler,
}

/// A registered channel.
pub struct Channel {
    name: String,
    variant: ChannelVariant,
    status: SubscriptionStatus,
    bindings: Vec<Binding>,
}

impl Channel {
    /// Build the variant matching the name prefix. `user_data` is only kept
    /// for presence channels.
    pub fn new(name: impl Into<String>, user_data: Option<Value>) -> Self {
        let name = name.into();
        let variant = match ChannelKind::from_name(&name) {
            ChannelKind::Public => ChannelVariant::Public,
            ChannelKind::Private => ChannelVariant::Private,
            ChannelKind::Presence => ChannelVariant::Presence(PresenceState {
                user_data: user_data.unwrap_or(Value::Null),
                members: Members::default(),
            }),
        };
        Self {
            name,
            variant,
            status: SubscriptionStatus::Unsubscribed,
            bindings: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelKind {
        match self.variant {
            ChannelVariant::Public => ChannelKind::Public,
            ChannelVariant::Private => ChannelKind::Private,
            ChannelVariant::Presence(_) => ChannelKind::Presence,
        }
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status
    }

    pub fn set_status(&mut self, status: SubscriptionStatus) {
        self.status = status;
    }

    pub fn is_subscribed(&self) -> bool {
        self.status == SubscriptionStatus::Subscribed
    }

    pub fn as_presence(&self) -> Option<&PresenceState> {
        match &self.variant {
            ChannelVariant::Presence(presence) => Some(presence),
            _ => None,
        }
    }

    pub fn as_presence_mut(&mut self) -> Option<&mut PresenceState> {
        match &mut self.variant {
            ChannelVariant::Presence(presence) => Some(presence),
            _ => None,
        }
    }

    /// Mark the channel subscribed. For presence channels the membership is
    /// hydrated from the snapshot, and the local member id falls back to the
    /// `user_id` this client sent.
    pub fn confirm_subscription(&mut self, snapshot: Option<PresenceSnapshot>) {
        self.status = SubscriptionStatus::Subscribed;
        if let Some(presence) = self.as_presence_mut() {
            let fallback = presence.user_id();
            presence
                .members
                .hydrate(snapshot.unwrap_or_default(), fallback);
        }
    }

    /// Bind a handler to one event name, or to all events with `None`.
    pub fn bind(&mut self, event: Option<String>, handler: Handler) {
        self.bindings.push(Binding { event, handler });
    }

    /// Remove handlers for one event, or every handler with `None`.
    /// Returns how many were removed.
    pub fn unbind(&mut self, event: Option<&str>) -> usize {
        let before = self.bindings.len();
        match event {
            Some(event) => self
                .bindings
                .retain(|b| b.event.as_deref() != Some(event)),
            None => self.bindings.clear(),
        }
        before - self.bindings.len()
    }

    /// Run every matching handler in registration order. A panicking handler
    /// is logged and skipped. Returns the number of handlers invoked.
    pub fn dispatch(&self, message: &Message) -> usize {
        let mut invoked = 0;
        for binding in &self.bindings {
            if binding
                .event
                .as_deref()
                .is_some_and(|event| event != message.event)
            {
                continue;
            }
            invoked += 1;
            if catch_unwind(AssertUnwindSafe(|| (binding.handler)(message))).is_err() {
                warn!(
                    channel = %self.name,
                    event = %message.event,
                    "channel handler panicked; continuing with remaining handlers"
                );
            }
        }
        invoked
    }

    /// A detached snapshot for callers outside the session.
    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            name: self.name.clone(),
            kind: self.kind(),
            status: self.status,
            bindings: self.bindings.len(),
            presence: self.as_presence().map(|p| PresenceInfo {
                members: p.members.to_vec(),
                my_id: p.members.my_id().map(str::to_string),
            }),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("variant", &self.variant)
            .field("status", &self.status)
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

/// Point-in-time view of a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub name: String,
    pub kind: ChannelKind,
    pub status: SubscriptionStatus,
    /// Number of bound handlers.
    pub bindings: usize,
    presence: Option<PresenceInfo>,
}

impl ChannelInfo {
    pub fn is_subscribed(&self) -> bool {
        self.status == SubscriptionStatus::Subscribed
    }

    /// Presence data; `None` for public and private channels.
    pub fn presence(&self) -> Option<&PresenceInfo> {
        self.presence.as_ref()
    }
}

/// Point-in-time view of a presence channel's membership.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceInfo {
    /// Members ordered by id.
    pub members: Vec<Member>,
    pub my_id: Option<String>,
}

impl PresenceInfo {
    pub fn member(&self, id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// The local client's own member entry.
    pub fn me(&self) -> Option<&Member> {
        self.my_id.as_deref().and_then(|id| self.member(id))
    }
}

// ── Registry ────────────────────────────────────────────────────────

/// All channels registered on one client, keyed by name.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<String, Channel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel if it is not already present. Returns `true` when a
    /// new channel was created; an existing channel keeps its user data.
    pub fn register(&mut self, name: &str, user_data: Option<Value>) -> bool {
        if self.channels.contains_key(name) {
            return false;
        }
        self.channels
            .insert(name.to_string(), Channel::new(name, user_data));
        true
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Channel> {
        self.channels.remove(name)
    }

    /// Drop every channel.
    pub fn clear(&mut self) {
        self.channels.clear();
    }

    /// Reset every channel to unsubscribed after the transport is lost.
    /// Presence membership is cleared too; it is re-hydrated on resubscribe.
    pub fn mark_all_unsubscribed(&mut self) {
        for channel in self.channels.values_mut() {
            channel.status = SubscriptionStatus::Unsubscribed;
            if let Some(presence) = channel.as_presence_mut() {
                presence.members.clear();
            }
        }
    }

    /// Names of channels whose handshake has not started.
    pub fn unsubscribed(&self) -> Vec<String> {
        self.channels
            .values()
            .filter(|c| c.status == SubscriptionStatus::Unsubscribed)
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
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
    use std::sync::{Arc, Mutex};

    #[test]
    fn kind_is_a_pure_function_of_prefix() {
        let cases = [
            ("presence-room", ChannelKind::Presence),
            ("presence-", ChannelKind::Presence),
            ("private-orders", ChannelKind::Private),
            ("private-presence-x", ChannelKind::Private),
            ("presence-private-x", ChannelKind::Presence),
            ("orders", ChannelKind::Public),
            ("Private-orders", ChannelKind::Public),
            ("", ChannelKind::Public),
            ("xprivate-a", ChannelKind::Public),
        ];
        for (name, expected) in cases {
            assert_eq!(ChannelKind::from_name(name), expected, "{name:?}");
            assert_eq!(ChannelKind::from_name(name), ChannelKind::from_name(name));
        }
    }

    #[test]
    fn members_add_is_idempotent_and_replaces_info() {
        let mut members = Members::default();
        members.add("u1", json!({"name": "old"}));
        members.add("u1", json!({"name": "new"}));
        assert_eq!(members.len(), 1);
        assert_eq!(members.get("u1").unwrap().info, json!({"name": "new"}));
    }

    #[test]
    fn removing_absent_member_is_a_no_op() {
        let mut members = Members::default();
        members.add("u1", Value::Null);
        assert!(members.remove("ghost").is_none());
        assert_eq!(members.len(), 1);
        assert_eq!(members.remove("u1").unwrap().id, "u1");
        assert!(members.remove("u1").is_none());
        assert!(members.is_empty());
    }

    #[test]
    fn presence_accessor_narrows_variant() {
        assert!(Channel::new("orders", None).as_presence().is_none());
        assert!(Channel::new("private-orders", None).as_presence().is_none());
        let presence = Channel::new("presence-room", Some(json!({"user_id": "u1"})));
        assert_eq!(
            presence.as_presence().unwrap().channel_data(),
            r#"{"user_id":"u1"}"#
        );
    }

    #[test]
    fn confirm_hydrates_members_and_me() {
        let mut channel = Channel::new("presence-room", Some(json!({"user_id": "u1"})));
        let snapshot: PresenceSnapshot = serde_json::from_value(json!({
            "hash": {"u1": {"n": 1}, "u2": {"n": 2}},
            "me": "u1"
        }))
        .unwrap();
        channel.confirm_subscription(Some(snapshot));

        let info = channel.info();
        assert!(info.is_subscribed());
        let presence = info.presence().unwrap();
        assert_eq!(presence.count(), 2);
        assert_eq!(presence.my_id.as_deref(), Some("u1"));
        assert_eq!(presence.me().unwrap().info, json!({"n": 1}));
    }

    #[test]
    fn my_id_falls_back_to_sent_user_id() {
        let mut channel = Channel::new("presence-room", Some(json!({"user_id": 42})));
        channel.confirm_subscription(None);
        assert_eq!(channel.info().presence().unwrap().my_id.as_deref(), Some("42"));
    }

    #[test]
    fn handlers_run_in_registration_order_and_survive_panics() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut channel = Channel::new("orders", None);

        let s = Arc::clone(&seen);
        channel.bind(Some("created".into()), Box::new(move |_: &Message| s.lock().unwrap().push("first")));
        channel.bind(Some("created".into()), Box::new(|_: &Message| panic!("handler bug")));
        let s = Arc::clone(&seen);
        channel.bind(None, Box::new(move |_: &Message| s.lock().unwrap().push("all")));
        let s = Arc::clone(&seen);
        channel.bind(Some("created".into()), Box::new(move |_: &Message| s.lock().unwrap().push("third")));
        let s = Arc::clone(&seen);
        channel.bind(Some("deleted".into()), Box::new(move |_: &Message| s.lock().unwrap().push("other")));

        let invoked = channel.dispatch(&Message::new("created", Value::Null));
        assert_eq!(invoked, 4);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "all", "third"]);
    }

    #[test]
    fn unbind_removes_only_named_event() {
        let mut channel = Channel::new("orders", None);
        channel.bind(Some("a".into()), Box::new(|_: &Message| {}));
        channel.bind(Some("b".into()), Box::new(|_: &Message| {}));
        channel.bind(None, Box::new(|_: &Message| {}));
        assert_eq!(channel.unbind(Some("a")), 1);
        assert_eq!(channel.info().bindings, 2);
        assert_eq!(channel.unbind(None), 2);
    }

    #[test]
    fn registry_register_is_idempotent() {
        let mut registry = ChannelRegistry::new();
        assert!(registry.register("presence-room", Some(json!({"user_id": "a"}))));
        assert!(!registry.register("presence-room", Some(json!({"user_id": "b"}))));
        assert_eq!(registry.len(), 1);
        let presence = registry.get("presence-room").unwrap().as_presence().unwrap();
        assert_eq!(presence.user_data(), &json!({"user_id": "a"}));
    }

    #[test]
    fn mark_all_unsubscribed_resets_status_and_members() {
        let mut registry = ChannelRegistry::new();
        registry.register("orders", None);
        registry.register("presence-room", Some(json!({"user_id": "a"})));
        for name in ["orders", "presence-room"] {
            registry.get_mut(name).unwrap().confirm_subscription(None);
        }
        assert!(registry.unsubscribed().is_empty());

        registry.mark_all_unsubscribed();
        assert_eq!(registry.unsubscribed(), vec!["orders", "presence-room"]);
        let presence = registry.get("presence-room").unwrap().as_presence().unwrap();
        assert!(presence.members().is_empty());
        assert_eq!(presence.members().my_id(), None);
    }
}
