//! Server-side publisher for the Pulsewire HTTP control API.
//!
//! Every request is signed with the application secret. GET requests are
//! retried on transport failures and 5xx responses. POST requests are sent
//! once: the service does not deduplicate triggers, so a retried POST could
//! deliver an event twice.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::auth::AuthorizationResult;
use crate::backoff::ReconnectionPolicy;
use crate::channel::ChannelKind;
use crate::error::{PulsewireError, Result};
use crate::signature::{self, sha256_hex};
use crate::validation::{
    validate_channel_name, validate_event_name, validate_payload_size, validate_socket_id,
    validate_user_id, ValidationError, MAX_BATCH_SIZE, MAX_TRIGGER_CHANNELS,
};
use crate::webhook::{self, Webhook};

const DEFAULT_API_HOST: &str = "api.pulsewire.io";
const DEFAULT_API_SCHEME: &str = "https";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_GET_ATTEMPTS: u32 = 3;
const AUTH_VERSION: &str = "1.0";

/// Configuration for a [`Publisher`].
#[derive(Clone)]
pub struct PublisherConfig {
    pub app_id: String,
    /// Application key, sent as `auth_key`.
    pub key: String,
    /// Application secret. Never sent over the wire.
    pub secret: String,
    /// Defaults to **`https`**.
    pub scheme: String,
    /// API host (optionally with port). Defaults to **`api.pulsewire.io`**.
    pub host: String,
    /// Per-request timeout. Defaults to **30 s**.
    pub timeout: Duration,
    /// Retry policy for GET requests. Defaults to **3 attempts**.
    pub retry: ReconnectionPolicy,
}

impl PublisherConfig {
    pub fn new(app_id: impl Into<String>, key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            key: key.into(),
            secret: secret.into(),
            scheme: DEFAULT_API_SCHEME.to_string(),
            host: DEFAULT_API_HOST.to_string(),
            timeout: DEFAULT_TIMEOUT,
            retry: ReconnectionPolicy::new().with_max_attempts(DEFAULT_GET_ATTEMPTS),
        }
    }

    /// Point the publisher at another API host, e.g. `("http", "127.0.0.1:8080")`.
    #[must_use]
    pub fn with_endpoint(mut self, scheme: impl Into<String>, host: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self.host = host.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: ReconnectionPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl fmt::Debug for PublisherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublisherConfig")
            .field("app_id", &self.app_id)
            .field("key", &self.key)
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

// ── Request and response types ──────────────────────────────────────

/// One event of a batch trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEvent {
    pub channel: String,
    pub name: String,
    pub data: Value,
    /// Connection to exclude from delivery.
    pub socket_id: Option<String>,
}

impl BatchEvent {
    pub fn new(channel: impl Into<String>, name: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            name: name.into(),
            data,
            socket_id: None,
        }
    }

    #[must_use]
    pub fn excluding(mut self, socket_id: impl Into<String>) -> Self {
        self.socket_id = Some(socket_id.into());
        self
    }
}

#[derive(Serialize)]
struct TriggerBody<'a> {
    name: &'a str,
    channels: &'a [String],
    data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    socket_id: Option<&'a str>,
}

#[derive(Serialize)]
struct BatchItem<'a> {
    name: &'a str,
    channel: &'a str,
    data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    socket_id: Option<&'a str>,
}

#[derive(Serialize)]
struct BatchBody<'a> {
    batch: Vec<BatchItem<'a>>,
}

/// Attributes of an occupied channel. Optional fields are only present when
/// requested through `info`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChannelState {
    #[serde(default)]
    pub occupied: bool,
    #[serde(default)]
    pub user_count: Option<u64>,
    #[serde(default)]
    pub subscription_count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChannelList {
    #[serde(default)]
    pub channels: HashMap<String, ChannelState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PresenceUser {
    #[serde(deserialize_with = "crate::protocol::id")]
    pub id: String,
}

#[derive(Deserialize)]
struct PresenceUsers {
    #[serde(default)]
    users: Vec<PresenceUser>,
}

// ── Publisher ───────────────────────────────────────────────────────

/// Signed client for the control API.
///
/// # Example
///
/// ```rust,ignore
/// let publisher = Publisher::new(PublisherConfig::new("42", "key", "secret"))?;
/// publisher
///     .trigger(&["orders"], "order-created", &json!({"id": 7}), None)
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct Publisher {
    http: reqwest::Client,
    config: PublisherConfig,
}

impl Publisher {
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn new(config: PublisherConfig) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Trigger `event` on up to 100 channels.
    ///
    /// String data is sent as is; any other value is serialized to JSON.
    /// `exclude` names a connection that should not receive the event.
    pub async fn trigger<S: AsRef<str>>(
        &self,
        channels: &[S],
        event: &str,
        data: &Value,
        exclude: Option<&str>,
    ) -> Result<()> {
        if channels.is_empty() || channels.len() > MAX_TRIGGER_CHANNELS {
            return Err(ValidationError::ChannelCount {
                count: channels.len(),
                limit: MAX_TRIGGER_CHANNELS,
            }
            .into());
        }
        for channel in channels {
            validate_channel_name(channel.as_ref())?;
        }
        validate_event_name(event)?;
        if let Some(socket_id) = exclude {
            validate_socket_id(socket_id)?;
        }
        let data = serialize_data(data)?;

        let channels: Vec<String> = channels.iter().map(|c| c.as_ref().to_string()).collect();
        let body = TriggerBody {
            name: event,
            channels: &channels,
            data,
            socket_id: exclude,
        };
        self.post("/events", &body).await?;
        debug!(%event, channels = channels.len(), "event triggered");
        Ok(())
    }

    /// Trigger up to 10 events in one request.
    pub async fn trigger_batch(&self, events: &[BatchEvent]) -> Result<()> {
        if events.is_empty() || events.len() > MAX_BATCH_SIZE {
            return Err(ValidationError::BatchSize {
                count: events.len(),
                limit: MAX_BATCH_SIZE,
            }
            .into());
        }
        let mut batch = Vec::with_capacity(events.len());
        for event in events {
            validate_channel_name(&event.channel)?;
            validate_event_name(&event.name)?;
            if let Some(socket_id) = &event.socket_id {
                validate_socket_id(socket_id)?;
            }
            batch.push(BatchItem {
                name: &event.name,
                channel: &event.channel,
                data: serialize_data(&event.data)?,
                socket_id: event.socket_id.as_deref(),
            });
        }
        self.post("/batch_events", &BatchBody { batch }).await?;
        debug!(events = events.len(), "batch triggered");
        Ok(())
    }

    /// State of one channel. `info` selects optional attributes such as
    /// `user_count` or `subscription_count`.
    pub async fn channel_info(&self, channel: &str, info: &[&str]) -> Result<ChannelState> {
        validate_channel_name(channel)?;
        let mut query = Vec::new();
        if !info.is_empty() {
            query.push(("info", info.join(",")));
        }
        self.get(&format!("/channels/{channel}"), &query).await
    }

    /// Occupied channels, optionally restricted to names starting with
    /// `prefix`.
    pub async fn channels(&self, prefix: Option<&str>, info: &[&str]) -> Result<ChannelList> {
        let mut query = Vec::new();
        if let Some(prefix) = prefix {
            query.push(("filter_by_prefix", prefix.to_string()));
        }
        if !info.is_empty() {
            query.push(("info", info.join(",")));
        }
        self.get("/channels", &query).await
    }

    /// Members of a presence channel.
    pub async fn presence_users(&self, channel: &str) -> Result<Vec<PresenceUser>> {
        validate_channel_name(channel)?;
        if ChannelKind::from_name(channel) != ChannelKind::Presence {
            return Err(ValidationError::NotPresenceChannel(channel.to_string()).into());
        }
        let users: PresenceUsers = self.get(&format!("/channels/{channel}/users"), &[]).await?;
        Ok(users.users)
    }

    /// Close every connection belonging to `user_id`.
    pub async fn terminate_user_connections(&self, user_id: &str) -> Result<()> {
        validate_user_id(user_id)?;
        self.post(
            &format!("/users/{user_id}/terminate_connections"),
            &serde_json::json!({}),
        )
        .await?;
        debug!(%user_id, "user connections terminated");
        Ok(())
    }

    /// Sign a subscriber's access to a private or presence channel.
    /// See [`signature::authorize_channel`].
    pub fn authorize_channel(
        &self,
        socket_id: &str,
        channel: &str,
        user_data: Option<&Value>,
    ) -> Result<AuthorizationResult> {
        signature::authorize_channel(&self.config.secret, socket_id, channel, user_data)
    }

    /// Verify and parse an incoming webhook. See [`webhook::verify_webhook`].
    pub fn verify_webhook(&self, key_header: &str, signature_header: &str, body: &[u8]) -> Result<Webhook> {
        webhook::verify_webhook(
            &self.config.key,
            &self.config.secret,
            key_header,
            signature_header,
            body,
        )
    }

    // ── Transport ───────────────────────────────────────────────────

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.get_once(path, query).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempt + 1 < attempts => {
                    let delay = self.config.retry.jittered_delay_for(attempt);
                    warn!(%path, attempt = attempt + 1, ?delay, "GET failed, retrying: {e}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.signed_url(&Method::GET, path, query, None, unix_time())?;
        let response = self.http.get(url).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let body = serde_json::to_vec(body)?;
        let url = self.signed_url(&Method::POST, path, &[], Some(&body), unix_time())?;
        let response = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    /// Build `{scheme}://{host}/apps/{app_id}{path}` with the auth query.
    ///
    /// The signed string is `METHOD\n{url path}\n{sorted k=v pairs}`.
    fn signed_url(
        &self,
        method: &Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&[u8]>,
        timestamp: u64,
    ) -> Result<Url> {
        let mut url = Url::parse(&format!(
            "{}://{}/apps/{}{path}",
            self.config.scheme, self.config.host, self.config.app_id
        ))?;

        let mut params: BTreeMap<&str, String> = BTreeMap::new();
        params.insert("auth_key", self.config.key.clone());
        params.insert("auth_timestamp", timestamp.to_string());
        params.insert("auth_version", AUTH_VERSION.to_string());
        if let Some(body) = body {
            params.insert("body_sha256", sha256_hex(body));
        }
        for (name, value) in query {
            params.insert(*name, value.clone());
        }

        let canonical = params
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("&");
        let to_sign = format!("{}\n{}\n{canonical}", method.as_str(), url.path());
        let signature = signature::sign(&self.config.secret, to_sign.as_bytes())?;

        url.query_pairs_mut()
            .extend_pairs(params.iter().map(|(name, value)| (*name, value.as_str())))
            .append_pair("auth_signature", &signature);
        Ok(url)
    }
}

fn serialize_data(data: &Value) -> Result<String> {
    let serialized = match data {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other)?,
    };
    validate_payload_size(&serialized)?;
    Ok(serialized)
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PulsewireError::HttpStatus {
        status: status.as_u16(),
        body,
    })
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
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

    fn publisher() -> Publisher {
        Publisher::new(PublisherConfig::new("42", "app-key", "app-secret")).unwrap()
    }

    fn query_map(url: &Url) -> BTreeMap<String, String> {
        url.query_pairs().into_owned().collect()
    }

    #[test]
    fn signed_url_carries_auth_parameters() {
        let url = publisher()
            .signed_url(&Method::POST, "/events", &[], Some(b"{}"), 1_700_000_000)
            .unwrap();
        assert_eq!(url.path(), "/apps/42/events");
        let query = query_map(&url);
        assert_eq!(query["auth_key"], "app-key");
        assert_eq!(query["auth_timestamp"], "1700000000");
        assert_eq!(query["auth_version"], "1.0");
        assert_eq!(query["body_sha256"], sha256_hex(b"{}"));
        assert!(!query.contains_key("secret"));
    }

    #[test]
    fn signature_covers_method_path_and_sorted_query() {
        let url = publisher()
            .signed_url(
                &Method::GET,
                "/channels",
                &[("info", "user_count".into()), ("filter_by_prefix", "presence-".into())],
                None,
                1_700_000_000,
            )
            .unwrap();
        let mut query = query_map(&url);
        let signature = query.remove("auth_signature").unwrap();
        assert!(!query.contains_key("body_sha256"));

        let canonical = query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let expected = format!("GET\n/apps/42/channels\n{canonical}");
        assert!(signature::verify("app-secret", expected.as_bytes(), &signature));
        assert!(!signature::verify(
            "app-secret",
            expected.replace("GET", "POST").as_bytes(),
            &signature
        ));
    }

    #[test]
    fn string_data_is_sent_verbatim() {
        assert_eq!(serialize_data(&json!("already json")).unwrap(), "already json");
        assert_eq!(serialize_data(&json!({"a": 1})).unwrap(), r#"{"a":1}"#);
    }

    #[test]
    fn oversized_data_is_rejected() {
        let big = "x".repeat(10 * 1024 + 1);
        assert!(matches!(
            serialize_data(&Value::String(big)),
            Err(PulsewireError::Validation(ValidationError::PayloadTooLarge { .. }))
        ));
    }

    #[test]
    fn config_debug_hides_secret() {
        let rendered = format!("{:?}", PublisherConfig::new("1", "k", "super-secret"));
        assert!(!rendered.contains("super-secret"));
    }

    #[tokio::test]
    async fn trigger_validates_before_sending() {
        let publisher = publisher();
        let none: [&str; 0] = [];
        assert!(matches!(
            publisher.trigger(&none, "e", &json!(1), None).await,
            Err(PulsewireError::Validation(ValidationError::ChannelCount { count: 0, .. }))
        ));
        let many: Vec<String> = (0..101).map(|i| format!("c{i}")).collect();
        assert!(matches!(
            publisher.trigger(&many, "e", &json!(1), None).await,
            Err(PulsewireError::Validation(ValidationError::ChannelCount { count: 101, .. }))
        ));
        assert!(matches!(
            publisher.trigger(&["bad channel"], "e", &json!(1), None).await,
            Err(PulsewireError::Validation(ValidationError::InvalidChannelName(_)))
        ));
        assert!(matches!(
            publisher.trigger(&["ok"], "", &json!(1), None).await,
            Err(PulsewireError::Validation(ValidationError::InvalidEventName(_)))
        ));
        assert!(matches!(
            publisher.trigger(&["ok"], "e", &json!(1), Some("nope")).await,
            Err(PulsewireError::Validation(ValidationError::InvalidSocketId(_)))
        ));
    }

    #[tokio::test]
    async fn batch_size_is_bounded() {
        let publisher = publisher();
        assert!(matches!(
            publisher.trigger_batch(&[]).await,
            Err(PulsewireError::Validation(ValidationError::BatchSize { count: 0, .. }))
        ));
        let events: Vec<BatchEvent> = (0..11)
            .map(|i| BatchEvent::new("orders", format!("e{i}"), json!(i)))
            .collect();
        assert!(matches!(
            publisher.trigger_batch(&events).await,
            Err(PulsewireError::Validation(ValidationError::BatchSize { count: 11, .. }))
        ));
    }

    #[tokio::test]
    async fn presence_users_requires_presence_channel() {
        assert!(matches!(
            publisher().presence_users("private-room").await,
            Err(PulsewireError::Validation(ValidationError::NotPresenceChannel(_)))
        ));
    }
}
