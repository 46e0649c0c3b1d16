//! Async subscriber client for the Pulsewire service.
//!
//! [`PulsewireClient`] is a thin handle. A background session task owns the
//! connection state machine, the transport, the channel registry and every
//! timer; the handle talks to it over an unbounded command channel. Events
//! are emitted on a bounded channel ([`mpsc::Receiver<ClientEvent>`])
//! returned from [`PulsewireClient::start`], and the connection state is
//! also published on a [`watch`] channel.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = ClientConfig::new("pk_live_abc123")
//!     .with_auth_endpoint("https://example.com/pulsewire/auth");
//! let (client, mut events) = PulsewireClient::start_websocket(config)?;
//!
//! let orders = client.subscribe("private-orders")?;
//! orders.bind("order-created", |msg| println!("new order: {}", msg.data))?;
//! client.connect()?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ClientEvent::StateChanged { current, .. } = event {
//!         println!("connection is now {current}");
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::auth::{AuthRequest, AuthorizationResult, ChannelAuthorizer, HttpChannelAuthorizer};
use crate::backoff::{ReconnectionBudget, ReconnectionPolicy};
use crate::channel::{
    Channel, ChannelInfo, ChannelKind, ChannelRegistry, Handler, PresenceState, SubscriptionStatus,
};
use crate::codec::{self, OutboundEncoding};
use crate::connection::{ConnectionState, StateChange};
use crate::discovery::DiscoveryClient;
use crate::error::{PulsewireError, Result};
use crate::error_codes::{ErrorCode, ReconnectStrategy};
use crate::event::ClientEvent;
use crate::protocol::{
    id_from_value, ConnectionEstablished, ControlEvent, Credential, ErrorPayload, MemberAdded,
    MemberRemoved, Message, Namespace, SubscribePayload, SubscriptionSucceeded,
    UnsubscribePayload,
};
use crate::transport::{Connector, Frame, Transport};
use crate::validation::{validate_channel_name, validate_event_name, ValidationError};

const DEFAULT_NAMESPACE: &str = "pulsewire";
const DEFAULT_WS_SCHEME: &str = "wss";
const DEFAULT_WS_HOST: &str = "ws.pulsewire.io";
const DEFAULT_DISCOVERY_ENDPOINT: &str = "https://discovery.pulsewire.io";
const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_DISCOVERY_ATTEMPTS: u32 = 3;

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Minimum spacing between the starts of two connection attempts.
const MIN_ATTEMPT_SPACING: Duration = Duration::from_millis(100);

const CLIENT_NAME: &str = "pulsewire-rust";

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`PulsewireClient`].
///
/// Only the key is required; everything else has a documented default.
///
/// # Example
///
/// ```
/// use pulsewire_client::client::ClientConfig;
/// use pulsewire_client::backoff::ReconnectionPolicy;
/// use std::time::Duration;
///
/// let config = ClientConfig::new("pk_live_abc")
///     .with_activity_timeout(Duration::from_secs(60))
///     .with_reconnection_policy(ReconnectionPolicy::new().with_max_attempts(5));
/// assert_eq!(config.namespace, "pulsewire");
/// assert_eq!(config.reconnection.max_attempts, 5);
/// ```
#[derive(Clone)]
pub struct ClientConfig {
    /// Application credential (`pk_…`, `sk_…` or a legacy key).
    pub key: String,
    /// Control event namespace. Defaults to **`pulsewire`**.
    pub namespace: String,
    /// WebSocket scheme. Defaults to **`wss`**.
    pub ws_scheme: String,
    /// WebSocket host (optionally with port). Defaults to **`ws.pulsewire.io`**.
    pub ws_host: String,
    /// Discovery service base URL, used by public keys only.
    pub discovery_endpoint: String,
    /// Retry policy for discovery. Defaults to **3 attempts** with the
    /// standard backoff.
    pub discovery_policy: ReconnectionPolicy,
    /// Inactivity window before a ping is sent (T1). Defaults to **120 s**.
    /// The service may advertise a shorter one.
    pub activity_timeout: Duration,
    /// Time allowed for the pong reply (T2). Defaults to **30 s**.
    pub pong_timeout: Duration,
    /// Reconnection backoff and attempt budget.
    pub reconnection: ReconnectionPolicy,
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer falls behind, channel and diagnostic events are
    /// dropped with a warning. State changes are never dropped: the session
    /// waits for capacity instead. Defaults to **256**. Values below 1 are
    /// clamped to 1.
    pub event_channel_capacity: usize,
    /// Time [`PulsewireClient::shutdown`] waits for the session to close the
    /// transport before aborting it. Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Framing for outbound messages. Defaults to text JSON.
    pub outbound_encoding: OutboundEncoding,
    /// Channel authorizer for private and presence channels.
    pub authorizer: Option<Arc<dyn ChannelAuthorizer>>,
    /// Authorization endpoint, used to build an [`HttpChannelAuthorizer`]
    /// when no `authorizer` is set.
    pub auth_endpoint: Option<String>,
}

impl ClientConfig {
    /// Create a configuration for `key` with default values.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            ws_scheme: DEFAULT_WS_SCHEME.to_string(),
            ws_host: DEFAULT_WS_HOST.to_string(),
            discovery_endpoint: DEFAULT_DISCOVERY_ENDPOINT.to_string(),
            discovery_policy: ReconnectionPolicy::new().with_max_attempts(DEFAULT_DISCOVERY_ATTEMPTS),
            activity_timeout: DEFAULT_ACTIVITY_TIMEOUT,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            reconnection: ReconnectionPolicy::new(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            outbound_encoding: OutboundEncoding::Text,
            authorizer: None,
            auth_endpoint: None,
        }
    }

    /// Set the control event namespace.
    ///
    /// Defaults to **`pulsewire`**.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set scheme and host of the WebSocket endpoint.
    ///
    /// Defaults to **`wss`** and **`ws.pulsewire.io`**.
    #[must_use]
    pub fn with_ws_endpoint(mut self, scheme: impl Into<String>, host: impl Into<String>) -> Self {
        self.ws_scheme = scheme.into();
        self.ws_host = host.into();
        self
    }

    /// Set the discovery service base URL. Only public keys use it.
    ///
    /// Defaults to **`https://discovery.pulsewire.io`**.
    #[must_use]
    pub fn with_discovery_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.discovery_endpoint = endpoint.into();
        self
    }

    /// Set the retry policy for discovery requests.
    ///
    /// Defaults to **3 attempts** with the standard backoff.
    #[must_use]
    pub fn with_discovery_policy(mut self, policy: ReconnectionPolicy) -> Self {
        self.discovery_policy = policy;
        self
    }

    /// Set the inactivity window before a ping is sent.
    ///
    /// Defaults to **120 seconds**. A shorter window advertised by the
    /// service takes precedence.
    #[must_use]
    pub fn with_activity_timeout(mut self, timeout: Duration) -> Self {
        self.activity_timeout = timeout;
        self
    }

    /// Set how long to wait for a pong before dropping the connection.
    ///
    /// Defaults to **30 seconds**.
    #[must_use]
    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    /// Set the reconnection backoff and attempt budget.
    ///
    /// Defaults to [`ReconnectionPolicy::new`].
    #[must_use]
    pub fn with_reconnection_policy(mut self, policy: ReconnectionPolicy) -> Self {
        self.reconnection = policy;
        self
    }

    /// Set the capacity of the bounded event channel.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the timeout for the graceful shutdown.
    ///
    /// Defaults to **1 second**. A zero timeout aborts the session immediately.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the framing of outbound messages.
    ///
    /// Defaults to [`OutboundEncoding::Text`].
    #[must_use]
    pub fn with_outbound_encoding(mut self, encoding: OutboundEncoding) -> Self {
        self.outbound_encoding = encoding;
        self
    }

    /// Use a custom authorizer for private and presence channels.
    ///
    /// Takes precedence over [`with_auth_endpoint`](Self::with_auth_endpoint).
    /// Defaults to **none**.
    #[must_use]
    pub fn with_authorizer(mut self, authorizer: impl ChannelAuthorizer) -> Self {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    /// Authorize private and presence channels by POSTing to `endpoint`.
    ///
    /// Defaults to **none**; without an authorizer such channels report a
    /// subscription error.
    #[must_use]
    pub fn with_auth_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.auth_endpoint = Some(endpoint.into());
        self
    }

    /// `{scheme}://{host}/app/{key}?client=pulsewire-rust&version=…`
    fn direct_url(&self) -> Result<String> {
        let mut url = Url::parse(&format!("{}://{}", self.ws_scheme, self.ws_host))?;
        url.set_path(&format!("/app/{}", self.key));
        url.query_pairs_mut()
            .append_pair("client", CLIENT_NAME)
            .append_pair("version", env!("CARGO_PKG_VERSION"));
        Ok(url.into())
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("credential", &Credential::parse(self.key.clone()))
            .field("namespace", &self.namespace)
            .field("ws_scheme", &self.ws_scheme)
            .field("ws_host", &self.ws_host)
            .field("discovery_endpoint", &self.discovery_endpoint)
            .field("activity_timeout", &self.activity_timeout)
            .field("pong_timeout", &self.pong_timeout)
            .field("reconnection", &self.reconnection)
            .field("event_channel_capacity", &self.event_channel_capacity)
            .field("outbound_encoding", &self.outbound_encoding)
            .field("has_authorizer", &self.authorizer.is_some())
            .field("auth_endpoint", &self.auth_endpoint)
            .finish_non_exhaustive()
    }
}

// ── Commands ────────────────────────────────────────────────────────

enum Command {
    Connect,
    Disconnect,
    ForceReconnect,
    Subscribe {
        channel: String,
        user_data: Option<Value>,
    },
    Unsubscribe {
        channel: String,
    },
    Bind {
        channel: String,
        event: Option<String>,
        handler: Handler,
    },
    Unbind {
        channel: String,
        event: Option<String>,
    },
    Trigger {
        channel: String,
        event: String,
        data: Value,
        reply: oneshot::Sender<bool>,
    },
    Info {
        channel: String,
        reply: oneshot::Sender<Option<ChannelInfo>>,
    },
    SocketId {
        reply: oneshot::Sender<Option<String>>,
    },
}

// ── Client handle ───────────────────────────────────────────────────

/// Handle to a running client session.
///
/// Commands are queued to the session and return as soon as they are
/// queued; results show up as [`ClientEvent`]s or state changes.
pub struct PulsewireClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl PulsewireClient {
    /// Spawn the session task and return a handle plus the event receiver.
    ///
    /// The client starts `disconnected`; call [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// - [`PulsewireError::InvalidCredential`] for `ct_…` channel tokens,
    ///   which cannot open a connection.
    /// - [`PulsewireError::Url`] if the endpoint configuration does not form
    ///   a valid URL.
    /// - [`PulsewireError::Http`] if an HTTP client cannot be built.
    pub fn start(
        connector: impl Connector,
        config: ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>)> {
        let credential = Credential::parse(config.key.clone());
        if let Credential::ChannelToken(_) = credential {
            return Err(PulsewireError::InvalidCredential(
                "channel tokens are issued by the authorization exchange and cannot open a connection"
                    .into(),
            ));
        }

        let direct_url = config.direct_url()?;
        let discovery = if credential.requires_discovery() {
            Some(
                DiscoveryClient::new(config.discovery_endpoint.clone())?
                    .with_retry_policy(config.discovery_policy.clone()),
            )
        } else {
            None
        };
        let authorizer: Option<Arc<dyn ChannelAuthorizer>> =
            match (&config.authorizer, &config.auth_endpoint) {
                (Some(authorizer), _) => Some(Arc::clone(authorizer)),
                (None, Some(endpoint)) => Some(Arc::new(HttpChannelAuthorizer::new(endpoint)?)),
                (None, None) => None,
            };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        // Clamp capacity to at least 1 (tokio panics on 0).
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel::<ClientEvent>(capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (attempt_tx, attempt_rx) = mpsc::unbounded_channel::<AttemptOutcome>();
        let (auth_tx, auth_rx) = mpsc::unbounded_channel::<AuthOutcome>();

        let session = Session {
            credential,
            namespace: Namespace::new(config.namespace),
            connector: Arc::new(connector),
            discovery,
            authorizer,
            direct_url,
            ws_scheme: config.ws_scheme,
            ws_host: config.ws_host,
            outbound_encoding: config.outbound_encoding,
            activity_timeout: config.activity_timeout,
            effective_activity_timeout: config.activity_timeout,
            pong_timeout: config.pong_timeout,
            state: ConnectionState::Disconnected,
            state_tx,
            event_tx,
            transport: None,
            socket_id: None,
            registry: ChannelRegistry::new(),
            budget: ReconnectionBudget::new(config.reconnection),
            generation: 0,
            attempt: None,
            last_attempt: None,
            attempt_tx,
            auth_tx,
            auth_tasks: HashMap::new(),
            timers: Timers::default(),
            pending_failure: None,
        };

        let task = tokio::spawn(session.run(cmd_rx, shutdown_rx, attempt_rx, auth_rx));

        let client = Self {
            cmd_tx,
            state_rx,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        };
        Ok((client, event_rx))
    }

    /// [`start`](Self::start) with the built-in WebSocket connector.
    #[cfg(feature = "transport-websocket")]
    pub fn start_websocket(config: ClientConfig) -> Result<(Self, mpsc::Receiver<ClientEvent>)> {
        Self::start(crate::transports::WebSocketConnector::new(), config)
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Start connecting. Ignored unless the client is `disconnected`; a
    /// `failed` client only leaves that state through
    /// [`force_reconnect`](Self::force_reconnect).
    ///
    /// # Errors
    ///
    /// Returns [`PulsewireError::ClientClosed`] if the session has exited.
    pub fn connect(&self) -> Result<()> {
        self.send(Command::Connect)
    }

    /// Close the connection, cancel every timer, drop all channels and reset
    /// the reconnection budget. No reconnection follows.
    pub fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect)
    }

    /// Reset the reconnection budget and immediately start a new attempt,
    /// from any state.
    pub fn force_reconnect(&self) -> Result<()> {
        self.send(Command::ForceReconnect)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// A receiver that observes every state change.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the connection reaches `target`.
    ///
    /// # Errors
    ///
    /// Returns [`PulsewireError::ClientClosed`] if the session exits first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<()> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| PulsewireError::ClientClosed)
    }

    /// The connection id assigned by the service, if connected.
    pub async fn socket_id(&self) -> Result<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SocketId { reply })?;
        rx.await.map_err(|_| PulsewireError::ClientClosed)
    }

    // ── Channels ────────────────────────────────────────────────────

    /// Subscribe to a public or private channel. Idempotent: subscribing
    /// again returns a handle to the same channel.
    ///
    /// # Errors
    ///
    /// Fails with a validation error for invalid names and for presence
    /// channels (use [`subscribe_presence`](Self::subscribe_presence)).
    pub fn subscribe(&self, channel: &str) -> Result<ChannelHandle> {
        validate_channel_name(channel)?;
        if ChannelKind::from_name(channel) == ChannelKind::Presence {
            return Err(ValidationError::MissingUserId.into());
        }
        self.send(Command::Subscribe {
            channel: channel.to_string(),
            user_data: None,
        })?;
        Ok(self.channel(channel))
    }

    /// Subscribe to a presence channel. `user_data` must contain a string or
    /// numeric `user_id`; it is sent with every authorization and subscribe.
    /// An already registered channel keeps its original user data.
    pub fn subscribe_presence(&self, channel: &str, user_data: Value) -> Result<ChannelHandle> {
        validate_channel_name(channel)?;
        if ChannelKind::from_name(channel) != ChannelKind::Presence {
            return Err(ValidationError::NotPresenceChannel(channel.to_string()).into());
        }
        user_data
            .get("user_id")
            .and_then(id_from_value)
            .ok_or(ValidationError::MissingUserId)?;
        self.send(Command::Subscribe {
            channel: channel.to_string(),
            user_data: Some(user_data),
        })?;
        Ok(self.channel(channel))
    }

    /// A handle for `channel` without subscribing. Operations on a channel
    /// that is not registered are no-ops.
    pub fn channel(&self, channel: &str) -> ChannelHandle {
        ChannelHandle {
            name: channel.to_string(),
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Shut down the session, closing the transport.
    ///
    /// The event receiver yields `None` once the session has exited.
    pub async fn shutdown(&mut self) {
        debug!("PulsewireClient: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("session task terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("session task did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session task aborted: {join_err}");
                    }
                }
            }
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| PulsewireError::ClientClosed)
    }
}

impl fmt::Debug for PulsewireClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PulsewireClient")
            .field("state", &self.state())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for PulsewireClient {
    fn drop(&mut self) {
        // Drop cannot await a graceful close; abort the session instead.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Channel handle ──────────────────────────────────────────────────

/// Cheap, cloneable handle to a channel registered on a client.
#[derive(Clone)]
pub struct ChannelHandle {
    name: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ChannelHandle {
    /// Name of the channel this handle refers to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `handler` for every `event` on this channel, in registration order.
    pub fn bind<F>(&self, event: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.send(Command::Bind {
            channel: self.name.clone(),
            event: Some(event.into()),
            handler: Box::new(handler),
        })
    }

    /// Run `handler` for every event on this channel.
    pub fn bind_all<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.send(Command::Bind {
            channel: self.name.clone(),
            event: None,
            handler: Box::new(handler),
        })
    }

    /// Remove the handlers bound to `event`.
    pub fn unbind(&self, event: &str) -> Result<()> {
        self.send(Command::Unbind {
            channel: self.name.clone(),
            event: Some(event.to_string()),
        })
    }

    /// Remove every handler.
    pub fn unbind_all(&self) -> Result<()> {
        self.send(Command::Unbind {
            channel: self.name.clone(),
            event: None,
        })
    }

    /// Send a client event on this channel.
    ///
    /// Only private and presence channels that are currently subscribed
    /// accept client events. Returns `false` otherwise, and never errors.
    pub async fn trigger(&self, event: &str, data: Value) -> bool {
        let (reply, rx) = oneshot::channel();
        let queued = self
            .send(Command::Trigger {
                channel: self.name.clone(),
                event: event.to_string(),
                data,
                reply,
            })
            .is_ok();
        queued && rx.await.unwrap_or(false)
    }

    /// Snapshot of the channel, or `None` if it is not registered.
    pub async fn info(&self) -> Option<ChannelInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Info {
            channel: self.name.clone(),
            reply,
        })
        .ok()?;
        rx.await.ok().flatten()
    }

    /// Unregister the channel, sending `<ns>:unsubscribe` if it had
    /// subscribed (or was subscribing) on the current connection.
    pub fn unsubscribe(&self) -> Result<()> {
        self.send(Command::Unsubscribe {
            channel: self.name.clone(),
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| PulsewireError::ClientClosed)
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("name", &self.name)
            .finish()
    }
}

// ── Session ─────────────────────────────────────────────────────────

struct AttemptOutcome {
    generation: u64,
    result: Result<Box<dyn Transport>>,
}

struct AuthOutcome {
    channel: String,
    socket_id: String,
    channel_data: Option<String>,
    result: Result<AuthorizationResult>,
}

/// Where a connection attempt gets its URL from.
enum Route {
    Direct(String),
    Discover {
        client: DiscoveryClient,
        key: String,
        scheme: String,
        host: String,
    },
}

#[derive(Debug, Default, Clone, Copy)]
struct Timers {
    /// T1: send a ping when it fires.
    activity: Option<Instant>,
    /// T2: drop the transport when it fires.
    pong: Option<Instant>,
    /// Next connection attempt.
    reconnect: Option<Instant>,
}

/// State owned by the background task. Every mutation happens on that task.
struct Session {
    credential: Credential,
    namespace: Namespace,
    connector: Arc<dyn Connector>,
    discovery: Option<DiscoveryClient>,
    authorizer: Option<Arc<dyn ChannelAuthorizer>>,
    direct_url: String,
    ws_scheme: String,
    ws_host: String,
    outbound_encoding: OutboundEncoding,
    activity_timeout: Duration,
    effective_activity_timeout: Duration,
    pong_timeout: Duration,

    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: mpsc::Sender<ClientEvent>,

    transport: Option<Box<dyn Transport>>,
    socket_id: Option<String>,
    registry: ChannelRegistry,
    budget: ReconnectionBudget,

    /// Bumped whenever an in-flight attempt is superseded.
    generation: u64,
    attempt: Option<JoinHandle<()>>,
    last_attempt: Option<Instant>,
    attempt_tx: mpsc::UnboundedSender<AttemptOutcome>,

    auth_tx: mpsc::UnboundedSender<AuthOutcome>,
    auth_tasks: HashMap<String, JoinHandle<()>>,

    timers: Timers,
    /// Set when a send fails; the loop tears the transport down after the
    /// current branch completes.
    pending_failure: Option<String>,
}

impl Session {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut shutdown_rx: oneshot::Receiver<()>,
        mut attempt_rx: mpsc::UnboundedReceiver<AttemptOutcome>,
        mut auth_rx: mpsc::UnboundedReceiver<AuthOutcome>,
    ) {
        debug!("session started");

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("command channel closed, shutting down session");
                        break;
                    }
                },

                _ = &mut shutdown_rx => {
                    debug!("shutdown signal received");
                    break;
                }

                incoming = recv_frame(&mut self.transport) => match incoming {
                    Some(Ok(frame)) => self.handle_frame(frame).await,
                    Some(Err(e)) => self.drop_connection(&format!("transport error: {e}"), false).await,
                    None => self.drop_connection("transport closed by peer", false).await,
                },

                Some(outcome) = attempt_rx.recv() => self.handle_attempt(outcome).await,

                Some(outcome) = auth_rx.recv() => self.handle_auth(outcome).await,

                () = sleep_until(self.timers.activity) => self.on_activity_timeout().await,

                () = sleep_until(self.timers.pong) => {
                    self.timers.pong = None;
                    self.drop_connection("pong not received", false).await;
                }

                () = sleep_until(self.timers.reconnect) => {
                    self.timers.reconnect = None;
                    self.start_attempt().await;
                }
            }

            if let Some(reason) = self.pending_failure.take() {
                self.drop_connection(&reason, false).await;
            }
        }

        self.close().await;
        debug!("session exited");
    }

    // ── State ───────────────────────────────────────────────────────

    async fn transition(&mut self, next: ConnectionState) -> bool {
        let previous = self.state;
        if previous == next {
            return false;
        }
        if !previous.can_transition_to(next) {
            warn!(from = %previous, to = %next, "rejected invalid state transition");
            return false;
        }
        self.state = next;
        self.state_tx.send_replace(next);
        info!(from = %previous, to = %next, "connection state changed");

        let event = ClientEvent::from(StateChange {
            previous,
            current: next,
        });
        emit_critical(&self.event_tx, event).await;
        true
    }

    fn can_subscribe(&self) -> bool {
        self.state == ConnectionState::Connected
            && self.socket_id.is_some()
            && self.transport.is_some()
    }

    // ── Connection attempts ─────────────────────────────────────────

    async fn start_attempt(&mut self) {
        if self.attempt.is_some() || self.transport.is_some() {
            debug!("connection attempt already in progress");
            return;
        }
        self.transition(ConnectionState::Connecting).await;
        if self.state != ConnectionState::Connecting {
            return;
        }

        let now = Instant::now();
        if let Some(last) = self.last_attempt {
            let earliest = last + MIN_ATTEMPT_SPACING;
            if now < earliest {
                debug!("coalescing connection attempt");
                self.timers.reconnect = Some(earliest);
                return;
            }
        }
        self.timers.reconnect = None;
        self.last_attempt = Some(now);
        self.generation += 1;

        let generation = self.generation;
        let connector = Arc::clone(&self.connector);
        let route = self.route();
        let tx = self.attempt_tx.clone();
        self.attempt = Some(tokio::spawn(async move {
            let result = open_transport(connector, route).await;
            let _ = tx.send(AttemptOutcome { generation, result });
        }));
    }

    fn route(&self) -> Route {
        match (&self.credential, &self.discovery) {
            (Credential::PublicKey(key), Some(client)) => Route::Discover {
                client: client.clone(),
                key: key.clone(),
                scheme: self.ws_scheme.clone(),
                host: self.ws_host.clone(),
            },
            _ => Route::Direct(self.direct_url.clone()),
        }
    }

    fn cancel_attempt(&mut self) {
        if let Some(task) = self.attempt.take() {
            task.abort();
        }
        self.generation += 1;
    }

    async fn handle_attempt(&mut self, outcome: AttemptOutcome) {
        if outcome.generation != self.generation || self.state != ConnectionState::Connecting {
            debug!("dropping superseded connection attempt");
            if let Ok(mut transport) = outcome.result {
                let _ = transport.close().await;
            }
            return;
        }
        self.attempt = None;

        match outcome.result {
            Ok(transport) => {
                debug!("transport open");
                self.transport = Some(transport);
                self.arm_activity();
                if !self.credential.awaits_connection_established() {
                    self.transition(ConnectionState::Connected).await;
                    self.subscribe_pending().await;
                }
            }
            Err(e) if e.is_retriable() => {
                warn!("connection attempt failed: {e}");
                self.transition(ConnectionState::Unavailable).await;
                self.schedule_reconnect().await;
            }
            Err(e) => {
                error!("connection attempt failed permanently: {e}");
                emit_event(
                    &self.event_tx,
                    ClientEvent::Error {
                        code: None,
                        message: e.to_string(),
                    },
                );
                self.transition(ConnectionState::Failed).await;
            }
        }
    }

    async fn schedule_reconnect(&mut self) {
        match self.budget.next_delay() {
            Some(delay) => {
                let attempt = self.budget.attempts();
                self.timers.reconnect = Some(Instant::now() + delay);
                info!(attempt, ?delay, "reconnect scheduled");
                emit_event(
                    &self.event_tx,
                    ClientEvent::ReconnectScheduled { attempt, delay },
                );
            }
            None => {
                warn!(
                    attempts = self.budget.attempts(),
                    "reconnection budget exhausted"
                );
                self.transition(ConnectionState::Failed).await;
            }
        }
    }

    /// Clear everything bound to the current connection id.
    fn reset_connection_scope(&mut self) {
        self.socket_id = None;
        self.timers.activity = None;
        self.timers.pong = None;
        self.effective_activity_timeout = self.activity_timeout;
        for (_, task) in self.auth_tasks.drain() {
            task.abort();
        }
        self.registry.mark_all_unsubscribed();
    }

    async fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!("transport close failed: {e}");
            }
        }
    }

    /// The transport is gone (closed, errored, or deliberately dropped).
    /// Channels fall back to unsubscribed and a reconnect is scheduled.
    async fn drop_connection(&mut self, reason: &str, immediate: bool) {
        if self.transport.is_none() {
            return;
        }
        self.close_transport().await;
        self.reset_connection_scope();
        warn!(%reason, state = %self.state, "connection lost");

        let next = match self.state {
            ConnectionState::Connected => ConnectionState::Disconnected,
            ConnectionState::Connecting => ConnectionState::Unavailable,
            _ => return,
        };
        self.transition(next).await;

        if immediate {
            self.timers.reconnect = Some(Instant::now());
        } else {
            self.schedule_reconnect().await;
        }
    }

    async fn disconnect(&mut self) {
        self.cancel_attempt();
        self.timers = Timers::default();
        self.close_transport().await;
        self.reset_connection_scope();
        self.registry.clear();
        self.budget.reset();
        self.transition(ConnectionState::Disconnected).await;
    }

    async fn force_reconnect(&mut self) {
        self.cancel_attempt();
        self.timers = Timers::default();
        self.close_transport().await;
        self.reset_connection_scope();
        self.budget.reset();
        self.start_attempt().await;
    }

    async fn fail(&mut self, reason: &str) {
        self.cancel_attempt();
        self.timers = Timers::default();
        self.close_transport().await;
        self.reset_connection_scope();
        error!(%reason, "connection failed");
        self.transition(ConnectionState::Failed).await;
    }

    async fn close(&mut self) {
        self.cancel_attempt();
        self.timers = Timers::default();
        self.close_transport().await;
        self.reset_connection_scope();

        let previous = self.state;
        if previous != ConnectionState::Disconnected {
            self.state = ConnectionState::Disconnected;
            self.state_tx.send_replace(ConnectionState::Disconnected);
            emit_critical(
                &self.event_tx,
                ClientEvent::StateChanged {
                    previous,
                    current: ConnectionState::Disconnected,
                },
            )
            .await;
        }
    }

    // ── Keepalive ───────────────────────────────────────────────────

    fn arm_activity(&mut self) {
        self.timers.activity = Some(Instant::now() + self.effective_activity_timeout);
    }

    async fn on_activity_timeout(&mut self) {
        self.timers.activity = None;
        if self.transport.is_none() {
            return;
        }
        debug!("activity timeout, sending ping");
        self.send_control(ControlEvent::Ping, Value::Null).await;
        if self.timers.pong.is_none() {
            self.timers.pong = Some(Instant::now() + self.pong_timeout);
        }
    }

    // ── Commands ────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => match self.state {
                ConnectionState::Disconnected => self.start_attempt().await,
                ConnectionState::Failed => {
                    warn!("connect() ignored while failed; use force_reconnect()");
                }
                state => debug!(%state, "connect() ignored"),
            },
            Command::Disconnect => self.disconnect().await,
            Command::ForceReconnect => self.force_reconnect().await,
            Command::Subscribe { channel, user_data } => {
                if self.registry.register(&channel, user_data) {
                    debug!(%channel, "channel registered");
                    if self.can_subscribe() {
                        self.begin_subscribe(&channel).await;
                    }
                }
            }
            Command::Unsubscribe { channel } => self.unsubscribe(&channel).await,
            Command::Bind {
                channel,
                event,
                handler,
            } => match self.registry.get_mut(&channel) {
                Some(ch) => ch.bind(event, handler),
                None => warn!(%channel, "bind on unregistered channel ignored"),
            },
            Command::Unbind { channel, event } => {
                if let Some(ch) = self.registry.get_mut(&channel) {
                    ch.unbind(event.as_deref());
                }
            }
            Command::Trigger {
                channel,
                event,
                data,
                reply,
            } => {
                let sent = self.trigger(channel, event, data).await;
                let _ = reply.send(sent);
            }
            Command::Info { channel, reply } => {
                let _ = reply.send(self.registry.get(&channel).map(Channel::info));
            }
            Command::SocketId { reply } => {
                let _ = reply.send(self.socket_id.clone());
            }
        }
    }

    async fn unsubscribe(&mut self, channel: &str) {
        let Some(removed) = self.registry.remove(channel) else {
            return;
        };
        if let Some(task) = self.auth_tasks.remove(channel) {
            task.abort();
        }
        if matches!(
            removed.status(),
            SubscriptionStatus::Pending | SubscriptionStatus::Subscribed
        ) {
            self.send_payload(
                ControlEvent::Unsubscribe,
                &UnsubscribePayload {
                    channel: channel.to_string(),
                },
            )
            .await;
        }
        debug!(%channel, "channel unsubscribed");
    }

    async fn trigger(&mut self, channel: String, event: String, data: Value) -> bool {
        let allowed = self
            .registry
            .get(&channel)
            .is_some_and(|ch| ch.kind().requires_auth() && ch.is_subscribed());
        if !allowed {
            debug!(%channel, %event, "trigger refused: channel is not a subscribed private channel");
            return false;
        }
        if let Err(e) = validate_event_name(&event) {
            debug!(%channel, "trigger refused: {e}");
            return false;
        }
        let message = Message::new(event, data).with_channel(channel);
        self.send_message(&message).await
    }

    // ── Subscription handshake ──────────────────────────────────────

    async fn subscribe_pending(&mut self) {
        if !self.can_subscribe() {
            return;
        }
        for channel in self.registry.unsubscribed() {
            self.begin_subscribe(&channel).await;
            if self.pending_failure.is_some() {
                break;
            }
        }
    }

    async fn begin_subscribe(&mut self, name: &str) {
        let Some(socket_id) = self.socket_id.clone() else {
            return;
        };
        let Some(channel) = self.registry.get(name) else {
            return;
        };

        if !channel.kind().requires_auth() {
            let payload = SubscribePayload {
                channel: name.to_string(),
                auth: None,
                channel_data: None,
            };
            if self.send_payload(ControlEvent::Subscribe, &payload).await {
                self.set_status(name, SubscriptionStatus::Pending);
            }
            return;
        }

        let channel_data = channel.as_presence().map(PresenceState::channel_data);
        let Some(authorizer) = self.authorizer.clone() else {
            warn!(channel = %name, "no channel authorizer configured");
            emit_event(
                &self.event_tx,
                ClientEvent::SubscriptionError {
                    channel: name.to_string(),
                    error: "no channel authorizer configured".into(),
                },
            );
            return;
        };

        self.set_status(name, SubscriptionStatus::Authorizing);
        let request = AuthRequest {
            socket_id,
            channel_name: name.to_string(),
            channel_data,
        };
        let tx = self.auth_tx.clone();
        let task = tokio::spawn(async move {
            let result = authorizer.authorize(&request).await;
            let _ = tx.send(AuthOutcome {
                channel: request.channel_name,
                socket_id: request.socket_id,
                channel_data: request.channel_data,
                result,
            });
        });
        if let Some(previous) = self.auth_tasks.insert(name.to_string(), task) {
            previous.abort();
        }
        debug!(channel = %name, "authorization requested");
    }

    async fn handle_auth(&mut self, outcome: AuthOutcome) {
        let current = self.socket_id.as_deref() == Some(outcome.socket_id.as_str());
        let authorizing = self
            .registry
            .get(&outcome.channel)
            .is_some_and(|ch| ch.status() == SubscriptionStatus::Authorizing);
        if !current || !authorizing {
            debug!(channel = %outcome.channel, "dropping stale authorization result");
            return;
        }
        self.auth_tasks.remove(&outcome.channel);

        match outcome.result {
            Ok(result) => {
                let payload = SubscribePayload {
                    channel: outcome.channel.clone(),
                    auth: Some(result.auth),
                    channel_data: result.channel_data.or(outcome.channel_data),
                };
                if self.send_payload(ControlEvent::Subscribe, &payload).await {
                    self.set_status(&outcome.channel, SubscriptionStatus::Pending);
                } else {
                    self.set_status(&outcome.channel, SubscriptionStatus::Unsubscribed);
                }
            }
            Err(e) => {
                self.set_status(&outcome.channel, SubscriptionStatus::Unsubscribed);
                warn!(channel = %outcome.channel, "channel authorization failed: {e}");
                emit_event(
                    &self.event_tx,
                    ClientEvent::SubscriptionError {
                        channel: outcome.channel,
                        error: e.to_string(),
                    },
                );
            }
        }
    }

    fn set_status(&mut self, channel: &str, status: SubscriptionStatus) {
        if let Some(ch) = self.registry.get_mut(channel) {
            ch.set_status(status);
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────

    async fn handle_frame(&mut self, frame: Frame) {
        self.arm_activity();

        let message = match codec::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping undecodable frame: {e}");
                emit_event(
                    &self.event_tx,
                    ClientEvent::DecodeError {
                        error: e.to_string(),
                    },
                );
                return;
            }
        };

        match self.namespace.classify(&message.event) {
            Some(ControlEvent::Ping) => {
                self.send_control(ControlEvent::Pong, Value::Null).await;
            }
            Some(ControlEvent::Pong) => {
                self.timers.pong = None;
            }
            Some(ControlEvent::ConnectionEstablished) => {
                self.on_connection_established(&message).await;
            }
            Some(ControlEvent::SubscriptionSucceeded) => self.on_subscription_succeeded(message),
            Some(ControlEvent::SubscriptionError) => self.on_subscription_error(message),
            Some(ControlEvent::MemberAdded) => self.on_member_added(message),
            Some(ControlEvent::MemberRemoved) => self.on_member_removed(message),
            Some(ControlEvent::Error) => self.on_error_frame(&message).await,
            Some(ControlEvent::Subscribe | ControlEvent::Unsubscribe) => {
                debug!(event = %message.event, "ignoring client-originated control event");
            }
            None => self.dispatch(message),
        }
    }

    async fn on_connection_established(&mut self, message: &Message) {
        let payload: ConnectionEstablished = match message.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("malformed connection_established: {e}");
                emit_event(
                    &self.event_tx,
                    ClientEvent::DecodeError {
                        error: format!("malformed connection_established: {e}"),
                    },
                );
                return;
            }
        };

        if let Some(secs) = payload.activity_timeout.filter(|secs| *secs > 0) {
            self.effective_activity_timeout = self.activity_timeout.min(Duration::from_secs(secs));
            self.arm_activity();
        }
        self.socket_id = Some(payload.socket_id.clone());
        info!(socket_id = %payload.socket_id, "connection established");
        emit_event(
            &self.event_tx,
            ClientEvent::ConnectionEstablished {
                socket_id: payload.socket_id,
            },
        );

        if self.state == ConnectionState::Connecting {
            self.transition(ConnectionState::Connected).await;
        }
        self.subscribe_pending().await;
    }

    fn on_subscription_succeeded(&mut self, message: Message) {
        let Some(name) = message.channel.clone() else {
            return;
        };
        let payload: SubscriptionSucceeded = if message.data.is_null() {
            SubscriptionSucceeded::default()
        } else {
            message.payload().unwrap_or_else(|e| {
                warn!(channel = %name, "malformed subscription_succeeded payload: {e}");
                SubscriptionSucceeded::default()
            })
        };
        let Some(channel) = self.registry.get_mut(&name) else {
            debug!(channel = %name, "subscription_succeeded for unknown channel");
            return;
        };
        channel.confirm_subscription(payload.presence);
        self.budget.reset();
        info!(channel = %name, "subscription succeeded");

        channel.dispatch(&message);
        emit_event(
            &self.event_tx,
            ClientEvent::SubscriptionSucceeded { channel: name },
        );
    }

    fn on_subscription_error(&mut self, message: Message) {
        let Some(name) = message.channel.clone() else {
            return;
        };
        let Some(channel) = self.registry.get_mut(&name) else {
            return;
        };
        channel.set_status(SubscriptionStatus::Unsubscribed);
        let error = match message.data.get("error").and_then(Value::as_str) {
            Some(error) => error.to_string(),
            None => message.data.to_string(),
        };
        warn!(channel = %name, %error, "subscription rejected");

        channel.dispatch(&message);
        emit_event(
            &self.event_tx,
            ClientEvent::SubscriptionError {
                channel: name,
                error,
            },
        );
    }

    fn on_member_added(&mut self, message: Message) {
        let Some(name) = message.channel.clone() else {
            return;
        };
        let payload: MemberAdded = match message.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %name, "malformed member_added: {e}");
                return;
            }
        };
        let Some(channel) = self.registry.get_mut(&name) else {
            return;
        };
        let Some(presence) = channel.as_presence_mut() else {
            return;
        };
        let member = presence
            .members_mut()
            .add(payload.user_id, payload.user_info);
        debug!(channel = %name, member = %member.id, "member added");

        channel.dispatch(&message);
        emit_event(
            &self.event_tx,
            ClientEvent::MemberAdded {
                channel: name,
                member,
            },
        );
    }

    fn on_member_removed(&mut self, message: Message) {
        let Some(name) = message.channel.clone() else {
            return;
        };
        let payload: MemberRemoved = match message.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %name, "malformed member_removed: {e}");
                return;
            }
        };
        let Some(channel) = self.registry.get_mut(&name) else {
            return;
        };
        let Some(member) = channel
            .as_presence_mut()
            .and_then(|presence| presence.members_mut().remove(&payload.user_id))
        else {
            return;
        };
        debug!(channel = %name, member = %member.id, "member removed");

        channel.dispatch(&message);
        emit_event(
            &self.event_tx,
            ClientEvent::MemberRemoved {
                channel: name,
                member,
            },
        );
    }

    async fn on_error_frame(&mut self, message: &Message) {
        let payload: ErrorPayload = message.payload().unwrap_or_default();
        let known = payload.code.and_then(ErrorCode::from_code);
        warn!(code = ?payload.code, reason = %payload.message, ?known, "service reported an error");
        emit_event(
            &self.event_tx,
            ClientEvent::Error {
                code: payload.code,
                message: payload.message.clone(),
            },
        );

        let reason = format!("service error {:?}: {}", payload.code, payload.message);
        match ReconnectStrategy::for_code(payload.code) {
            ReconnectStrategy::Fatal => self.fail(&reason).await,
            ReconnectStrategy::Backoff => self.drop_connection(&reason, false).await,
            ReconnectStrategy::Immediate => self.drop_connection(&reason, true).await,
            ReconnectStrategy::Informational => {}
        }
    }

    /// Application events go to the channel's handlers, then to the event
    /// stream.
    fn dispatch(&mut self, message: Message) {
        if let Some(channel) = message
            .channel
            .as_deref()
            .and_then(|name| self.registry.get(name))
        {
            channel.dispatch(&message);
        }
        emit_event(&self.event_tx, ClientEvent::Message(message));
    }

    // ── Outbound ────────────────────────────────────────────────────

    async fn send_control(&mut self, control: ControlEvent, data: Value) -> bool {
        let message = self.namespace.message(control, data);
        self.send_message(&message).await
    }

    async fn send_payload<T: serde::Serialize>(&mut self, control: ControlEvent, payload: &T) -> bool {
        match serde_json::to_value(payload) {
            Ok(data) => self.send_control(control, data).await,
            Err(e) => {
                error!("failed to serialize {control} payload: {e}");
                false
            }
        }
    }

    async fn send_message(&mut self, message: &Message) -> bool {
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        let frame = match codec::encode(message, self.outbound_encoding) {
            Ok(frame) => frame,
            Err(e) => {
                error!(event = %message.event, "failed to encode outbound message: {e}");
                return false;
            }
        };
        match transport.send(frame).await {
            Ok(()) => true,
            Err(e) => {
                error!("transport send error: {e}");
                self.pending_failure
                    .get_or_insert_with(|| format!("transport send error: {e}"));
                false
            }
        }
    }
}

async fn open_transport(connector: Arc<dyn Connector>, route: Route) -> Result<Box<dyn Transport>> {
    let url = match route {
        Route::Direct(url) => url,
        Route::Discover {
            client,
            key,
            scheme,
            host,
        } => client
            .discover(&key)
            .await?
            .transport_url(&scheme, &host)?
            .into(),
    };
    debug!(%url, "opening transport");
    connector.connect(&url).await
}

async fn recv_frame(transport: &mut Option<Box<dyn Transport>>) -> Option<Result<Frame>> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Emit an event to the event channel. If the channel is full, log a warning
/// and drop the event to avoid blocking the session.
fn emit_event(event_tx: &mpsc::Sender<ClientEvent>, event: ClientEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!(
                "event channel full, dropping event: {:?}",
                std::mem::discriminant(&dropped)
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

/// Emit an event that must not be dropped, waiting for capacity.
async fn emit_critical(event_tx: &mpsc::Sender<ClientEvent>, event: ClientEvent) {
    if event_tx.send(event).await.is_err() {
        debug!("event channel closed, receiver dropped");
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
    use async_trait::async_trait;

    struct NeverConnector;

    #[async_trait]
    impl Connector for NeverConnector {
        async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>> {
            std::future::pending().await
        }
    }

    #[test]
    fn config_defaults() {
        let config = ClientConfig::new("pk_test");
        assert_eq!(config.namespace, "pulsewire");
        assert_eq!(config.activity_timeout, Duration::from_secs(120));
        assert_eq!(config.pong_timeout, Duration::from_secs(30));
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.discovery_policy.max_attempts, 3);
        assert_eq!(config.reconnection, ReconnectionPolicy::new());
        assert_eq!(config.outbound_encoding, OutboundEncoding::Text);
        assert!(config.authorizer.is_none());
    }

    #[test]
    fn builders_override_documented_defaults() {
        let defaults = ClientConfig::new("pk_test");
        assert_eq!((defaults.ws_scheme.as_str(), defaults.ws_host.as_str()), ("wss", "ws.pulsewire.io"));
        assert_eq!(defaults.discovery_endpoint, "https://discovery.pulsewire.io");
        assert_eq!(defaults.auth_endpoint, None);

        let config = defaults
            .with_namespace("acme")
            .with_ws_endpoint("ws", "localhost:6001")
            .with_discovery_endpoint("http://localhost:7000")
            .with_discovery_policy(ReconnectionPolicy::new().with_max_attempts(1))
            .with_activity_timeout(Duration::from_secs(5))
            .with_pong_timeout(Duration::from_secs(2))
            .with_reconnection_policy(ReconnectionPolicy::new().with_jitter(false))
            .with_shutdown_timeout(Duration::ZERO)
            .with_outbound_encoding(OutboundEncoding::Binary)
            .with_auth_endpoint("http://localhost:8000/auth");
        assert_eq!(config.namespace, "acme");
        assert_eq!(config.ws_host, "localhost:6001");
        assert_eq!(config.discovery_endpoint, "http://localhost:7000");
        assert_eq!(config.discovery_policy.max_attempts, 1);
        assert_eq!(config.activity_timeout, Duration::from_secs(5));
        assert_eq!(config.pong_timeout, Duration::from_secs(2));
        assert!(!config.reconnection.jitter);
        assert_eq!(config.shutdown_timeout, Duration::ZERO);
        assert_eq!(config.outbound_encoding, OutboundEncoding::Binary);
        assert_eq!(config.auth_endpoint.as_deref(), Some("http://localhost:8000/auth"));
    }

    #[test]
    fn event_channel_capacity_is_clamped_to_one() {
        let config = ClientConfig::new("k").with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);
    }

    #[test]
    fn direct_url_shape() {
        let config = ClientConfig::new("sk_abc").with_ws_endpoint("ws", "localhost:6001");
        let url = Url::parse(&config.direct_url().unwrap()).unwrap();
        assert_eq!(url.host_str(), Some("localhost"));
        assert_eq!(url.port(), Some(6001));
        assert_eq!(url.path(), "/app/sk_abc");
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(query[0], ("client".to_string(), "pulsewire-rust".to_string()));
        assert_eq!(query[1].0, "version");
    }

    #[test]
    fn config_debug_hides_key() {
        let rendered = format!("{:?}", ClientConfig::new("sk_very_secret"));
        assert!(!rendered.contains("sk_very_secret"));
    }

    #[tokio::test]
    async fn channel_tokens_cannot_start_a_client() {
        let err = PulsewireClient::start(NeverConnector, ClientConfig::new("ct_abc")).unwrap_err();
        assert!(matches!(err, PulsewireError::InvalidCredential(_)));
    }

    #[tokio::test]
    async fn invalid_endpoint_is_rejected_at_start() {
        let config = ClientConfig::new("sk_abc").with_ws_endpoint("ws", "bad host");
        let err = PulsewireClient::start(NeverConnector, config).unwrap_err();
        assert!(matches!(err, PulsewireError::Url(_)));
    }

    #[tokio::test]
    async fn subscribe_validates_synchronously() {
        let (mut client, _events) =
            PulsewireClient::start(NeverConnector, ClientConfig::new("sk_abc")).unwrap();

        assert!(matches!(
            client.subscribe("bad name"),
            Err(PulsewireError::Validation(ValidationError::InvalidChannelName(_)))
        ));
        assert!(matches!(
            client.subscribe("presence-room"),
            Err(PulsewireError::Validation(ValidationError::MissingUserId))
        ));
        assert!(matches!(
            client.subscribe_presence("private-room", serde_json::json!({"user_id": 1})),
            Err(PulsewireError::Validation(ValidationError::NotPresenceChannel(_)))
        ));
        assert!(matches!(
            client.subscribe_presence("presence-room", serde_json::json!({"name": "x"})),
            Err(PulsewireError::Validation(ValidationError::MissingUserId))
        ));

        client.shutdown().await;
    }

    #[tokio::test]
    async fn commands_fail_after_shutdown() {
        let (mut client, mut events) =
            PulsewireClient::start(NeverConnector, ClientConfig::new("sk_abc")).unwrap();
        client.shutdown().await;

        assert!(events.recv().await.is_none());
        assert!(matches!(client.connect(), Err(PulsewireError::ClientClosed)));
        assert!(matches!(
            client.subscribe("news"),
            Err(PulsewireError::ClientClosed)
        ));
        assert!(!client.channel("private-a").trigger("client-x", Value::Null).await);
        assert_eq!(client.channel("news").info().await, None);
    }

    #[tokio::test]
    async fn double_shutdown_does_not_panic() {
        let (mut client, _events) =
            PulsewireClient::start(NeverConnector, ClientConfig::new("sk_abc")).unwrap();
        client.shutdown().await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_while_connecting_reports_disconnected() {
        let (mut client, mut events) =
            PulsewireClient::start(NeverConnector, ClientConfig::new("sk_abc")).unwrap();
        client.connect().unwrap();
        client
            .wait_for_state(ConnectionState::Connecting)
            .await
            .unwrap();
        client.shutdown().await;

        let mut last = None;
        while let Some(event) = events.recv().await {
            if let Some(state) = event.state() {
                last = Some(state);
            }
        }
        assert_eq!(last, Some(ConnectionState::Disconnected));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn drop_without_explicit_shutdown() {
        let (client, _events) =
            PulsewireClient::start(NeverConnector, ClientConfig::new("sk_abc")).unwrap();
        client.connect().unwrap();
        drop(client);
    }

    #[tokio::test]
    async fn debug_impl_for_client() {
        let (mut client, _events) =
            PulsewireClient::start(NeverConnector, ClientConfig::new("sk_abc")).unwrap();
        let rendered = format!("{client:?}");
        assert!(rendered.contains("PulsewireClient"));
        assert!(rendered.contains("Disconnected"));
        client.shutdown().await;
    }
}
