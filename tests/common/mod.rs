#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for Pulsewire client integration tests.
//!
//! Provides an in-memory [`MockConnector`] whose accepted connections are
//! driven from the test through [`ServerConn`], a signing [`MockAuthorizer`]
//! and helpers for building service frames.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use pulsewire_client::auth::{AuthRequest, AuthorizationResult, ChannelAuthorizer};
use pulsewire_client::codec;
use pulsewire_client::{ClientEvent, Connector, Frame, PulsewireError, Transport};

/// Generous enough for paused-clock tests, where time auto-advances to the
/// next timer whenever the runtime is idle.
const WAIT: Duration = Duration::from_secs(600);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── MockConnector ───────────────────────────────────────────────────

/// Connector that hands out in-memory transports.
///
/// Every accepted connection is queued as a [`ServerConn`] for the test to
/// pick up with [`next_connection`](Self::next_connection).
#[derive(Clone)]
pub struct MockConnector {
    inner: Arc<ConnectorInner>,
}

struct ConnectorInner {
    urls: StdMutex<Vec<String>>,
    fail_next: AtomicU32,
    fail_always: AtomicBool,
    accepted_tx: mpsc::UnboundedSender<ServerConn>,
    accepted_rx: Mutex<mpsc::UnboundedReceiver<ServerConn>>,
}

impl MockConnector {
    pub fn new() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ConnectorInner {
                urls: StdMutex::new(Vec::new()),
                fail_next: AtomicU32::new(0),
                fail_always: AtomicBool::new(false),
                accepted_tx,
                accepted_rx: Mutex::new(accepted_rx),
            }),
        }
    }

    /// Refuse the next `n` connection attempts with an I/O error.
    pub fn fail_next(&self, n: u32) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Refuse every connection attempt.
    pub fn fail_always(&self, fail: bool) {
        self.inner.fail_always.store(fail, Ordering::SeqCst);
    }

    /// Every URL a connection was attempted to, in order.
    pub fn urls(&self) -> Vec<String> {
        self.inner.urls.lock().unwrap().clone()
    }

    /// Wait for the next accepted connection.
    pub async fn next_connection(&self) -> ServerConn {
        let mut rx = self.inner.accepted_rx.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    fn should_fail(&self) -> bool {
        if self.inner.fail_always.load(Ordering::SeqCst) {
            return true;
        }
        self.inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, PulsewireError> {
        self.inner.urls.lock().unwrap().push(url.to_string());
        if self.should_fail() {
            return Err(PulsewireError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }

        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let transport = MockTransport {
            incoming: to_client_rx,
            outgoing: to_server_tx,
            closed: Arc::clone(&closed),
        };
        let conn = ServerConn {
            tx: to_client_tx,
            rx: to_server_rx,
            closed,
        };
        let _ = self.inner.accepted_tx.send(conn);
        Ok(Box::new(transport))
    }
}

// ── MockTransport ───────────────────────────────────────────────────

/// Client half of an in-memory connection. Channel-based, so `recv` is
/// cancel-safe.
struct MockTransport {
    /// `None` items signal a clean close by the server.
    incoming: mpsc::UnboundedReceiver<Option<Frame>>,
    outgoing: mpsc::UnboundedSender<Frame>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), PulsewireError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PulsewireError::TransportClosed);
        }
        let _ = self.outgoing.send(frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Frame, PulsewireError>> {
        match self.incoming.recv().await {
            Some(Some(frame)) => Some(Ok(frame)),
            Some(None) => None,
            // The test dropped its ServerConn; keep the connection open.
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), PulsewireError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ── ServerConn ──────────────────────────────────────────────────────

/// Server half of an in-memory connection.
pub struct ServerConn {
    tx: mpsc::UnboundedSender<Option<Frame>>,
    rx: mpsc::UnboundedReceiver<Frame>,
    closed: Arc<AtomicBool>,
}

impl ServerConn {
    pub fn send_json(&self, value: Value) {
        self.send_frame(Frame::Text(value.to_string()));
    }

    pub fn send_frame(&self, frame: Frame) {
        let _ = self.tx.send(Some(frame));
    }

    /// Close the connection from the server side.
    pub fn close(&self) {
        let _ = self.tx.send(None);
    }

    /// Whether the client closed its half.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn recv_frame(&mut self) -> Frame {
        tokio::time::timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client transport dropped")
    }

    /// Next client frame, decoded to JSON.
    pub async fn recv_json(&mut self) -> Value {
        let frame = self.recv_frame().await;
        let message = codec::decode(&frame).expect("client sent an undecodable frame");
        serde_json::to_value(message).unwrap()
    }

    /// Skip client frames until one with `event` arrives.
    pub async fn recv_event(&mut self, event: &str) -> Value {
        loop {
            let value = self.recv_json().await;
            if value["event"] == event {
                return value;
            }
        }
    }

    /// Send `connection_established` and wait for nothing.
    pub fn establish(&self, socket_id: &str) {
        self.send_json(established(socket_id));
    }
}

// ── MockAuthorizer ──────────────────────────────────────────────────

/// Authorizer that signs locally with a fixed secret and records requests.
#[derive(Clone)]
pub struct MockAuthorizer {
    secret: String,
    requests: Arc<StdMutex<Vec<AuthRequest>>>,
    fail: Arc<AtomicBool>,
}

impl MockAuthorizer {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
            requests: Arc::new(StdMutex::new(Vec::new())),
            fail: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<AuthRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelAuthorizer for MockAuthorizer {
    async fn authorize(&self, request: &AuthRequest) -> Result<AuthorizationResult, PulsewireError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(PulsewireError::Authorization {
                channel: request.channel_name.clone(),
                reason: "HTTP 403".into(),
            });
        }
        let user_data = request
            .channel_data
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()?;
        pulsewire_client::signature::authorize_channel(
            &self.secret,
            &request.socket_id,
            &request.channel_name,
            user_data.as_ref(),
        )
    }
}

// ── Events ──────────────────────────────────────────────────────────

/// Wait for the first event matching `predicate`, skipping the rest.
pub async fn wait_for_event<F>(events: &mut mpsc::Receiver<ClientEvent>, predicate: F) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed");
        if predicate(&event) {
            return event;
        }
    }
}

/// Everything currently queued on the event channel.
pub fn drain_events(events: &mut mpsc::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

// ── JSON helpers ────────────────────────────────────────────────────

pub fn established(socket_id: &str) -> Value {
    json!({
        "event": "pulsewire:connection_established",
        "data": { "socket_id": socket_id }
    })
}

pub fn established_with_timeout(socket_id: &str, activity_timeout: u64) -> Value {
    json!({
        "event": "pulsewire:connection_established",
        "data": { "socket_id": socket_id, "activity_timeout": activity_timeout }
    })
}

pub fn control(event: &str, channel: Option<&str>, data: Value) -> Value {
    let mut value = json!({ "event": format!("pulsewire:{event}"), "data": data });
    if let Some(channel) = channel {
        value["channel"] = json!(channel);
    }
    value
}

pub fn subscription_succeeded(channel: &str) -> Value {
    control("subscription_succeeded", Some(channel), Value::Null)
}

pub fn service_error(code: u16, message: &str) -> Value {
    control("error", None, json!({ "code": code, "message": message }))
}

pub fn app_event(channel: &str, event: &str, data: Value) -> Value {
    json!({ "event": event, "channel": channel, "data": data })
}
