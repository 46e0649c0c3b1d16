#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! HTTP collaborators against a local mock server: discovery, the channel
//! authorization endpoint and the publisher control API.

use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use pulsewire_client::auth::{AuthRequest, ChannelAuthorizer, HttpChannelAuthorizer};
use pulsewire_client::discovery::{DiscoveryClient, NodeId};
use pulsewire_client::publisher::{BatchEvent, Publisher, PublisherConfig};
use pulsewire_client::{PulsewireError, ReconnectionPolicy};

fn fast_retry() -> ReconnectionPolicy {
    ReconnectionPolicy::new()
        .with_max_attempts(3)
        .with_base_delay(Duration::from_millis(10))
        .with_jitter(false)
}

fn publisher(server: &MockServer) -> Publisher {
    let config = PublisherConfig::new("42", "app-key", "app-secret")
        .with_endpoint("http", format!("{}:{}", server.host(), server.port()))
        .with_retry_policy(fast_retry());
    Publisher::new(config).unwrap()
}

fn request(channel: &str, channel_data: Option<&str>) -> AuthRequest {
    AuthRequest {
        socket_id: "1.2".into(),
        channel_name: channel.into(),
        channel_data: channel_data.map(String::from),
    }
}

// ── Discovery ───────────────────────────────────────────────────────

#[tokio::test]
async fn discovery_resolves_an_endpoint() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/discover")
                .query_param("api_key", "pk_abc");
            then.status(200).json_body(json!({
                "discovery_token": "tok1",
                "node_id": 3,
                "cluster": "eu1",
                "region": "eu-west"
            }));
        })
        .await;

    let client = DiscoveryClient::new(server.base_url()).unwrap();
    let endpoint = assert_ok!(client.discover("pk_abc").await);
    assert_eq!(endpoint.token, "tok1");
    assert_eq!(endpoint.node_id, NodeId::Number(3));
    assert_eq!(endpoint.region.as_deref(), Some("eu-west"));
    let url = endpoint.transport_url("wss", "ws.pulsewire.io").unwrap();
    assert_eq!(url.host_str(), Some("eu1-node3.ws.pulsewire.io"));
    mock.assert_async().await;
}

#[tokio::test]
async fn discovery_gives_up_after_its_retry_budget() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/discover");
            then.status(503);
        })
        .await;

    let err = DiscoveryClient::new(server.base_url())
        .unwrap()
        .with_retry_policy(fast_retry())
        .discover("pk_abc")
        .await
        .unwrap_err();
    let PulsewireError::Discovery { attempts, reason } = err else {
        panic!("expected a discovery error, got {err:?}");
    };
    assert_eq!(attempts, 3);
    assert!(reason.contains("503"));
    mock.assert_calls_async(3).await;
}

// ── Channel authorization ───────────────────────────────────────────

#[tokio::test]
async fn authorizer_posts_socket_and_channel() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/pulsewire/auth")
                .header("authorization", "Bearer session-1")
                .json_body(json!({"socket_id": "1.2", "channel_name": "private-orders"}));
            then.status(200).json_body(json!({"auth": "1.2:abcdef"}));
        })
        .await;

    let authorizer = HttpChannelAuthorizer::new(&server.url("/pulsewire/auth"))
        .unwrap()
        .with_header("authorization", "Bearer session-1");
    let result = authorizer
        .authorize(&request("private-orders", None))
        .await
        .unwrap();
    assert_eq!(result.auth, "1.2:abcdef");
    assert_eq!(result.channel_data, None);
    mock.assert_async().await;
}

#[tokio::test]
async fn authorizer_forwards_presence_channel_data() {
    let server = MockServer::start_async().await;
    let channel_data = r#"{"user_id":"u1"}"#;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/auth").json_body(json!({
                "socket_id": "1.2",
                "channel_name": "presence-room",
                "channel_data": channel_data
            }));
            then.status(200)
                .json_body(json!({"auth": "1.2:ff", "channel_data": channel_data}));
        })
        .await;

    let result = HttpChannelAuthorizer::new(&server.url("/auth"))
        .unwrap()
        .authorize(&request("presence-room", Some(channel_data)))
        .await
        .unwrap();
    assert_eq!(result.channel_data.as_deref(), Some(channel_data));
    mock.assert_async().await;
}

#[tokio::test]
async fn authorizer_rejection_is_not_retried() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/auth");
            then.status(403).body("forbidden");
        })
        .await;

    let err = HttpChannelAuthorizer::new(&server.url("/auth"))
        .unwrap()
        .with_retry_policy(fast_retry())
        .authorize(&request("private-orders", None))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "authorization failed for private-orders: HTTP 403"
    );
    mock.assert_calls_async(1).await;
}

#[tokio::test]
async fn authorizer_requires_auth_in_the_response() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/auth");
            then.status(200).json_body(json!({"channel_data": "{}"}));
        })
        .await;

    let err = HttpChannelAuthorizer::new(&server.url("/auth"))
        .unwrap()
        .authorize(&request("private-orders", None))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PulsewireError::Authorization { ref reason, .. } if reason == "response missing auth"
    ));
}

// ── Publisher ───────────────────────────────────────────────────────

#[tokio::test]
async fn trigger_posts_a_signed_event() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/apps/42/events")
                .query_param("auth_key", "app-key")
                .query_param("auth_version", "1.0")
                .query_param_exists("auth_timestamp")
                .query_param_exists("body_sha256")
                .query_param_exists("auth_signature")
                .json_body(json!({
                    "name": "order-created",
                    "channels": ["orders", "private-orders"],
                    "data": "{\"id\":7}",
                    "socket_id": "1.2"
                }));
            then.status(200).json_body(json!({}));
        })
        .await;

    publisher(&server)
        .trigger(
            &["orders", "private-orders"],
            "order-created",
            &json!({"id": 7}),
            Some("1.2"),
        )
        .await
        .unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn failed_post_is_not_retried() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/apps/42/events");
            then.status(500).body("boom");
        })
        .await;

    let err = assert_err!(
        publisher(&server)
            .trigger(&["orders"], "e", &json!(1), None)
            .await
    );
    assert!(matches!(
        err,
        PulsewireError::HttpStatus { status: 500, ref body } if body == "boom"
    ));
    mock.assert_calls_async(1).await;
}

#[tokio::test]
async fn batch_trigger_posts_every_event() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/apps/42/batch_events")
                .json_body(json!({"batch": [
                    {"name": "a", "channel": "orders", "data": "1"},
                    {"name": "b", "channel": "news", "data": "plain", "socket_id": "3.4"}
                ]}));
            then.status(200).json_body(json!({}));
        })
        .await;

    publisher(&server)
        .trigger_batch(&[
            BatchEvent::new("orders", "a", json!(1)),
            BatchEvent::new("news", "b", json!("plain")).excluding("3.4"),
        ])
        .await
        .unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn channel_info_is_fetched_with_requested_attributes() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/apps/42/channels/presence-room")
                .query_param("info", "user_count,subscription_count")
                .query_param_exists("auth_signature");
            then.status(200)
                .json_body(json!({"occupied": true, "user_count": 3, "subscription_count": 4}));
        })
        .await;

    let state = publisher(&server)
        .channel_info("presence-room", &["user_count", "subscription_count"])
        .await
        .unwrap();
    assert!(state.occupied);
    assert_eq!(state.user_count, Some(3));
    assert_eq!(state.subscription_count, Some(4));
    mock.assert_async().await;
}

#[tokio::test]
async fn failed_get_is_retried_within_budget() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/apps/42/channels");
            then.status(503);
        })
        .await;

    let err = publisher(&server).channels(None, &[]).await.unwrap_err();
    assert!(matches!(err, PulsewireError::HttpStatus { status: 503, .. }));
    mock.assert_calls_async(3).await;
}

#[tokio::test]
async fn channels_are_listed_by_prefix() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/apps/42/channels")
                .query_param("filter_by_prefix", "presence-");
            then.status(200)
                .json_body(json!({"channels": {"presence-room": {"user_count": 2}}}));
        })
        .await;

    let list = publisher(&server)
        .channels(Some("presence-"), &["user_count"])
        .await
        .unwrap();
    assert_eq!(list.channels.len(), 1);
    assert_eq!(list.channels["presence-room"].user_count, Some(2));
}

#[tokio::test]
async fn presence_users_are_listed() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/apps/42/channels/presence-room/users");
            then.status(200)
                .json_body(json!({"users": [{"id": 1}, {"id": "b"}]}));
        })
        .await;

    let users = publisher(&server).presence_users("presence-room").await.unwrap();
    let ids: Vec<&str> = users.iter().map(|u| u.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "b"]);
}

#[tokio::test]
async fn user_connections_are_terminated() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/apps/42/users/u-17/terminate_connections")
                .query_param_exists("body_sha256");
            then.status(200).json_body(json!({}));
        })
        .await;

    assert_ok!(publisher(&server).terminate_user_connections("u-17").await);
    mock.assert_async().await;
}

#[tokio::test]
async fn publisher_signs_channels_and_verifies_webhooks() {
    let server = MockServer::start_async().await;
    let publisher = publisher(&server);

    let result = publisher
        .authorize_channel("1.2", "private-orders", None)
        .unwrap();
    assert!(pulsewire_client::signature::verify_channel_auth(
        "app-secret",
        "1.2",
        "private-orders",
        None,
        &result.auth
    ));

    let body = br#"{"time_ms":1,"events":[{"name":"channel_vacated","channel":"orders"}]}"#;
    let signature = pulsewire_client::signature::sign("app-secret", body).unwrap();
    let webhook = publisher.verify_webhook("app-key", &signature, body).unwrap();
    assert_eq!(webhook.events[0].channel, "orders");
    assert!(publisher.verify_webhook("app-key", "00", body).is_err());
}
