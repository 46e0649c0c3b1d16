//! Channel authorization exchange.
//!
//! Before subscribing to a private or presence channel the session asks a
//! [`ChannelAuthorizer`] for an authorization string bound to the current
//! connection id. Results are used once and never cached: a reconnect gets
//! a new connection id and therefore a fresh exchange.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::backoff::ReconnectionPolicy;
use crate::error::{PulsewireError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_ATTEMPTS: u32 = 3;

/// Body of the authorization request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthRequest {
    pub socket_id: String,
    pub channel_name: String,
    /// Serialized presence user data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<String>,
}

/// A successful authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationResult {
    pub auth: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<String>,
}

/// Exchanges `(channel, socket id)` for an authorization string.
///
/// Implementations may be called concurrently for different channels.
#[async_trait]
pub trait ChannelAuthorizer: Send + Sync + 'static {
    /// # Errors
    ///
    /// Any error is reported as a subscription error on that channel and
    /// the subscribe frame is not sent.
    async fn authorize(&self, request: &AuthRequest) -> Result<AuthorizationResult>;
}

/// Authorizer that POSTs to an application-hosted endpoint.
///
/// Network failures are retried with backoff. A non-2xx status or a
/// response without `auth` fails immediately.
#[derive(Debug, Clone)]
pub struct HttpChannelAuthorizer {
    http: reqwest::Client,
    endpoint: Url,
    headers: Vec<(String, String)>,
    retry: ReconnectionPolicy,
}

impl HttpChannelAuthorizer {
    /// Create an authorizer for `endpoint`.
    ///
    /// # Errors
    ///
    /// Fails if the endpoint is not a valid URL or the HTTP client cannot be
    /// built.
    pub fn new(endpoint: &str) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            http,
            endpoint: Url::parse(endpoint)?,
            headers: Vec::new(),
            retry: ReconnectionPolicy::new().with_max_attempts(DEFAULT_ATTEMPTS),
        })
    }

    /// Add a header sent with every request (cookies, bearer tokens, …).
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Override the retry policy for network failures.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: ReconnectionPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn post_once(&self, request: &AuthRequest) -> Result<AuthorizationResult> {
        let mut builder = self.http.post(self.endpoint.clone()).json(request);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PulsewireError::Authorization {
                channel: request.channel_name.clone(),
                reason: format!("HTTP {}", status.as_u16()),
            });
        }

        let body: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| PulsewireError::Authorization {
                    channel: request.channel_name.clone(),
                    reason: format!("invalid response body: {e}"),
                })?;
        match serde_json::from_value::<AuthorizationResult>(body) {
            Ok(result) if !result.auth.is_empty() => Ok(result),
            _ => Err(PulsewireError::Authorization {
                channel: request.channel_name.clone(),
                reason: "response missing auth".into(),
            }),
        }
    }
}

#[async_trait]
impl ChannelAuthorizer for HttpChannelAuthorizer {
    async fn authorize(&self, request: &AuthRequest) -> Result<AuthorizationResult> {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.post_once(request).await {
                Ok(result) => {
                    debug!(channel = %request.channel_name, "channel authorized");
                    return Ok(result);
                }
                Err(e) if e.is_retriable() && attempt + 1 < attempts => {
                    let delay = self.retry.jittered_delay_for(attempt);
                    warn!(
                        channel = %request.channel_name,
                        attempt = attempt + 1,
                        ?delay,
                        "authorization request failed, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
