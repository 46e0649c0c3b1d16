//! Endpoint discovery for public-key subscribers.
//!
//! `GET {endpoint}/discover?api_key={key}` returns a one-time routing token
//! and the node to connect to. A public-key client never opens a transport
//! without that token.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::backoff::ReconnectionPolicy;
use crate::error::{PulsewireError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_ATTEMPTS: u32 = 3;

/// Node id as sent by the service, either numeric or a string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum NodeId {
    Number(u64),
    Text(String),
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Raw discovery response. `discovery_token` is optional here so that a
/// response without it is reported as a discovery failure rather than a
/// parse error.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DiscoveryResponse {
    #[serde(default)]
    pub discovery_token: Option<String>,
    pub node_id: NodeId,
    pub cluster: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A usable discovery result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub token: String,
    pub node_id: NodeId,
    pub cluster: String,
    pub region: Option<String>,
}

impl Endpoint {
    /// `{scheme}://{cluster}-node{node_id}.{host}?discovery_token={token}`.
    pub fn transport_url(&self, scheme: &str, host: &str) -> Result<Url> {
        let mut url = Url::parse(&format!(
            "{scheme}://{}-node{}.{host}",
            self.cluster, self.node_id
        ))?;
        url.query_pairs_mut()
            .append_pair("discovery_token", &self.token);
        Ok(url)
    }
}

impl TryFrom<DiscoveryResponse> for Endpoint {
    type Error = String;

    fn try_from(response: DiscoveryResponse) -> std::result::Result<Self, Self::Error> {
        let token = response
            .discovery_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| "response carried no discovery_token".to_string())?;
        Ok(Self {
            token,
            node_id: response.node_id,
            cluster: response.cluster,
            region: response.region,
        })
    }
}

/// Resolves a public key to an [`Endpoint`].
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    http: reqwest::Client,
    endpoint: String,
    retry: ReconnectionPolicy,
}

impl DiscoveryClient {
    /// Client for `endpoint` (for example `https://discovery.pulsewire.io`),
    /// making up to 3 attempts with the default backoff.
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            retry: ReconnectionPolicy::new().with_max_attempts(DEFAULT_ATTEMPTS),
        })
    }

    /// Override the retry policy. `max_attempts` counts every request.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: ReconnectionPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run discovery, retrying every failure with its own backoff counter.
    ///
    /// # Errors
    ///
    /// Returns [`PulsewireError::Discovery`] once all attempts are spent.
    /// There is no fallback endpoint.
    pub async fn discover(&self, public_key: &str) -> Result<Endpoint> {
        let url = Url::parse_with_params(
            &format!("{}/discover", self.endpoint.trim_end_matches('/')),
            &[("api_key", public_key)],
        )?;

        let attempts = self.retry.max_attempts.max(1);
        let mut reason = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.jittered_delay_for(attempt - 1)).await;
            }
            match self.request(url.clone()).await {
                Ok(endpoint) => {
                    debug!(
                        cluster = %endpoint.cluster,
                        node_id = %endpoint.node_id,
                        "discovery resolved endpoint"
                    );
                    return Ok(endpoint);
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, of = attempts, "discovery failed: {e}");
                    reason = e;
                }
            }
        }
        Err(PulsewireError::Discovery { attempts, reason })
    }

    async fn request(&self, url: Url) -> std::result::Result<Endpoint, String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status.as_u16()));
        }
        let body: DiscoveryResponse = response.json().await.map_err(|e| e.to_string())?;
        Endpoint::try_from(body)
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
    fn response_accepts_numeric_and_string_node_ids() {
        let numeric: DiscoveryResponse =
            serde_json::from_value(json!({"discovery_token": "t", "node_id": 3, "cluster": "eu1"}))
                .unwrap();
        assert_eq!(numeric.node_id, NodeId::Number(3));
        let text: DiscoveryResponse = serde_json::from_value(
            json!({"discovery_token": "t", "node_id": "7b", "cluster": "us2", "region": "us", "ttl": 30}),
        )
        .unwrap();
        assert_eq!(text.node_id.to_string(), "7b");
        assert_eq!(text.extra["ttl"], json!(30));
    }

    #[test]
    fn missing_token_is_not_an_endpoint() {
        let response: DiscoveryResponse =
            serde_json::from_value(json!({"node_id": 1, "cluster": "eu1"})).unwrap();
        assert!(Endpoint::try_from(response).is_err());
    }

    #[test]
    fn transport_url_shape() {
        let endpoint = Endpoint {
            token: "tok 1".into(),
            node_id: NodeId::Number(3),
            cluster: "eu1".into(),
            region: None,
        };
        let url = endpoint.transport_url("wss", "ws.pulsewire.io").unwrap();
        assert_eq!(url.host_str(), Some("eu1-node3.ws.pulsewire.io"));
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.query(), Some("discovery_token=tok+1"));
    }
}
