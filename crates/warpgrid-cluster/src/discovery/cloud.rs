//! Cloud provider discovery.
//!
//! Lists instances from the provider's instance-metadata endpoint,
//! keeps running ones carrying the configured tag, and probes their
//! private addresses the same way as a static peer list.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::BodyExt;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use super::static_peers::StaticPeerDiscovery;
use super::{DiscoveryStrategy, duration_or};
use crate::address::Address;
use crate::config::{CloudConfig, deadline_after};
use crate::error::{ClusterError, ClusterResult};
use crate::join::JoinInfo;
use crate::state::ClusterState;

/// One entry of the instance listing.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudInstance {
    pub private_ip: IpAddr,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

pub struct CloudDiscovery {
    config: CloudConfig,
    state: Arc<ClusterState>,
    port: u16,
    connect_timeout: Duration,
}

impl CloudDiscovery {
    pub fn new(config: CloudConfig, state: Arc<ClusterState>, port: u16) -> Self {
        let connect_timeout = duration_or(&config.connection_timeout, Duration::from_secs(5));
        Self {
            config,
            state,
            port,
            connect_timeout,
        }
    }

    /// `{endpoint}/instances?tag-key=..&tag-value=..&region=..`
    pub fn lookup_uri(&self) -> ClusterResult<http::Uri> {
        let endpoint = &self.config.endpoint;
        let invalid =
            |reason: String| ClusterError::CloudLookup(format!("invalid endpoint {endpoint}: {reason}"));

        let mut url = Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
        if url.scheme() != "http" {
            return Err(invalid(format!("unsupported scheme {}", url.scheme())));
        }
        url.path_segments_mut()
            .map_err(|()| invalid("cannot carry a path".into()))?
            .pop_if_empty()
            .push("instances");

        let params: Vec<(&str, &str)> = [
            ("tag-key", &self.config.tag_key),
            ("tag-value", &self.config.tag_value),
            ("region", &self.config.region),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_deref().map(|value| (name, value)))
        .collect();
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }

        url.as_str()
            .parse::<http::Uri>()
            .map_err(|e| invalid(e.to_string()))
    }

    /// Fetch the instance listing and return candidate peer addresses.
    pub async fn lookup(&self) -> ClusterResult<Vec<Address>> {
        let uri = self.lookup_uri()?;
        let authority = uri
            .authority()
            .ok_or_else(|| ClusterError::CloudLookup(format!("endpoint {uri} has no host")))?
            .clone();
        let port = authority.port_u16().unwrap_or(80);

        let stream = tokio::net::TcpStream::connect((authority.host(), port)).await?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ClusterError::CloudLookup(format!("handshake: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let path = uri.path_and_query().map_or("/", |p| p.as_str());
        let req = http::Request::builder()
            .method("GET")
            .uri(path)
            .header("host", authority.as_str())
            .header("accept", "application/json")
            .header("user-agent", "warpgrid-cluster/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| ClusterError::CloudLookup(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ClusterError::CloudLookup(format!("request: {e}")))?;
        if !resp.status().is_success() {
            return Err(ClusterError::CloudLookup(format!("status {}", resp.status())));
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ClusterError::CloudLookup(format!("body: {e}")))?
            .to_bytes();
        let instances: Vec<CloudInstance> = serde_json::from_slice(&body)?;
        Ok(self.select(&instances))
    }

    /// Running instances that carry the configured tag.
    pub fn select(&self, instances: &[CloudInstance]) -> Vec<Address> {
        instances
            .iter()
            .filter(|i| i.state.is_empty() || i.state.eq_ignore_ascii_case("running"))
            .filter(|i| match (&self.config.tag_key, &self.config.tag_value) {
                (Some(key), Some(value)) => i.tags.get(key) == Some(value),
                (Some(key), None) => i.tags.contains_key(key),
                _ => true,
            })
            .map(|i| Address::new(i.private_ip, self.port))
            .collect()
    }
}

#[async_trait]
impl DiscoveryStrategy for CloudDiscovery {
    fn name(&self) -> &str {
        "cloud"
    }

    async fn discover_master(&self, local: &JoinInfo, budget: Duration) -> Option<Address> {
        let deadline = deadline_after(budget);

        let peers = match tokio::time::timeout(self.connect_timeout.min(budget), self.lookup()).await {
            Ok(Ok(peers)) => peers,
            Ok(Err(e)) => {
                warn!(error = %e, endpoint = %self.config.endpoint, "cloud instance lookup failed");
                return None;
            }
            Err(_) => {
                warn!(endpoint = %self.config.endpoint, "cloud instance lookup timed out");
                return None;
            }
        };
        debug!(instances = peers.len(), "cloud lookup complete");

        let probe = StaticPeerDiscovery::from_addresses(
            &peers,
            Arc::clone(&self.state),
            self.connect_timeout,
            Duration::from_secs(1),
        );
        probe
            .discover_master(local, deadline.saturating_duration_since(Instant::now()))
            .await
    }
}
