//! Peer and master discovery.
//!
//! A node uses at most one strategy, picked from configuration. No
//! strategy at all means the node runs standalone and becomes its own
//! master. Strategies never fail the join: anything that goes wrong is
//! logged and reported as "no master found".

pub mod cloud;
pub mod multicast;
pub mod static_peers;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::address::Address;
use crate::config::{DiscoveryConfig, parse_duration};
use crate::join::JoinInfo;
use crate::state::ClusterState;

pub use cloud::CloudDiscovery;
pub use multicast::MulticastDiscovery;
pub use static_peers::StaticPeerDiscovery;

/// A mechanism for finding the current master.
#[async_trait]
pub trait DiscoveryStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Look for a master within `budget`. `None` means none was found
    /// and the caller should form its own cluster.
    async fn discover_master(&self, local: &JoinInfo, budget: Duration) -> Option<Address>;

    /// Publish this node's join info, e.g. after becoming master.
    async fn announce(&self, _local: &JoinInfo) {}

    /// Release any transport the strategy owns.
    async fn stop(&self) {}
}

/// The configured discovery strategy.
#[derive(Clone)]
pub enum Discovery {
    Multicast(Arc<MulticastDiscovery>),
    StaticPeers(Arc<StaticPeerDiscovery>),
    Cloud(Arc<CloudDiscovery>),
    /// Externally supplied strategy.
    Custom(Arc<dyn DiscoveryStrategy>),
}

impl Discovery {
    /// Build the strategy selected by `config`.
    ///
    /// A supplied `custom` strategy takes precedence. A multicast socket
    /// that cannot be set up is logged and the next enabled mechanism is
    /// tried. Must be called from within a tokio runtime.
    pub fn from_config(
        config: &DiscoveryConfig,
        state: Arc<ClusterState>,
        group_name: &str,
        default_port: u16,
        custom: Option<Arc<dyn DiscoveryStrategy>>,
    ) -> Option<Discovery> {
        if let Some(strategy) = custom {
            info!(strategy = strategy.name(), "using custom discovery");
            return Some(Discovery::Custom(strategy));
        }

        if config.multicast.enabled {
            match MulticastDiscovery::bind(&config.multicast, Arc::clone(&state), group_name) {
                Ok(multicast) => {
                    info!(group = %multicast.target(), "using multicast discovery");
                    return Some(Discovery::Multicast(Arc::new(multicast)));
                }
                Err(e) => error!(error = %e, "multicast discovery setup failed"),
            }
        }

        if config.tcp_ip.enabled {
            let peers = StaticPeerDiscovery::from_config(&config.tcp_ip, Arc::clone(&state), default_port);
            info!(peers = config.tcp_ip.members.len(), "using tcp-ip discovery");
            return Some(Discovery::StaticPeers(Arc::new(peers)));
        }

        if config.cloud.enabled {
            info!(endpoint = %config.cloud.endpoint, "using cloud discovery");
            return Some(Discovery::Cloud(Arc::new(CloudDiscovery::new(
                config.cloud.clone(),
                state,
                default_port,
            ))));
        }

        None
    }

    fn strategy(&self) -> &dyn DiscoveryStrategy {
        match self {
            Discovery::Multicast(s) => s.as_ref(),
            Discovery::StaticPeers(s) => s.as_ref(),
            Discovery::Cloud(s) => s.as_ref(),
            Discovery::Custom(s) => s.as_ref(),
        }
    }

    pub fn name(&self) -> &str {
        self.strategy().name()
    }

    pub async fn discover_master(&self, local: &JoinInfo, budget: Duration) -> Option<Address> {
        self.strategy().discover_master(local, budget).await
    }

    pub async fn announce(&self, local: &JoinInfo) {
        self.strategy().announce(local).await
    }

    pub async fn stop(&self) {
        self.strategy().stop().await
    }

    /// The multicast strategy, whose listener needs its own task.
    pub fn multicast(&self) -> Option<&Arc<MulticastDiscovery>> {
        match self {
            Discovery::Multicast(m) => Some(m),
            _ => None,
        }
    }
}

/// Parse a configured duration, falling back to `default` with a warning
/// when it is invalid or zero.
pub(crate) fn duration_or(value: &str, default: Duration) -> Duration {
    parse_duration(value).filter(|d| !d.is_zero()).unwrap_or_else(|| {
        warn!(value, fallback = ?default, "invalid duration in discovery config");
        default
    })
}
