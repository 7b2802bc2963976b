//! `warpgrid.toml` node configuration.
//!
//! ```toml
//! lite_member = false
//! partition_count = 271
//!
//! [group]
//! name = "dev"
//! password = "dev-pass"
//!
//! [network]
//! port = 5701
//!
//! [network.discovery.tcp_ip]
//! enabled = true
//! members = ["10.0.0.1", "10.0.0.2:5702"]
//!
//! [properties]
//! join_timeout = "20s"
//! backup_drain_timeout = "2m"
//! ```
//!
//! Every section is optional; missing keys take their defaults.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use warpgrid_cluster::{
    ConfigFingerprint, DiscoveryConfig, JoinSettings, NodeRole, RejectionPolicy, ResolverConfig,
    parse_duration,
};

use crate::error::{NodeError, NodeResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Join as a lite member that owns no partitions.
    pub lite_member: bool,
    pub partition_count: u32,
    /// Feature flags that must match across the cluster.
    pub features: BTreeSet<String>,
    pub group: GroupConfig,
    pub network: NetworkConfig,
    pub security: SecurityConfig,
    pub properties: NodeProperties,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            lite_member: false,
            partition_count: 271,
            features: BTreeSet::new(),
            group: GroupConfig::default(),
            network: NetworkConfig::default(),
            security: SecurityConfig::default(),
            properties: NodeProperties::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub name: String,
    pub password: String,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            name: "dev".to_string(),
            password: "dev-pass".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub port: u16,
    pub port_auto_increment: bool,
    pub port_count: u16,
    pub interfaces: Vec<String>,
    pub bind_address: Option<IpAddr>,
    pub discovery: DiscoveryConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: 5701,
            port_auto_increment: true,
            port_count: 100,
            interfaces: Vec::new(),
            bind_address: None,
            discovery: DiscoveryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Require joiners to present group credentials.
    pub enabled: bool,
}

/// Tunables for join, shutdown, and the service thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeProperties {
    pub join_timeout: String,
    pub handshake_timeout: String,
    /// Bound on waiting for a service-thread job.
    pub service_timeout: String,
    pub backup_drain_poll_interval: String,
    /// Give up waiting for backups after this long. Unset waits forever.
    pub backup_drain_timeout: Option<String>,
    /// 1 (lowest) to 10 (highest); 5 is normal.
    pub service_thread_priority: i32,
    /// Run a forced shutdown when the process receives SIGINT/SIGTERM.
    pub shutdown_hook_enabled: bool,
    pub max_restart_attempts: u32,
    pub max_join_redirects: usize,
    pub on_join_rejected: RejectionPolicy,
}

impl Default for NodeProperties {
    fn default() -> Self {
        Self {
            join_timeout: "20s".to_string(),
            handshake_timeout: "5s".to_string(),
            service_timeout: "5s".to_string(),
            backup_drain_poll_interval: "1s".to_string(),
            backup_drain_timeout: None,
            service_thread_priority: 5,
            shutdown_hook_enabled: true,
            max_restart_attempts: 3,
            max_join_redirects: 3,
            on_join_rejected: RejectionPolicy::Standalone,
        }
    }
}

/// Parsed durations from [`NodeProperties`].
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub join_timeout: Duration,
    pub handshake_timeout: Duration,
    pub service_timeout: Duration,
    pub backup_drain_poll_interval: Duration,
    pub backup_drain_timeout: Option<Duration>,
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> NodeResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> NodeResult<Self> {
        toml::from_str(content).map_err(|e| NodeError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> NodeResult<String> {
        toml::to_string_pretty(self).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Check values that serde cannot and parse every duration.
    pub fn validate(&self) -> NodeResult<Timings> {
        if self.group.name.trim().is_empty() {
            return Err(NodeError::Config("group name must not be empty".into()));
        }
        if self.partition_count == 0 {
            return Err(NodeError::Config("partition_count must be positive".into()));
        }
        if !(1..=10).contains(&self.properties.service_thread_priority) {
            return Err(NodeError::Config(format!(
                "service_thread_priority {} is outside 1..=10",
                self.properties.service_thread_priority
            )));
        }

        self.network.discovery.validate().map_err(NodeError::Config)?;

        let p = &self.properties;
        Ok(Timings {
            join_timeout: duration("join_timeout", &p.join_timeout)?,
            handshake_timeout: positive("handshake_timeout", &p.handshake_timeout)?,
            service_timeout: positive("service_timeout", &p.service_timeout)?,
            backup_drain_poll_interval: positive(
                "backup_drain_poll_interval",
                &p.backup_drain_poll_interval,
            )?,
            backup_drain_timeout: p
                .backup_drain_timeout
                .as_deref()
                .map(|v| duration("backup_drain_timeout", v))
                .transpose()?,
        })
    }

    pub fn role(&self) -> NodeRole {
        if self.lite_member {
            NodeRole::Lite
        } else {
            NodeRole::Full
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            port: self.network.port,
            port_auto_increment: self.network.port_auto_increment,
            port_count: self.network.port_count,
            interfaces: self.network.interfaces.clone(),
            bind_address: self.network.bind_address,
        }
    }

    pub fn fingerprint(&self) -> ConfigFingerprint {
        ConfigFingerprint::new(
            self.group.name.clone(),
            &self.group.password,
            self.partition_count,
            self.features.clone(),
        )
    }

    pub fn join_settings(&self, timings: &Timings) -> JoinSettings {
        JoinSettings {
            join_timeout: timings.join_timeout,
            handshake_timeout: timings.handshake_timeout,
            on_join_rejected: self.properties.on_join_rejected,
            max_redirects: self.properties.max_join_redirects,
        }
    }
}

fn duration(name: &str, value: &str) -> NodeResult<Duration> {
    parse_duration(value).ok_or_else(|| NodeError::Config(format!("{name}: invalid duration '{value}'")))
}

fn positive(name: &str, value: &str) -> NodeResult<Duration> {
    let parsed = duration(name, value)?;
    if parsed.is_zero() {
        return Err(NodeError::Config(format!("{name} must be positive")));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = NodeConfig::from_toml("").unwrap();
        assert_eq!(config.network.port, 5701);
        assert_eq!(config.group.name, "dev");
        assert!(!config.network.discovery.any_enabled());

        let timings = config.validate().unwrap();
        assert_eq!(timings.join_timeout, Duration::from_secs(20));
        assert_eq!(timings.backup_drain_poll_interval, Duration::from_secs(1));
        assert!(timings.backup_drain_timeout.is_none());
    }

    #[test]
    fn parses_nested_sections() {
        let config = NodeConfig::from_toml(
            r#"
            lite_member = true

            [group]
            name = "orders"

            [network]
            port = 6000

            [network.discovery.tcp_ip]
            enabled = true
            members = ["10.0.0.1", "10.0.0.2:6001"]

            [properties]
            backup_drain_timeout = "2m"
            on_join_rejected = "fail"
            "#,
        )
        .unwrap();

        assert_eq!(config.role(), NodeRole::Lite);
        assert_eq!(config.group.password, "dev-pass");
        assert_eq!(config.network.discovery.tcp_ip.members.len(), 2);
        assert_eq!(config.properties.on_join_rejected, RejectionPolicy::Fail);

        let timings = config.validate().unwrap();
        assert_eq!(timings.backup_drain_timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let mut config = NodeConfig::default();
        config.properties.join_timeout = "eventually".into();
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));

        let mut config = NodeConfig::default();
        config.properties.service_thread_priority = 11;
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));

        assert!(matches!(
            NodeConfig::from_toml("partition_count = \"many\""),
            Err(NodeError::Config(_))
        ));
    }

    #[test]
    fn unusable_durations_are_config_errors() {
        let mut config = NodeConfig::default();
        config.properties.join_timeout = "18446744073709551615s".into();
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));

        let mut config = NodeConfig::default();
        config.properties.backup_drain_timeout = Some("18446744073709551615m".into());
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));

        let mut config = NodeConfig::default();
        config.properties.backup_drain_poll_interval = "0s".into();
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid configuration: backup_drain_poll_interval must be positive"
        );

        let mut config = NodeConfig::default();
        config.network.discovery.tcp_ip.poll_interval = "0ms".into();
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));

        let mut config = NodeConfig::default();
        config.properties.join_timeout = "0s".into();
        assert_eq!(config.validate().unwrap().join_timeout, Duration::ZERO);
    }

    #[test]
    fn toml_round_trip_keeps_discovery() {
        let mut config = NodeConfig::default();
        config.network.discovery.multicast.enabled = true;
        let text = config.to_toml().unwrap();
        let back = NodeConfig::from_toml(&text).unwrap();
        assert!(back.network.discovery.multicast.enabled);
    }
}
