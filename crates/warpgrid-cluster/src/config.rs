//! Discovery configuration.
//!
//! These sections are embedded in the node's `warpgrid.toml`. Durations
//! are written as strings such as `"5s"` or `"500ms"`.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Which discovery mechanisms are enabled. The first enabled one wins,
/// in the order multicast, tcp-ip, cloud.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub multicast: MulticastConfig,
    pub tcp_ip: StaticPeersConfig,
    pub cloud: CloudConfig,
}

impl DiscoveryConfig {
    pub fn any_enabled(&self) -> bool {
        self.multicast.enabled || self.tcp_ip.enabled || self.cloud.enabled
    }

    /// Reject intervals and timeouts the strategies cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        let durations = [
            ("multicast.poll_interval", &self.multicast.poll_interval),
            ("tcp_ip.poll_interval", &self.tcp_ip.poll_interval),
            ("tcp_ip.connection_timeout", &self.tcp_ip.connection_timeout),
            ("cloud.connection_timeout", &self.cloud.connection_timeout),
        ];
        for (name, value) in durations {
            if parse_duration(value).is_none_or(|d| d.is_zero()) {
                return Err(format!("{name}: '{value}' is not a positive duration"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastConfig {
    pub enabled: bool,
    pub group: Ipv4Addr,
    pub port: u16,
    pub ttl: u32,
    /// How often a searching node re-broadcasts its request.
    pub poll_interval: String,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group: Ipv4Addr::new(224, 2, 2, 3),
            port: 54327,
            ttl: 32,
            poll_interval: "1s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticPeersConfig {
    pub enabled: bool,
    /// `host:port` or bare `host` entries.
    pub members: Vec<String>,
    pub connection_timeout: String,
    /// Wait between probe rounds while another peer is claiming master.
    pub poll_interval: String,
}

impl Default for StaticPeersConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            members: Vec::new(),
            connection_timeout: "5s".to_string(),
            poll_interval: "1s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub enabled: bool,
    /// Base URL of the instance-listing endpoint (plain HTTP).
    pub endpoint: String,
    pub region: Option<String>,
    pub tag_key: Option<String>,
    pub tag_value: Option<String>,
    pub connection_timeout: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://169.254.169.254".to_string(),
            region: None,
            tag_key: None,
            tag_value: None,
            connection_timeout: "5s".to_string(),
        }
    }
}

/// Longest duration accepted anywhere in the configuration.
pub const MAX_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Parse a duration string like "5s", "500ms", "1m", or bare seconds.
///
/// Values above [`MAX_DURATION`] are rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let parsed = if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    };
    parsed.filter(|d| *d <= MAX_DURATION)
}

/// `now + budget`, saturating far in the future instead of overflowing.
pub fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget).unwrap_or(now + MAX_DURATION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_or_invalid_discovery_intervals_are_rejected() {
        assert!(DiscoveryConfig::default().validate().is_ok());

        let mut config = DiscoveryConfig::default();
        config.tcp_ip.poll_interval = "0s".into();
        let err = config.validate().unwrap_err();
        assert!(err.starts_with("tcp_ip.poll_interval"), "{err}");

        let mut config = DiscoveryConfig::default();
        config.multicast.poll_interval = "0ms".into();
        assert!(config.validate().is_err());

        let mut config = DiscoveryConfig::default();
        config.cloud.connection_timeout = "18446744073709551615s".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("2s"), Some(Duration::from_secs(2)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn oversized_durations_are_rejected() {
        assert_eq!(parse_duration("18446744073709551615s"), None);
        assert_eq!(parse_duration("18446744073709551615m"), None);
        assert_eq!(parse_duration("604800s"), Some(MAX_DURATION));
    }

    #[tokio::test]
    async fn deadline_saturates() {
        let far = deadline_after(Duration::MAX);
        assert!(far > Instant::now() + Duration::from_secs(3600));
    }

    #[test]
    fn nothing_enabled_by_default() {
        let config = DiscoveryConfig::default();
        assert!(!config.any_enabled());
        assert_eq!(config.multicast.group, Ipv4Addr::new(224, 2, 2, 3));
    }

    #[test]
    fn partial_sections_take_defaults() {
        let config: DiscoveryConfig = serde_json::from_str(
            r#"{"tcp_ip": {"enabled": true, "members": ["10.0.0.1:5701"]}}"#,
        )
        .unwrap();
        assert!(config.tcp_ip.enabled);
        assert_eq!(config.tcp_ip.connection_timeout, "5s");
        assert!(!config.multicast.enabled);
    }
}
