//! Static peer list discovery ("tcp-ip").
//!
//! Each configured peer is probed over the handshake port. A peer that
//! already knows a master hands it back. When nobody does, the peer with
//! the lowest address claims master, so a node that sees a lower-addressed
//! live peer waits for it instead of forming a competing cluster.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{DiscoveryStrategy, duration_or};
use crate::address::Address;
use crate::client;
use crate::config::{StaticPeersConfig, deadline_after};
use crate::join::JoinInfo;
use crate::state::ClusterState;

/// Number of consecutive ports probed for a peer given without a port.
pub const PORT_SPAN: u16 = 3;

/// One configured peer: a host and the ports to try on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSpec {
    pub host: String,
    pub ports: Vec<u16>,
}

impl PeerSpec {
    /// Parse `host:port`, `[v6]:port`, or a bare host.
    pub fn parse(entry: &str, default_port: u16) -> Self {
        let entry = entry.trim();
        if let Ok(addr) = entry.parse::<std::net::SocketAddr>() {
            return Self {
                host: addr.ip().to_string(),
                ports: vec![addr.port()],
            };
        }
        if let Some((host, port)) = entry.rsplit_once(':') {
            if !host.contains(':') {
                if let Ok(port) = port.parse::<u16>() {
                    return Self {
                        host: host.to_string(),
                        ports: vec![port],
                    };
                }
            }
        }
        let last = default_port.saturating_add(PORT_SPAN - 1);
        Self {
            host: entry.trim_matches(|c| c == '[' || c == ']').to_string(),
            ports: (default_port..=last).collect(),
        }
    }
}

pub struct StaticPeerDiscovery {
    peers: Vec<PeerSpec>,
    state: Arc<ClusterState>,
    connect_timeout: Duration,
    poll_interval: Duration,
}

impl StaticPeerDiscovery {
    pub fn new(
        peers: Vec<PeerSpec>,
        state: Arc<ClusterState>,
        connect_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            peers,
            state,
            connect_timeout,
            poll_interval,
        }
    }

    pub fn from_config(config: &StaticPeersConfig, state: Arc<ClusterState>, default_port: u16) -> Self {
        let peers = config
            .members
            .iter()
            .filter(|m| !m.trim().is_empty())
            .map(|m| PeerSpec::parse(m, default_port))
            .collect();
        Self::new(
            peers,
            state,
            duration_or(&config.connection_timeout, Duration::from_secs(5)),
            duration_or(&config.poll_interval, Duration::from_secs(1)),
        )
    }

    /// Peers at already-resolved addresses.
    pub fn from_addresses(
        addresses: &[Address],
        state: Arc<ClusterState>,
        connect_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        let peers = addresses
            .iter()
            .map(|a| PeerSpec {
                host: a.host().to_string(),
                ports: vec![a.port()],
            })
            .collect();
        Self::new(peers, state, connect_timeout, poll_interval)
    }

    /// Resolve the configured peers, excluding this node.
    pub async fn candidates(&self) -> Vec<Address> {
        let this = self.state.this_address();
        let mut out: Vec<Address> = Vec::new();

        for spec in &self.peers {
            for &port in &spec.ports {
                let resolved = match spec.host.parse::<IpAddr>() {
                    Ok(ip) => Some(Address::new(ip, port)),
                    Err(_) => match tokio::net::lookup_host((spec.host.as_str(), port)).await {
                        Ok(mut addrs) => addrs.next().map(Address::from),
                        Err(e) => {
                            warn!(host = %spec.host, error = %e, "could not resolve peer");
                            None
                        }
                    },
                };
                if let Some(addr) = resolved {
                    if addr != this && !out.contains(&addr) {
                        out.push(addr);
                    }
                }
            }
        }

        out
    }
}

#[async_trait]
impl DiscoveryStrategy for StaticPeerDiscovery {
    fn name(&self) -> &str {
        "tcp-ip"
    }

    async fn discover_master(&self, local: &JoinInfo, budget: Duration) -> Option<Address> {
        let deadline = deadline_after(budget);
        let candidates = self.candidates().await;
        if candidates.is_empty() {
            debug!("no static peers to probe");
            return None;
        }

        loop {
            let mut waiting_on: Option<Address> = None;

            for &peer in &candidates {
                if !self.state.is_active() {
                    debug!("node stopped; abandoning static peer discovery");
                    return None;
                }
                if self.state.has_failed(&peer) {
                    continue;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return None;
                }

                match client::probe(peer, local.sender, self.connect_timeout.min(remaining)).await {
                    Ok(reply) => {
                        if let Some(master) = reply.master.filter(|_| reply.joined) {
                            info!(%peer, %master, "peer knows the master");
                            return Some(master);
                        }
                        if peer < local.sender {
                            waiting_on = Some(waiting_on.map_or(peer, |w| w.min(peer)));
                        }
                    }
                    Err(e) => {
                        debug!(%peer, error = %e, "peer unreachable");
                        self.state.failed_connection(peer);
                    }
                }
            }

            let Some(claimant) = waiting_on else {
                debug!("no live peer with a lower address; claiming master");
                return None;
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(%claimant, "gave up waiting for lower-addressed peer to claim master");
                return None;
            }
            debug!(%claimant, "waiting for lower-addressed peer to claim master");
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::{ConfigFingerprint, PROTOCOL_VERSION};
    use crate::member::NodeRole;
    use crate::wire::{Frame, read_frame, write_frame};
    use std::collections::BTreeSet;
    use tokio::io::BufReader;
    use tokio::net::TcpListener;

    fn active_state(me: Address) -> Arc<ClusterState> {
        let state = Arc::new(ClusterState::new(me, NodeRole::Full));
        state.set_active(true);
        state
    }

    fn local_info(sender: Address) -> JoinInfo {
        JoinInfo {
            request: true,
            sender,
            role: NodeRole::Full,
            protocol_version: PROTOCOL_VERSION,
            build_id: "test".into(),
            member_count: 1,
            fingerprint: ConfigFingerprint::new("dev", "pw", 271, BTreeSet::new()),
            uuid: "u".into(),
            credentials: None,
        }
    }

    /// Answer every probe with the given reply.
    async fn responder(reply: Frame) -> Address {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = Address::from(listener.local_addr().unwrap());
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                let reply = reply.clone();
                tokio::spawn(async move {
                    let (r, mut w) = stream.split();
                    let mut reader = BufReader::new(r);
                    if let Ok(Some(_)) = read_frame(&mut reader).await {
                        let _ = write_frame(&mut w, &reply).await;
                    }
                });
            }
        });
        addr
    }

    #[test]
    fn peer_spec_parsing() {
        assert_eq!(
            PeerSpec::parse("10.0.0.1:5710", 5701),
            PeerSpec { host: "10.0.0.1".into(), ports: vec![5710] }
        );
        assert_eq!(
            PeerSpec::parse("db-1", 5701),
            PeerSpec { host: "db-1".into(), ports: vec![5701, 5702, 5703] }
        );
        assert_eq!(
            PeerSpec::parse("db-1:6000", 5701),
            PeerSpec { host: "db-1".into(), ports: vec![6000] }
        );
        assert_eq!(PeerSpec::parse("[::1]:5701", 1).host, "::1");
    }

    #[tokio::test]
    async fn returns_master_known_by_peer() {
        let master: Address = "127.0.0.1:5999".parse().unwrap();
        let peer = responder(Frame::ProbeReply { master: Some(master), joined: true }).await;

        let me: Address = "127.0.0.1:1".parse().unwrap();
        let state = active_state(me);
        let d = StaticPeerDiscovery::from_addresses(
            &[peer],
            state,
            Duration::from_secs(1),
            Duration::from_millis(50),
        );

        let found = d.discover_master(&local_info(me), Duration::from_secs(2)).await;
        assert_eq!(found, Some(master));
    }

    #[tokio::test]
    async fn unreachable_peer_is_recorded_and_none_returned() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = Address::from(listener.local_addr().unwrap());
        drop(listener);

        let me: Address = "127.0.0.1:1".parse().unwrap();
        let state = active_state(me);
        let d = StaticPeerDiscovery::from_addresses(
            &[dead],
            Arc::clone(&state),
            Duration::from_millis(300),
            Duration::from_millis(50),
        );

        assert_eq!(d.discover_master(&local_info(me), Duration::from_secs(2)).await, None);
        assert!(state.has_failed(&dead));
    }

    #[tokio::test]
    async fn higher_addressed_idle_peer_does_not_block_claim() {
        let peer = responder(Frame::ProbeReply { master: None, joined: false }).await;

        // 127.0.0.0:0 sorts below any bound loopback address.
        let me: Address = "127.0.0.0:0".parse().unwrap();
        let state = active_state(me);
        let d = StaticPeerDiscovery::from_addresses(
            &[peer],
            state,
            Duration::from_secs(1),
            Duration::from_millis(50),
        );

        let started = Instant::now();
        assert_eq!(d.discover_master(&local_info(me), Duration::from_secs(5)).await, None);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn lower_addressed_idle_peer_is_waited_on_until_budget() {
        let peer = responder(Frame::ProbeReply { master: None, joined: false }).await;

        let me: Address = "127.255.255.255:65535".parse().unwrap();
        let state = active_state(me);
        let d = StaticPeerDiscovery::from_addresses(
            &[peer],
            state,
            Duration::from_secs(1),
            Duration::from_millis(50),
        );

        let started = Instant::now();
        let budget = Duration::from_millis(400);
        assert_eq!(d.discover_master(&local_info(me), budget).await, None);
        assert!(started.elapsed() >= budget);
    }

    #[tokio::test]
    async fn stopped_node_abandons_discovery() {
        let peer = responder(Frame::ProbeReply { master: None, joined: false }).await;

        let me: Address = "127.255.255.255:65535".parse().unwrap();
        let state = active_state(me);
        let d = StaticPeerDiscovery::from_addresses(
            &[peer],
            Arc::clone(&state),
            Duration::from_secs(1),
            Duration::from_millis(50),
        );

        let stopper = Arc::clone(&state);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            stopper.set_active(false);
        });

        let started = Instant::now();
        assert_eq!(d.discover_master(&local_info(me), Duration::from_secs(10)).await, None);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn huge_budget_does_not_overflow() {
        let me: Address = "127.0.0.0:0".parse().unwrap();
        let peer = responder(Frame::ProbeReply { master: None, joined: false }).await;
        let d = StaticPeerDiscovery::from_addresses(
            &[peer],
            active_state(me),
            Duration::from_secs(1),
            Duration::from_millis(50),
        );
        assert_eq!(d.discover_master(&local_info(me), Duration::MAX).await, None);
    }
}
