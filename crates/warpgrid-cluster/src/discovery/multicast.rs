//! UDP multicast discovery.
//!
//! ```text
//!   joiner                          group 224.2.2.3:54327            master
//!     │── JoinInfo{request: true} ──────────▶│                          │
//!     │                                      │──────────────────────────▶│
//!     │                                      │◀── JoinInfo{request:false}│
//!     │◀─────────────────────────────────────│                          │
//! ```
//!
//! Every node listens on the group. Only the master answers requests,
//! and a searching node re-sends its request each poll interval until a
//! master advert arrives or its budget runs out.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{DiscoveryStrategy, duration_or};
use crate::address::Address;
use crate::config::{MulticastConfig, deadline_after};
use crate::join::JoinInfo;
use crate::state::ClusterState;

/// Overrides the configured multicast group, e.g. `239.1.2.3`.
pub const MULTICAST_GROUP_ENV: &str = "WARPGRID_MULTICAST_GROUP";

const SOCKET_BUFFER: usize = 64 * 1024;
const RECEIVE_POLL: Duration = Duration::from_secs(1);

pub struct MulticastDiscovery {
    socket: UdpSocket,
    target: SocketAddrV4,
    interface: Ipv4Addr,
    group_name: String,
    state: Arc<ClusterState>,
    poll_interval: Duration,
    /// Latest advert published by this node.
    advertisement: RwLock<Option<JoinInfo>>,
    masters: broadcast::Sender<Address>,
}

impl MulticastDiscovery {
    /// Open and join the multicast socket.
    pub fn bind(
        config: &MulticastConfig,
        state: Arc<ClusterState>,
        group_name: &str,
    ) -> io::Result<Self> {
        let group = std::env::var(MULTICAST_GROUP_ENV)
            .ok()
            .and_then(|value| match value.parse::<Ipv4Addr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!(%value, "ignoring invalid {MULTICAST_GROUP_ENV}");
                    None
                }
            })
            .unwrap_or(config.group);
        if !group.is_multicast() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{group} is not a multicast address"),
            ));
        }

        // A node bound to loopback only discovers nodes on the same host.
        let interface = match state.this_address().host() {
            IpAddr::V4(v4) if !v4.is_unspecified() => v4,
            _ => Ipv4Addr::UNSPECIFIED,
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)).into())?;
        socket.set_multicast_ttl_v4(config.ttl)?;
        socket.set_multicast_loop_v4(true)?;
        if !interface.is_unspecified() {
            socket.set_multicast_if_v4(&interface)?;
        }
        socket.join_multicast_v4(&group, &interface)?;
        socket.set_recv_buffer_size(SOCKET_BUFFER)?;
        socket.set_send_buffer_size(SOCKET_BUFFER)?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        let (masters, _) = broadcast::channel(16);

        Ok(Self {
            socket,
            target: SocketAddrV4::new(group, config.port),
            interface,
            group_name: group_name.to_string(),
            state,
            poll_interval: duration_or(&config.poll_interval, Duration::from_secs(1)),
            advertisement: RwLock::new(None),
            masters,
        })
    }

    pub fn target(&self) -> SocketAddrV4 {
        self.target
    }

    /// Receive loop. Runs until `shutdown` flips to `true` or its sender
    /// is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; SOCKET_BUFFER];
        debug!(group = %self.target, "multicast listener started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = tokio::time::timeout(RECEIVE_POLL, self.socket.recv_from(&mut buf)) => {
                    match received {
                        Err(_) => continue,
                        Ok(Err(e)) => debug!(error = %e, "multicast receive failed"),
                        Ok(Ok((n, from))) => {
                            trace!(%from, bytes = n, "multicast packet");
                            self.on_packet(&buf[..n]).await;
                        }
                    }
                }
            }
        }

        debug!("multicast listener stopped");
    }

    async fn on_packet(&self, bytes: &[u8]) {
        let this = self.state.this_address();
        let Some(info) = accept_packet(bytes, this, &self.group_name) else {
            return;
        };

        if info.request {
            if !(self.state.is_master() && self.state.is_joined()) {
                return;
            }
            let advert = self.advertisement.read().clone();
            if let Some(advert) = advert {
                debug!(joiner = %info.sender, "answering multicast join request");
                self.send(&advert).await;
            }
        } else {
            let _ = self.masters.send(info.sender);
        }
    }

    async fn send(&self, info: &JoinInfo) {
        let bytes = match serde_json::to_vec(info) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "could not encode multicast packet");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, self.target).await {
            debug!(error = %e, group = %self.target, "multicast send failed");
        }
    }
}

/// Decode a packet, dropping malformed ones, our own, and those from
/// another group.
pub fn accept_packet(bytes: &[u8], this: Address, group_name: &str) -> Option<JoinInfo> {
    let info: JoinInfo = match serde_json::from_slice(bytes) {
        Ok(info) => info,
        Err(e) => {
            trace!(error = %e, "dropping malformed multicast packet");
            return None;
        }
    };
    if info.sender == this {
        return None;
    }
    if info.fingerprint.group_name != group_name {
        trace!(sender = %info.sender, group = %info.fingerprint.group_name, "foreign group");
        return None;
    }
    Some(info)
}

#[async_trait]
impl DiscoveryStrategy for MulticastDiscovery {
    fn name(&self) -> &str {
        "multicast"
    }

    async fn discover_master(&self, local: &JoinInfo, budget: Duration) -> Option<Address> {
        let mut adverts = self.masters.subscribe();
        let mut request = local.clone();
        request.request = true;
        let deadline = deadline_after(budget);

        loop {
            if !self.state.is_active() {
                debug!("node stopped; abandoning multicast discovery");
                return None;
            }
            self.send(&request).await;

            let wait = self.poll_interval.min(deadline.saturating_duration_since(Instant::now()));
            if wait.is_zero() {
                return None;
            }
            match tokio::time::timeout(wait, adverts.recv()).await {
                Ok(Ok(master)) => {
                    debug!(%master, "master answered multicast request");
                    return Some(master);
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                Err(_) => {}
            }
        }
    }

    async fn announce(&self, local: &JoinInfo) {
        let mut advert = local.clone();
        advert.request = false;
        *self.advertisement.write() = Some(advert.clone());
        if self.state.is_master() {
            self.send(&advert).await;
        }
    }

    async fn stop(&self) {
        let group = *self.target.ip();
        if let Err(e) = socket2::SockRef::from(&self.socket).leave_multicast_v4(&group, &self.interface) {
            trace!(error = %e, "leaving multicast group");
        }
    }
}
