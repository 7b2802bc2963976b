//! Node addresses and local address resolution.
//!
//! The `AddressResolver` picks the host this node advertises to its
//! peers and binds the listener the join handshake is served on. The
//! bound listener is handed back to the caller so the port cannot be
//! taken between resolution and startup.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ClusterError, ClusterResult};

/// Network endpoint of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    host: IpAddr,
    port: u16,
}

impl Address {
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self { host, port }
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

impl FromStr for Address {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<SocketAddr>()
            .map(Address::from)
            .map_err(|_| ClusterError::InvalidAddress(s.to_string()))
    }
}

/// Inputs for local address resolution.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// First port to try.
    pub port: u16,
    /// Try following ports when `port` is taken.
    pub port_auto_increment: bool,
    /// How many ports to try when auto-increment is on.
    pub port_count: u16,
    /// Interface patterns (`10.0.1.*`, `10.0.1.4-18`, literal IPs).
    pub interfaces: Vec<String>,
    /// Explicit host to advertise and bind; skips interface matching.
    pub bind_address: Option<IpAddr>,
}

/// The resolved local endpoint plus the listener bound to it.
#[derive(Debug)]
pub struct ResolvedAddress {
    pub address: Address,
    pub listener: TcpListener,
}

/// Picks the node's own bindable address.
pub struct AddressResolver {
    config: ResolverConfig,
}

impl AddressResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Pick the advertised host and bind the first free port.
    pub fn resolve(&self) -> ClusterResult<ResolvedAddress> {
        let host = self.pick_host()?;

        // An explicit address is bound as-is; otherwise listen on every
        // interface of the same family and advertise the picked host.
        let bind_host = match self.config.bind_address {
            Some(ip) => ip,
            None if host.is_ipv4() => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            None => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        };

        let first = self.config.port;
        let count = if self.config.port_auto_increment {
            self.config.port_count.max(1)
        } else {
            1
        };
        let last = first.saturating_add(count - 1);

        for port in first..=last {
            match TcpListener::bind(SocketAddr::new(bind_host, port)) {
                Ok(listener) => {
                    let bound = listener.local_addr()?;
                    let address = Address::new(host, bound.port());
                    info!(%address, bind = %bound, "picked local address");
                    return Ok(ResolvedAddress { address, listener });
                }
                Err(e) => {
                    debug!(port, error = %e, "port unavailable");
                    // Port 0 asks the OS for an ephemeral port; nothing to increment.
                    if port == 0 {
                        return Err(ClusterError::Io(e));
                    }
                }
            }
        }

        Err(ClusterError::PortRangeExhausted { first, last })
    }

    fn pick_host(&self) -> ClusterResult<IpAddr> {
        if let Some(ip) = self.config.bind_address {
            return Ok(ip);
        }

        let outbound = outbound_ip();
        if self.config.interfaces.is_empty() {
            return Ok(outbound.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        }

        if let Some(ip) = outbound {
            if self
                .config
                .interfaces
                .iter()
                .any(|pattern| interface_matches(pattern, ip))
            {
                return Ok(ip);
            }
        }

        // Fall back to the first pattern that names a concrete address.
        if let Some(ip) = self
            .config
            .interfaces
            .iter()
            .find_map(|pattern| pattern.trim().parse::<IpAddr>().ok())
        {
            warn!(%ip, "outbound interface does not match, using configured address");
            return Ok(ip);
        }

        Err(ClusterError::NoMatchingInterface(self.config.interfaces.clone()))
    }
}

/// The address the OS routes outbound traffic from.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
fn outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(10, 254, 254, 254), 1)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() { None } else { Some(ip) }
}

/// Match an IPv4 address against a pattern such as `10.0.1.*` or
/// `10.0.1.4-18`. Non-IPv4 addresses only match literal patterns.
pub fn interface_matches(pattern: &str, ip: IpAddr) -> bool {
    let pattern = pattern.trim();
    if let Ok(literal) = pattern.parse::<IpAddr>() {
        return literal == ip;
    }

    let IpAddr::V4(v4) = ip else {
        return false;
    };

    let parts: Vec<&str> = pattern.split('.').collect();
    if parts.len() != 4 {
        return false;
    }

    parts.iter().zip(v4.octets()).all(|(part, octet)| {
        if *part == "*" {
            return true;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            return match (lo.parse::<u8>(), hi.parse::<u8>()) {
                (Ok(lo), Ok(hi)) => (lo..=hi).contains(&octet),
                _ => false,
            };
        }
        part.parse::<u8>() == Ok(octet)
    })
}
