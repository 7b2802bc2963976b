//! warpgrid-cluster — membership and join protocol for WarpGrid nodes.
//!
//! Finds peers, joins an existing cluster or forms a new one, and keeps
//! the authoritative member list on a dedicated service thread.
//!
//! # Architecture
//!
//! ```text
//! Joining node                                  Master
//!   JoinCoordinator                               JoinServer (TCP, JSON lines)
//!   ├── Discovery ── multicast / tcp-ip / cloud   ├── Probe → ProbeReply
//!   │     └── finds master address                └── Join  → JoinCoordinator
//!   ├── client::request_join ───────────────────────▶ validate, add_member
//!   │                        ◀─────────────────────── JoinAccepted{members}
//!   └── ServiceContext ("warpgrid.{id}.service" thread)
//!         ├── MembershipRegistry (MemberList)
//!         └── MembershipListener callbacks
//! ```
//!
//! All member-list mutations are jobs on the service thread; callers
//! wait for each job with a bounded timeout.

pub mod address;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod join;
pub mod listener;
pub mod member;
pub mod registry;
pub mod security;
pub mod server;
pub mod service;
pub mod state;
pub mod wire;

pub use address::{Address, AddressResolver, ResolvedAddress, ResolverConfig};
pub use config::{
    CloudConfig, DiscoveryConfig, MAX_DURATION, MulticastConfig, StaticPeersConfig, deadline_after,
    parse_duration,
};
pub use coordinator::{JoinCoordinator, JoinPhase, JoinSettings, RejectionPolicy};
pub use discovery::{Discovery, DiscoveryStrategy};
pub use error::{ClusterError, ClusterResult, JoinError, JoinResult};
pub use join::{ConfigFingerprint, Credentials, JoinInfo, PROTOCOL_VERSION, RejectField};
pub use listener::MembershipListener;
pub use member::{Member, NodeRole};
pub use registry::{MemberList, MembershipRegistry};
pub use security::{GroupSecurityContext, SecurityContext};
pub use server::JoinServer;
pub use service::ServiceContext;
pub use state::ClusterState;
pub use wire::Frame;
