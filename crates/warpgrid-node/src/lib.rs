//! warpgrid-node — lifecycle of a WarpGrid cluster node.
//!
//! Wires the membership core from `warpgrid-cluster` to the subsystems a
//! node runs (partition storage, client and text protocol front-ends,
//! executors) and drives them through startup, restart, and shutdown.
//!
//! # Architecture
//!
//! ```text
//! Node (Clone handle)
//!   ├── ClusterState ─ active / joined / out_of_memory / completely_shutdown
//!   ├── ServiceContext ─ "warpgrid.{id}.service" thread, member list
//!   ├── JoinCoordinator ─ discovery + join handshake
//!   ├── ConnectionManager ─ TcpConnectionManager (JoinServer)
//!   ├── process hook ─ SIGINT / SIGTERM → forced shutdown
//!   └── ShutdownCoordinator ─ drain backups, ordered stop, signal tasks
//! ```

pub mod config;
pub mod connection;
pub mod error;
mod hook;
pub mod node;
pub mod services;
pub mod shutdown;

pub use config::{NodeConfig, NodeProperties, Timings};
pub use connection::TcpConnectionManager;
pub use error::{NodeError, NodeResult};
pub use hook::termination_signal;
pub use node::{Collaborators, Node};
pub use services::{
    ConnectionManager, DefaultInitializer, ManagedService, NodeInitializer, NoopPartitionService,
    NoopService, PartitionService,
};
pub use shutdown::ShutdownCoordinator;
