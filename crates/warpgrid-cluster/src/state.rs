//! Shared node state: lifecycle flags, master address, failed peers.
//!
//! Flags are plain atomics read from any thread. The master address is
//! written only by the join coordinator and the lifecycle controller.

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashSet;
use parking_lot::RwLock;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::address::Address;
use crate::member::{Member, NodeRole};

/// State shared between the lifecycle controller, the join coordinator,
/// discovery, and the handshake server.
#[derive(Debug)]
pub struct ClusterState {
    this_address: Address,
    role: NodeRole,
    uuid: RwLock<String>,
    master: RwLock<Option<Address>>,
    active: AtomicBool,
    joined: AtomicBool,
    out_of_memory: AtomicBool,
    completely_shutdown: AtomicBool,
    failed_connections: DashSet<Address>,
}

impl ClusterState {
    pub fn new(this_address: Address, role: NodeRole) -> Self {
        Self {
            this_address,
            role,
            uuid: RwLock::new(Uuid::new_v4().to_string()),
            master: RwLock::new(None),
            active: AtomicBool::new(false),
            joined: AtomicBool::new(false),
            out_of_memory: AtomicBool::new(false),
            completely_shutdown: AtomicBool::new(false),
            failed_connections: DashSet::new(),
        }
    }

    pub fn this_address(&self) -> Address {
        self.this_address
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn uuid(&self) -> String {
        self.uuid.read().clone()
    }

    /// Assign a fresh member UUID; called on every start.
    pub fn regenerate_uuid(&self) -> String {
        let uuid = Uuid::new_v4().to_string();
        trace!(%uuid, "generated new uuid for local member");
        *self.uuid.write() = uuid.clone();
        uuid
    }

    pub fn local_member(&self) -> Member {
        Member::new(self.this_address, self.uuid(), self.role)
    }

    // ── master ─────────────────────────────────────────────────

    pub fn master(&self) -> Option<Address> {
        *self.master.read()
    }

    pub fn set_master(&self, master: Option<Address>) {
        if let Some(addr) = master {
            debug!(master = %addr, "setting master address");
        }
        *self.master.write() = master;
    }

    pub fn is_master(&self) -> bool {
        self.master() == Some(self.this_address)
    }

    // ── flags ──────────────────────────────────────────────────

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Set the active flag. Refused once the node is completely shut
    /// down; clearing it also clears `joined`.
    pub fn set_active(&self, active: bool) -> bool {
        if active && self.is_completely_shutdown() {
            warn!("refusing to reactivate a completely shut down node");
            return false;
        }
        if !active {
            self.joined.store(false, Ordering::SeqCst);
        }
        self.active.store(active, Ordering::SeqCst);
        true
    }

    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    /// Set the joined flag. A node that is not active cannot be joined.
    pub fn set_joined(&self, joined: bool) -> bool {
        if joined && !self.is_active() {
            warn!("refusing to mark an inactive node as joined");
            return false;
        }
        self.joined.store(joined, Ordering::SeqCst);
        true
    }

    pub fn is_out_of_memory(&self) -> bool {
        self.out_of_memory.load(Ordering::SeqCst)
    }

    pub fn set_out_of_memory(&self) {
        self.out_of_memory.store(true, Ordering::SeqCst);
    }

    pub fn is_completely_shutdown(&self) -> bool {
        self.completely_shutdown.load(Ordering::SeqCst)
    }

    /// Mark the node terminal. Returns `true` if this call set the flag.
    pub fn mark_completely_shutdown(&self) -> bool {
        !self.completely_shutdown.swap(true, Ordering::SeqCst)
    }

    // ── failed connections ─────────────────────────────────────

    pub fn failed_connection(&self, address: Address) {
        trace!(this = %self.this_address, peer = %address, "failed connecting");
        self.failed_connections.insert(address);
    }

    pub fn has_failed(&self, address: &Address) -> bool {
        self.failed_connections.contains(address)
    }

    pub fn failed_connections(&self) -> Vec<Address> {
        let mut out: Vec<Address> = self.failed_connections.iter().map(|a| *a).collect();
        out.sort();
        out
    }

    pub fn clear_failed_connections(&self) {
        self.failed_connections.clear();
    }
}
