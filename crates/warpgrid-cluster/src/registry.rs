//! Member list.
//!
//! The registry is only ever touched from the service thread (see
//! [`crate::service::ServiceContext`]), so implementations take `&mut self`
//! and need no internal locking.

use tracing::{debug, info};

use crate::address::Address;
use crate::member::{Member, NodeRole};

/// Authoritative member list of this node's view of the cluster.
pub trait MembershipRegistry: Send + 'static {
    /// Add or refresh a member. Returns `true` if the address was new.
    fn add_member(&mut self, address: Address, role: NodeRole, uuid: &str) -> bool;

    /// Members in join order.
    fn current_members(&self) -> Vec<Member>;

    /// Drop every member except this node.
    fn reset(&mut self);

    /// Replace the list with the master's view, keeping its order.
    fn sync_members(&mut self, members: &[Member]);
}

/// In-memory member list, ordered by join time.
pub struct MemberList {
    this_address: Address,
    members: Vec<Member>,
}

impl MemberList {
    pub fn new(this_address: Address) -> Self {
        Self {
            this_address,
            members: Vec::new(),
        }
    }
}

impl MembershipRegistry for MemberList {
    fn add_member(&mut self, address: Address, role: NodeRole, uuid: &str) -> bool {
        if let Some(existing) = self.members.iter_mut().find(|m| m.address == address) {
            if existing.uuid != uuid {
                debug!(%address, old = %existing.uuid, new = %uuid, "member rejoined with new uuid");
                existing.uuid = uuid.to_string();
                existing.role = role;
            }
            return false;
        }

        let member = Member::new(address, uuid, role);
        info!(%member, "member added");
        self.members.push(member);
        true
    }

    fn current_members(&self) -> Vec<Member> {
        self.members.clone()
    }

    fn reset(&mut self) {
        let this = self.this_address;
        self.members.retain(|m| m.address == this);
        debug!(remaining = self.members.len(), "member list reset");
    }

    fn sync_members(&mut self, members: &[Member]) {
        self.members.clear();
        for m in members {
            if !self.members.contains(m) {
                self.members.push(m.clone());
            }
        }
        debug!(members = self.members.len(), "member list synced from master");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn add_keeps_join_order() {
        let mut list = MemberList::new(addr("10.0.0.1:5701"));
        assert!(list.add_member(addr("10.0.0.1:5701"), NodeRole::Full, "a"));
        assert!(list.add_member(addr("10.0.0.3:5701"), NodeRole::Full, "c"));
        assert!(list.add_member(addr("10.0.0.2:5701"), NodeRole::Lite, "b"));

        let uuids: Vec<_> = list.current_members().into_iter().map(|m| m.uuid).collect();
        assert_eq!(uuids, vec!["a", "c", "b"]);
    }

    #[test]
    fn duplicate_address_refreshes_uuid() {
        let mut list = MemberList::new(addr("10.0.0.1:5701"));
        list.add_member(addr("10.0.0.2:5701"), NodeRole::Full, "old");
        assert!(!list.add_member(addr("10.0.0.2:5701"), NodeRole::Full, "new"));

        let members = list.current_members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].uuid, "new");
    }

    #[test]
    fn reset_keeps_only_self() {
        let mut list = MemberList::new(addr("10.0.0.1:5701"));
        list.add_member(addr("10.0.0.2:5701"), NodeRole::Full, "b");
        list.add_member(addr("10.0.0.1:5701"), NodeRole::Full, "a");
        list.reset();

        let members = list.current_members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].address, addr("10.0.0.1:5701"));
    }

    #[test]
    fn sync_adopts_master_order() {
        let mut list = MemberList::new(addr("10.0.0.2:5701"));
        list.add_member(addr("10.0.0.2:5701"), NodeRole::Full, "b");

        let master_view = vec![
            Member::new(addr("10.0.0.1:5701"), "a", NodeRole::Full),
            Member::new(addr("10.0.0.2:5701"), "b", NodeRole::Full),
            Member::new(addr("10.0.0.1:5701"), "dup", NodeRole::Full),
        ];
        list.sync_members(&master_view);

        let uuids: Vec<_> = list.current_members().into_iter().map(|m| m.uuid).collect();
        assert_eq!(uuids, vec!["a", "b"]);
    }
}
