//! Cluster member identity.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::address::Address;

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Holds partitioned data.
    #[default]
    Full,
    /// Participates in membership but owns no partitions.
    Lite,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Full => f.write_str("full"),
            NodeRole::Lite => f.write_str("lite"),
        }
    }
}

/// A node in the member list.
///
/// Two members are the same member when their addresses match; the UUID
/// identifies one join session of that address and changes on restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub address: Address,
    pub uuid: String,
    pub role: NodeRole,
}

impl Member {
    pub fn new(address: Address, uuid: impl Into<String>, role: NodeRole) -> Self {
        Self {
            address,
            uuid: uuid.into(),
            role,
        }
    }

    pub fn is_lite(&self) -> bool {
        self.role == NodeRole::Lite
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Member {}

impl Hash for Member {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Member[{}] {} ({})", self.address, self.uuid, self.role)
    }
}
