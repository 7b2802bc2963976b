//! Join handshake payloads.
//!
//! A `JoinInfo` is exchanged on every discovery and join attempt. With
//! `request = true` it asks for entry into a cluster; with
//! `request = false` it advertises an existing cluster's master.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::address::Address;
use crate::error::{JoinError, JoinResult};
use crate::member::NodeRole;

/// Version of the join handshake; peers must match exactly.
pub const PROTOCOL_VERSION: u32 = 4;

/// Credentials attached to a join request when security is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub principal: String,
    pub endpoint: String,
    pub token: String,
}

/// Summary of the configuration that must agree across members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFingerprint {
    pub group_name: String,
    pub password_digest: String,
    pub partition_count: u32,
    #[serde(default)]
    pub features: BTreeSet<String>,
}

impl ConfigFingerprint {
    pub fn new(
        group_name: impl Into<String>,
        password: &str,
        partition_count: u32,
        features: BTreeSet<String>,
    ) -> Self {
        let group_name = group_name.into();
        Self {
            password_digest: digest(&format!("fingerprint:{group_name}:{password}")),
            group_name,
            partition_count,
            features,
        }
    }

    /// Check whether a peer's fingerprint can share a cluster with ours.
    ///
    /// Returns an error when the peer's fingerprint is malformed, so the
    /// caller can tell a broken peer apart from an incompatible one.
    pub fn is_compatible(&self, other: &ConfigFingerprint) -> JoinResult<bool> {
        other.check_well_formed()?;
        Ok(self.mismatch(other).is_none())
    }

    /// Name of the first field that differs, if any.
    pub fn mismatch(&self, other: &ConfigFingerprint) -> Option<&'static str> {
        if self.group_name != other.group_name {
            Some("group name")
        } else if self.password_digest != other.password_digest {
            Some("group password")
        } else if self.partition_count != other.partition_count {
            Some("partition count")
        } else if self.features != other.features {
            Some("features")
        } else {
            None
        }
    }

    fn check_well_formed(&self) -> JoinResult<()> {
        if self.group_name.trim().is_empty() {
            return Err(JoinError::MalformedFingerprint("empty group name".into()));
        }
        if self.partition_count == 0 {
            return Err(JoinError::MalformedFingerprint("zero partition count".into()));
        }
        if self.password_digest.len() != 64
            || !self.password_digest.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(JoinError::MalformedFingerprint("bad password digest".into()));
        }
        Ok(())
    }
}

/// Hex SHA-256 digest used for group passwords and tokens.
pub fn digest(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Compare two digests without exiting early on the first difference.
pub fn digests_match(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

/// Handshake payload exchanged during discovery and join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinInfo {
    pub request: bool,
    pub sender: Address,
    pub role: NodeRole,
    pub protocol_version: u32,
    pub build_id: String,
    pub member_count: u32,
    pub fingerprint: ConfigFingerprint,
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

/// The join request field that caused a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectField {
    ProtocolVersion,
    BuildId,
    Config,
    Credentials,
}

impl fmt::Display for RejectField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RejectField::ProtocolVersion => "protocol_version",
            RejectField::BuildId => "build_id",
            RejectField::Config => "config",
            RejectField::Credentials => "credentials",
        };
        f.write_str(name)
    }
}
