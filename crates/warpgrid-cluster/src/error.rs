//! Error types for discovery, join, and membership operations.

use std::time::Duration;

use thiserror::Error;

use crate::address::Address;
use crate::join::RejectField;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Result type alias for join operations.
pub type JoinResult<T> = Result<T, JoinError>;

/// Errors raised by the cluster plumbing (addresses, wire, service thread).
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("no local interface matches the configured patterns: {0:?}")]
    NoMatchingInterface(Vec<String>),

    #[error("no free port in {first}..{last}")]
    PortRangeExhausted { first: u16, last: u16 },

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("service thread did not complete '{op}' within {timeout:?}")]
    ServiceThreadUnresponsive { op: &'static str, timeout: Duration },

    #[error("service thread is not running")]
    ServiceStopped,

    #[error("frame exceeds {0} bytes")]
    FrameTooLarge(usize),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("connection to {0} timed out")]
    ConnectTimeout(Address),

    #[error("connection closed by {0}")]
    ConnectionClosed(Address),

    #[error("cloud lookup failed: {0}")]
    CloudLookup(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while joining a cluster.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("no discovery strategy is available")]
    DiscoveryUnavailable,

    #[error("join rejected on {field}: {reason}")]
    JoinRejected { field: RejectField, reason: String },

    #[error("join did not complete within {0:?}")]
    JoinTimeout(Duration),

    #[error("malformed configuration fingerprint: {0}")]
    MalformedFingerprint(String),

    #[error("master {0} is unavailable")]
    MasterUnavailable(Address),

    #[error("gave up after {0} master redirects")]
    TooManyRedirects(usize),

    #[error("unexpected reply from {0}")]
    UnexpectedReply(Address),

    #[error("node stopped while joining")]
    Interrupted,

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl JoinError {
    /// Whether this error came from the bounded service-thread wait.
    pub fn is_service_unresponsive(&self) -> bool {
        matches!(
            self,
            JoinError::Cluster(ClusterError::ServiceThreadUnresponsive { .. })
        )
    }
}
