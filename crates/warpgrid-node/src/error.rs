//! Error types for the node lifecycle.

use std::time::Duration;

use thiserror::Error;
use warpgrid_cluster::{ClusterError, JoinError};

/// Result type alias for node operations.
pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node is not active")]
    NotActive,

    #[error("node is restarting")]
    Restarting,

    #[error("join did not complete within {0:?}")]
    JoinTimeout(Duration),

    #[error("service thread did not complete '{op}' within {timeout:?}")]
    ServiceThreadUnresponsive { op: &'static str, timeout: Duration },

    #[error("node degraded after running out of memory: {0}")]
    OutOfMemoryDegradation(String),

    #[error("{subsystem} failed to start: {reason}")]
    Startup { subsystem: &'static str, reason: String },

    #[error("{subsystem} failed to shut down: {reason}")]
    ShutdownSubsystemFailure { subsystem: &'static str, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Join(JoinError),

    #[error(transparent)]
    Cluster(ClusterError),
}

impl From<ClusterError> for NodeError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::ServiceThreadUnresponsive { op, timeout } => {
                NodeError::ServiceThreadUnresponsive { op, timeout }
            }
            other => NodeError::Cluster(other),
        }
    }
}

impl From<JoinError> for NodeError {
    fn from(err: JoinError) -> Self {
        match err {
            JoinError::JoinTimeout(timeout) => NodeError::JoinTimeout(timeout),
            JoinError::Cluster(inner) => inner.into(),
            other => NodeError::Join(other),
        }
    }
}
