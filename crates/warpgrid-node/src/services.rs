//! Subsystems the node drives but does not implement.
//!
//! Storage, client-facing protocols, and executors live elsewhere; the
//! node only needs to start, stop, and query them. Each trait comes
//! with a no-op default so a node can run with just its membership core.

use async_trait::async_trait;

/// Partition and replica storage.
#[async_trait]
pub trait PartitionService: Send + Sync {
    /// Whether a backup or migration task is still in flight.
    fn has_active_backup_task(&self) -> bool;

    async fn shutdown(&self) -> anyhow::Result<()>;

    /// Drop partition state before a restart.
    fn reset(&self) {}
}

/// A named subsystem stopped during shutdown: client engine, executor
/// pools, text protocol front-end.
#[async_trait]
pub trait ManagedService: Send + Sync {
    fn name(&self) -> &str;

    async fn stop(&self) -> anyhow::Result<()>;
}

/// Owner of the node's cluster-facing transport.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;

    async fn shutdown(&self) -> anyhow::Result<()>;
}

/// Hooks around node startup and teardown.
#[async_trait]
pub trait NodeInitializer: Send + Sync {
    /// Build identifier compared during the join handshake.
    fn build_id(&self) -> String;

    async fn before_initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Partition service with no state and nothing to drain.
pub struct NoopPartitionService;

#[async_trait]
impl PartitionService for NoopPartitionService {
    fn has_active_backup_task(&self) -> bool {
        false
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Service placeholder for a subsystem that is not deployed.
pub struct NoopService(pub &'static str);

#[async_trait]
impl ManagedService for NoopService {
    fn name(&self) -> &str {
        self.0
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Initializer that reports the crate version as the build id.
pub struct DefaultInitializer;

#[async_trait]
impl NodeInitializer for DefaultInitializer {
    fn build_id(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }
}
