//! Node teardown.
//!
//! ```text
//!   drain backups (graceful only)
//!   joined=false, active=false, remove process hook
//!   client → partition → membership service thread → discovery
//!   → connections → executors → text protocol
//!   master=None, destroy security context, destroy initializer
//!   signal remaining background tasks, clear failed connections
//! ```
//!
//! Every step runs even if an earlier one failed or panicked.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::node::Node;

/// How long a background task gets to exit after the shutdown signal.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(1);

pub struct ShutdownCoordinator {
    node: Node,
}

impl ShutdownCoordinator {
    pub fn new(node: Node) -> Self {
        Self { node }
    }

    /// Tear the node down. With `synchronous == false` the teardown runs
    /// on a background task and this returns immediately.
    pub async fn shutdown(&self, force: bool, synchronous: bool) {
        if synchronous {
            self.node.note_shutdown_request();
            self.run(force).await;
        } else {
            drop(self.shutdown_in_background(force));
        }
    }

    pub fn shutdown_in_background(&self, force: bool) -> JoinHandle<()> {
        self.node.note_shutdown_request();
        let node = self.node.clone();
        tokio::spawn(async move { ShutdownCoordinator::new(node).run(force).await })
    }

    async fn run(&self, force: bool) {
        let inner = &self.node.inner;
        let _serialized = inner.shutdown_lock.lock().await;

        let state = &inner.state;
        if !state.is_active() {
            debug!(node_id = inner.id, "node is not active; nothing to shut down");
            return;
        }

        let started = Instant::now();
        info!(node_id = inner.id, force, "shutting down node");

        if !force {
            self.drain_backups().await;
        }

        state.set_joined(false);
        state.set_active(false);
        if let Some(hook) = inner.tasks.lock().hook.take() {
            hook.abort();
        }

        self.step("client service", inner.client_service.stop()).await;
        self.step("partition service", inner.partition_service.shutdown()).await;
        self.step("cluster service", async {
            inner.service.stop();
            anyhow::Ok(())
        })
        .await;
        self.step("discovery", async {
            if let Some(discovery) = inner.coordinator.take_discovery() {
                discovery.stop().await;
            }
            anyhow::Ok(())
        })
        .await;
        self.step("connection manager", inner.connection_manager.shutdown()).await;
        self.step("executor service", inner.executor_service.stop()).await;
        self.step("text protocol service", inner.text_protocol_service.stop()).await;

        state.set_master(None);

        self.step("security context", async {
            match &inner.security {
                Some(security) => security.destroy(),
                None => anyhow::Ok(()),
            }
        })
        .await;
        self.step("initializer", inner.initializer.destroy()).await;

        self.stop_background_tasks().await;
        state.clear_failed_connections();

        info!(
            node_id = inner.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "node shut down"
        );
        if state.is_completely_shutdown() {
            self.node.notify_terminated();
        }
    }

    /// Release what a failed start left behind. Used when the node never
    /// became active, so the regular sequence would do nothing.
    pub(crate) async fn release(&self) {
        let inner = &self.node.inner;
        let _serialized = inner.shutdown_lock.lock().await;

        inner.state.set_joined(false);
        if let Some(hook) = inner.tasks.lock().hook.take() {
            hook.abort();
        }
        inner.service.stop();
        if let Some(discovery) = inner.coordinator.take_discovery() {
            discovery.stop().await;
        }
        self.step("connection manager", inner.connection_manager.shutdown()).await;
        inner.state.set_master(None);
        self.stop_background_tasks().await;
        inner.state.clear_failed_connections();
    }

    async fn drain_backups(&self) {
        let inner = &self.node.inner;
        let poll = inner.timings.backup_drain_poll_interval;
        let cap = inner.timings.backup_drain_timeout;
        let started = Instant::now();

        while inner.state.is_active() && inner.partition_service.has_active_backup_task() {
            if let Some(cap) = cap {
                if started.elapsed() >= cap {
                    warn!(
                        node_id = inner.id,
                        waited = ?started.elapsed(),
                        "backup tasks still active; proceeding with shutdown"
                    );
                    return;
                }
            }
            info!(node_id = inner.id, "waiting for backup tasks to complete");
            tokio::time::sleep(poll).await;
        }
    }

    async fn step<F>(&self, subsystem: &'static str, stop: F)
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        match AssertUnwindSafe(stop).catch_unwind().await {
            Ok(Ok(())) => debug!(subsystem, "stopped"),
            Ok(Err(e)) => {
                let err = NodeError::ShutdownSubsystemFailure {
                    subsystem,
                    reason: format!("{e:#}"),
                };
                warn!(node_id = self.node.id(), error = %err, "continuing shutdown");
            }
            Err(_) => {
                warn!(node_id = self.node.id(), subsystem, "panicked during shutdown; continuing");
            }
        }
    }

    async fn stop_background_tasks(&self) {
        let (signal, handles) = {
            let mut tasks = self.node.inner.tasks.lock();
            (tasks.signal.take(), std::mem::take(&mut tasks.handles))
        };
        if let Some(signal) = signal {
            let _ = signal.send(true);
        }
        for (name, mut handle) in handles {
            if tokio::time::timeout(TASK_STOP_TIMEOUT, &mut handle).await.is_err() {
                debug!(task = %name, "task ignored shutdown signal; aborting");
                handle.abort();
            }
        }
    }
}
