//! Join handshake listener as a [`ConnectionManager`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use warpgrid_cluster::{JoinCoordinator, JoinServer};

use crate::services::ConnectionManager;

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs a [`JoinServer`] on the node's resolved address.
///
/// The first start reuses the listener bound during address resolution;
/// later starts rebind the same address.
pub struct TcpConnectionManager {
    coordinator: Arc<JoinCoordinator>,
    bind_addr: SocketAddr,
    pending: Mutex<Option<std::net::TcpListener>>,
    running: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl TcpConnectionManager {
    pub fn new(
        coordinator: Arc<JoinCoordinator>,
        listener: std::net::TcpListener,
    ) -> std::io::Result<Self> {
        let bind_addr = listener.local_addr()?;
        Ok(Self {
            coordinator,
            bind_addr,
            pending: Mutex::new(Some(listener)),
            running: Mutex::new(None),
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

#[async_trait]
impl ConnectionManager for TcpConnectionManager {
    async fn start(&self) -> anyhow::Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let pending = self.pending.lock().take();
        let listener = match pending {
            Some(std_listener) => {
                std_listener.set_nonblocking(true)?;
                TcpListener::from_std(std_listener)?
            }
            None => TcpListener::bind(self.bind_addr).await?,
        };
        debug!(addr = %self.bind_addr, "connection manager started");

        let (tx, rx) = watch::channel(false);
        let server = JoinServer::new(Arc::clone(&self.coordinator));
        let handle = tokio::spawn(server.serve(listener, rx));
        *self.running.lock() = Some((tx, handle));
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let running = self.running.lock().take();
        self.pending.lock().take();

        let Some((tx, mut handle)) = running else {
            return Ok(());
        };
        let _ = tx.send(true);
        if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
            warn!(addr = %self.bind_addr, "handshake listener did not stop in time; aborting");
            handle.abort();
        }
        debug!(addr = %self.bind_addr, "connection manager stopped");
        Ok(())
    }
}
