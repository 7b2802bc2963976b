//! Join handshake server.
//!
//! Accepts TCP connections on the node's cluster port and answers one
//! frame per connection: `Probe` with what this node knows about the
//! master, `Join` through the [`JoinCoordinator`].

use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::coordinator::JoinCoordinator;
use crate::error::ClusterResult;
use crate::wire::{Frame, read_frame, write_frame};

/// Bound on reading a request frame from a connected peer.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct JoinServer {
    coordinator: Arc<JoinCoordinator>,
}

impl JoinServer {
    pub fn new(coordinator: Arc<JoinCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Accept connections until `shutdown` flips to `true`.
    pub async fn serve(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let local = listener.local_addr().ok();
        info!(addr = ?local, "join handshake listener started");
        let server = Arc::new(self);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            if let Err(e) = server.handle(stream).await {
                                debug!(%peer, error = %e, "handshake connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        info!(addr = ?local, "join handshake listener stopped");
    }

    async fn handle(&self, mut stream: TcpStream) -> ClusterResult<()> {
        stream.set_nodelay(true)?;
        let (read_half, mut write_half) = stream.split();
        let mut reader = BufReader::new(read_half);

        let frame = match tokio::time::timeout(READ_TIMEOUT, read_frame(&mut reader)).await {
            Ok(frame) => frame?,
            Err(_) => {
                debug!("peer sent nothing; closing");
                return Ok(());
            }
        };
        let Some(frame) = frame else {
            return Ok(());
        };

        let reply = self.respond(frame).await;
        write_frame(&mut write_half, &reply).await
    }

    async fn respond(&self, frame: Frame) -> Frame {
        let state = self.coordinator.state();
        match frame {
            Frame::Probe { from } => {
                debug!(%from, "probe received");
                Frame::ProbeReply {
                    master: state.master(),
                    joined: state.is_joined(),
                }
            }
            Frame::Join { info } => {
                if !state.is_active() {
                    return Frame::Retry {
                        reason: "node is not active".into(),
                    };
                }
                debug!(sender = %info.sender, uuid = %info.uuid, "join request received");
                self.coordinator.handle_join_request(info).await
            }
            other => {
                debug!(frame = ?other, "unexpected frame on handshake port");
                Frame::Retry {
                    reason: "unexpected frame".into(),
                }
            }
        }
    }
}
