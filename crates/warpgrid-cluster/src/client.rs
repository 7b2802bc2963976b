//! Join handshake client.
//!
//! Opens a short-lived TCP connection to a peer, sends one frame, and
//! waits for the reply. Used by discovery to probe peers and by the
//! join coordinator to request admission from the master.

use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::debug;

use crate::address::Address;
use crate::error::{ClusterError, ClusterResult};
use crate::join::JoinInfo;
use crate::wire::{Frame, read_frame, write_frame};

/// A peer's answer to a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReply {
    pub master: Option<Address>,
    pub joined: bool,
}

/// Send `frame` to `target` and read a single reply, all within `timeout`.
pub async fn exchange(target: Address, frame: &Frame, timeout: Duration) -> ClusterResult<Frame> {
    let round_trip = async {
        let mut stream = TcpStream::connect(target.socket_addr()).await?;
        stream.set_nodelay(true)?;

        let (read_half, mut write_half) = stream.split();
        write_frame(&mut write_half, frame).await?;

        let mut reader = BufReader::new(read_half);
        read_frame(&mut reader)
            .await?
            .ok_or(ClusterError::ConnectionClosed(target))
    };

    match tokio::time::timeout(timeout, round_trip).await {
        Ok(reply) => reply,
        Err(_) => Err(ClusterError::ConnectTimeout(target)),
    }
}

/// Ask `target` who its master is.
pub async fn probe(target: Address, from: Address, timeout: Duration) -> ClusterResult<ProbeReply> {
    match exchange(target, &Frame::Probe { from }, timeout).await? {
        Frame::ProbeReply { master, joined } => {
            debug!(peer = %target, master = ?master, joined, "probe answered");
            Ok(ProbeReply { master, joined })
        }
        other => {
            debug!(peer = %target, reply = ?other, "unexpected probe reply");
            Err(ClusterError::ConnectionClosed(target))
        }
    }
}

/// Ask `master` to admit this node. Returns the raw reply frame.
pub async fn request_join(
    master: Address,
    info: &JoinInfo,
    timeout: Duration,
) -> ClusterResult<Frame> {
    debug!(%master, uuid = %info.uuid, "sending join request");
    exchange(master, &Frame::Join { info: info.clone() }, timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_reads_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Address::from(listener.local_addr().unwrap());
        let master: Address = "127.0.0.1:5701".parse().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.split();
            let mut reader = BufReader::new(r);
            let frame = read_frame(&mut reader).await.unwrap().unwrap();
            assert!(matches!(frame, Frame::Probe { .. }));
            write_frame(
                &mut w,
                &Frame::ProbeReply {
                    master: Some(master),
                    joined: true,
                },
            )
            .await
            .unwrap();
        });

        let reply = probe(target, "127.0.0.1:5799".parse().unwrap(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.master, Some(master));
        assert!(reply.joined);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Address::from(listener.local_addr().unwrap());

        // Accept and never answer.
        let _holder = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = probe(target, target, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, ClusterError::ConnectTimeout(_)));
    }

    #[tokio::test]
    async fn closed_port_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Address::from(listener.local_addr().unwrap());
        drop(listener);

        assert!(probe(target, target, Duration::from_secs(1)).await.is_err());
    }
}
