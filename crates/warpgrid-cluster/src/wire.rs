//! Join handshake frames.
//!
//! Frames are JSON objects, one per line, tagged by `type`. The
//! handshake is strictly request/response: the connecting side writes
//! one frame and reads one reply.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::Address;
use crate::error::{ClusterError, ClusterResult};
use crate::join::{JoinInfo, RejectField};
use crate::member::Member;

/// Largest accepted frame, newline included.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Ask a peer who its master is.
    Probe { from: Address },
    ProbeReply { master: Option<Address>, joined: bool },
    /// Ask the master to admit the sender.
    Join { info: JoinInfo },
    JoinAccepted { master: Address, members: Vec<Member> },
    JoinRejected { field: RejectField, reason: String },
    /// The receiver is not the master; `master` is who it believes is.
    NotMaster { master: Option<Address> },
    /// The master could not process the join right now.
    Retry { reason: String },
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> ClusterResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = serde_json::to_vec(frame)?;
    buf.push(b'\n');
    if buf.len() > MAX_FRAME_LEN {
        return Err(ClusterError::FrameTooLarge(MAX_FRAME_LEN));
    }
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the connection.
pub async fn read_frame<R>(reader: &mut R) -> ClusterResult<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_FRAME_LEN as u64)
        .read_until(b'\n', &mut buf)
        .await?;

    if n == 0 {
        return Ok(None);
    }
    // No newline means either the limit was hit or the peer closed
    // mid-frame; the latter still gets a parse attempt.
    if buf.last() != Some(&b'\n') && n >= MAX_FRAME_LEN {
        return Err(ClusterError::FrameTooLarge(MAX_FRAME_LEN));
    }

    let frame = serde_json::from_slice(buf.trim_ascii())?;
    Ok(Some(frame))
}
