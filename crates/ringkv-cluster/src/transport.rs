//! TCP framing for peer messages.
//!
//! Length-prefixed framing: a 4-byte big-endian u32 length field followed
//! by a bincode-encoded [`Frame`]. Every exchange opens a fresh
//! connection, writes exactly one frame and closes. Connect and write are
//! both bounded by a timeout so a dead peer cannot stall the sender's
//! loop; the protocol itself has no timeouts.

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::message::{Frame, PeerMessage};
use crate::ring::Endpoint;
use crate::ClusterError;

/// Maximum peer frame size (64 MB). Migration and replica frames carry
/// a node's whole dataset, so this is generous; anything larger is
/// treated as corrupt.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Default bound on connect and write for outbound deliveries.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(5);

/// Writes a length-prefixed bincode frame to `w`.
pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let data =
        bincode::serialize(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("peer frame size {} exceeds limit {MAX_FRAME_SIZE}", data.len()),
        ));
    }
    let len = data.len() as u32;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&data).await?;
    w.flush().await?;
    Ok(())
}

/// Reads a length-prefixed bincode frame from `r`, rejecting oversized frames.
pub async fn read_frame<R, T>(r: &mut R) -> io::Result<T>
where
    R: AsyncReadExt + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("peer frame size {len} exceeds limit {MAX_FRAME_SIZE}"),
        ));
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data).await?;
    bincode::deserialize(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Reads one peer message from an accepted connection.
pub async fn read_message<R>(r: &mut R, timeout: Duration) -> Result<PeerMessage, ClusterError>
where
    R: AsyncReadExt + Unpin,
{
    let frame: Frame = tokio::time::timeout(timeout, read_frame(r))
        .await
        .map_err(|_| ClusterError::Timeout)??;
    PeerMessage::from_frame(frame)
}

/// Opens a connection to `to`, writes `msg` and closes.
pub async fn send(to: &Endpoint, msg: &PeerMessage, timeout: Duration) -> Result<(), ClusterError> {
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect((to.host.as_str(), to.port)))
        .await
        .map_err(|_| ClusterError::Timeout)?
        .map_err(|e| ClusterError::Network(format!("connect to {to}: {e}")))?;

    let frame = msg.to_frame();
    tokio::time::timeout(timeout, write_frame(&mut stream, &frame))
        .await
        .map_err(|_| ClusterError::Timeout)?
        .map_err(|e| ClusterError::Network(format!("write to {to}: {e}")))?;

    trace!(%to, kind = msg.kind(), "sent peer message");
    let _ = stream.shutdown().await;
    Ok(())
}
