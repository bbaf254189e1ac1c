//! Async TCP connection to a single ringkv node.
//!
//! Requests and replies are single text lines. The connection writes a
//! command, then reads back exactly one reply line.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use ringkv_protocol::{Command, Reply, MAX_VALUE_LEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Longest reply line accepted before the connection is considered broken.
const MAX_REPLY_LEN: usize = MAX_VALUE_LEN + 1024;

/// Errors that can occur during connection operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server disconnected")]
    Disconnected,

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// A TCP connection to a ringkv node with read/write buffering.
pub struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl Connection {
    /// Connects to a node's client port.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, ConnectionError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout))??;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(256),
        })
    }

    /// Sends a command and reads the reply.
    pub async fn send(&mut self, cmd: &Command) -> Result<Reply, ConnectionError> {
        self.write_buf.clear();
        self.write_buf.extend_from_slice(cmd.to_string().as_bytes());
        self.write_buf.extend_from_slice(b"\r\n");
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<Reply, ConnectionError> {
        loop {
            if let Some(line) = take_line(&mut self.read_buf) {
                return Reply::parse(&line).map_err(|e| ConnectionError::Protocol(e.to_string()));
            }
            if self.read_buf.len() > MAX_REPLY_LEN {
                return Err(ConnectionError::Protocol("reply line too long".into()));
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Disconnected);
            }
        }
    }

    /// Sends `quit` and closes the stream. Errors are ignored since the
    /// connection is going away anyway.
    pub async fn shutdown(mut self) {
        let _ = self.stream.write_all(b"quit\r\n").await;
        let _ = self.stream.shutdown().await;
    }
}

/// Splits one `\n`-terminated line off the front of `buf`.
fn take_line(buf: &mut BytesMut) -> Option<String> {
    let end = buf.iter().position(|&b| b == b'\n')?;
    let line = String::from_utf8_lossy(&buf[..end])
        .trim_end_matches('\r')
        .to_string();
    buf.advance(end + 1);
    Some(line)
}
