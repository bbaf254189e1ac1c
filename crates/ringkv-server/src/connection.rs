//! Per-connection handler for client requests.
//!
//! Reads newline-terminated requests, runs them against the local node
//! and writes one reply line per request. Successful writes hand the
//! node's replica refresh pushes to the agent runtime, which delivers
//! them in order with its other peer traffic.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use ringkv_cluster::{ClusterError, DeleteOutcome, LocalNode, NodeState, Outbound, PutOutcome};
use ringkv_protocol::{Command, ProtocolError, Reply, KEY_NOT_FOUND, MAX_VALUE_LEN, NOT_OWNER};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

/// Longest request line accepted before the connection is closed.
const MAX_LINE_LEN: usize = MAX_VALUE_LEN + 1024;

/// Drives one client connection until it closes, idles out or sends `quit`.
pub async fn handle<S>(
    mut stream: S,
    node: Arc<LocalNode>,
    pushes: mpsc::Sender<Vec<Outbound>>,
    idle_timeout: Duration,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        while let Some(line) = next_line(&mut buf) {
            let reply = match Command::parse(&line) {
                Ok(Command::Quit) => return Ok(()),
                Ok(cmd) => {
                    let write = cmd.is_write();
                    let reply = execute(&node, cmd);
                    if write && is_write_success(&reply) {
                        let batch = node.consistency_pushes();
                        if !batch.is_empty() && pushes.send(batch).await.is_err() {
                            debug!("agent runtime gone, skipping replica refresh");
                        }
                    }
                    reply
                }
                Err(ProtocolError::Empty) => continue,
                Err(e) => Reply::from(&e),
            };
            stream.write_all(format!("{reply}\r\n").as_bytes()).await?;
        }

        if buf.len() > MAX_LINE_LEN {
            let reply = Reply::Error("request line too long".into());
            let _ = stream.write_all(format!("{reply}\r\n").as_bytes()).await;
            return Ok(());
        }

        match tokio::time::timeout(idle_timeout, stream.read_buf(&mut buf)).await {
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Ok(()), // idle timeout, close silently
        }
    }
}

/// Splits one complete line off the front of `buf`, without its terminator.
fn next_line(buf: &mut BytesMut) -> Option<String> {
    let end = buf.iter().position(|&b| b == b'\n')?;
    let line = String::from_utf8_lossy(&buf[..end])
        .trim_end_matches('\r')
        .to_string();
    buf.advance(end + 1);
    Some(line)
}

fn is_write_success(reply: &Reply) -> bool {
    matches!(
        reply,
        Reply::PutSuccess(_) | Reply::PutUpdate(_) | Reply::DeleteSuccess(_)
    )
}

/// Runs one parsed request against the node.
pub fn execute(node: &LocalNode, cmd: Command) -> Reply {
    match cmd {
        Command::Put { user, key, value } => match node.put(&key, &value, &user) {
            Ok(PutOutcome::Inserted) => Reply::PutSuccess(key),
            Ok(PutOutcome::Updated) => Reply::PutUpdate(key),
            Err(e) => error_reply(e, |msg| Reply::PutError { key, msg }),
        },
        Command::Get { key } => match node.get(&key) {
            Ok(Some(value)) => Reply::GetSuccess { key, value },
            Ok(None) => Reply::GetError {
                key,
                msg: KEY_NOT_FOUND.into(),
            },
            Err(e) => error_reply(e, |msg| Reply::GetError { key, msg }),
        },
        Command::Delete { user, key } => match node.delete(&key, &user) {
            Ok(DeleteOutcome::Deleted) => Reply::DeleteSuccess(key),
            Ok(DeleteOutcome::NotFound) => Reply::DeleteError {
                key,
                msg: KEY_NOT_FOUND.into(),
            },
            Err(e) => error_reply(e, |msg| Reply::DeleteError { key, msg }),
        },
        Command::Keyrange => match node.keyrange() {
            Ok(snapshot) => Reply::KeyrangeSuccess(snapshot),
            Err(e) => error_reply(e, Reply::Error),
        },
        Command::KeyrangeRead => match node.keyrange_read() {
            Ok(snapshot) => Reply::KeyrangeReadSuccess(snapshot),
            Err(e) => error_reply(e, Reply::Error),
        },
        Command::Quit => Reply::Error("quit is handled by the connection".into()),
    }
}

/// Maps a gating error to its reply. `not_owner` builds the
/// command-specific error line.
fn error_reply(e: ClusterError, not_owner: impl FnOnce(String) -> Reply) -> Reply {
    match e {
        ClusterError::NotResponsible => Reply::NotResponsible,
        ClusterError::Unavailable(NodeState::WriteLock) => Reply::WriteLock,
        ClusterError::Unavailable(NodeState::Stopped) => Reply::Stopped,
        ClusterError::NotOwner(_) => not_owner(NOT_OWNER.into()),
        other => Reply::Error(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringkv_cluster::{HashRing, MemoryCache, MemoryOwners, MemoryStorage, NodeAddr};
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn node() -> Arc<LocalNode> {
        let addr = NodeAddr::new("127.0.0.1", 5001, 6001);
        let node = LocalNode::new(
            addr.clone(),
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryCache::new(8)),
            Arc::new(MemoryOwners::new()),
        );
        let mut ring = HashRing::new();
        ring.insert(addr).unwrap();
        node.set_ring(ring);
        Arc::new(node)
    }

    fn run(node: &LocalNode, line: &str) -> String {
        execute(node, Command::parse(line).unwrap()).to_string()
    }

    #[test]
    fn put_get_delete() {
        let n = node();
        assert_eq!(run(&n, "put alice k hello world"), "put_success k");
        assert_eq!(run(&n, "put alice k v2"), "put_update k");
        assert_eq!(run(&n, "get k"), "get_success k v2");
        assert_eq!(run(&n, "delete alice k"), "delete_success k");
        assert_eq!(run(&n, "get k"), "get_error k key is not found!");
        assert_eq!(run(&n, "delete alice k"), "delete_error k key is not found!");
    }

    #[test]
    fn owner_is_enforced() {
        let n = node();
        run(&n, "put alice k v");
        assert_eq!(run(&n, "put bob k v"), format!("put_error k {NOT_OWNER}"));
        assert_eq!(run(&n, "delete bob k"), format!("delete_error k {NOT_OWNER}"));
    }

    #[test]
    fn state_gating() {
        let n = node();
        n.set_state(NodeState::WriteLock);
        assert_eq!(run(&n, "put alice k v"), "server_write_lock");
        assert_eq!(run(&n, "get k"), "get_error k key is not found!");
        n.set_state(NodeState::Stopped);
        assert_eq!(run(&n, "get k"), "server_stopped");
        assert_eq!(run(&n, "keyrange"), "server_stopped");
    }

    #[test]
    fn not_a_member_is_not_responsible() {
        let n = node();
        n.set_ring(HashRing::new());
        assert_eq!(run(&n, "get k"), "server_not_responsible");
    }

    #[test]
    fn keyrange_lists_self() {
        let n = node();
        let reply = run(&n, "keyrange");
        assert!(reply.starts_with("keyrange_success "));
        assert!(reply.ends_with(",127.0.0.1:5001;"));
    }

    #[tokio::test]
    async fn serves_lines_over_a_stream() {
        let (client, server) = tokio::io::duplex(4096);
        let (tx, _rx) = mpsc::channel(4);
        let task = tokio::spawn(handle(server, node(), tx, Duration::from_secs(5)));

        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"put alice k v\r\n\r\nget k\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "put_success k");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "get_success k v");

        write.write_all(b"frobnicate\n").await.unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "error unknown command!"
        );

        write.write_all(b"quit\n").await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn too_long_put_is_rejected() {
        let (client, server) = tokio::io::duplex(1 << 20);
        let (tx, _rx) = mpsc::channel(4);
        tokio::spawn(handle(server, node(), tx, Duration::from_secs(5)));

        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();
        let key = "k".repeat(21);
        write
            .write_all(format!("put alice {key} v\n").as_bytes())
            .await
            .unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            format!("put_error {key} key or value are too long!")
        );
    }
}
