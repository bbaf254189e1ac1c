//! Test helpers for spawning a coordinator and storage nodes and
//! talking to them over the client protocol.

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use ringkv_cluster::{parse_client_snapshot, ClientRange};
use ringkv_protocol::Reply;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// How long a helper waits for the ring to converge before failing.
const CONVERGE_TIMEOUT: Duration = Duration::from_secs(15);

/// A ringkv-coordinator subprocess managed by the test harness.
pub struct TestCoordinator {
    child: Child,
    pub port: u16,
}

/// Options for starting a test coordinator.
pub struct CoordinatorOptions {
    pub gossip_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            gossip_interval_ms: 60_000,
            heartbeat_interval_ms: 500,
        }
    }
}

impl TestCoordinator {
    pub fn start() -> Self {
        Self::start_with(CoordinatorOptions::default())
    }

    /// Starts a coordinator on a random port and blocks until it accepts
    /// connections.
    pub fn start_with(opts: CoordinatorOptions) -> Self {
        let port = find_free_port();
        let binary = binary("ringkv-coordinator");

        let child = Command::new(&binary)
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .arg("--gossip-interval-ms")
            .arg(opts.gossip_interval_ms.to_string())
            .arg("--heartbeat-interval-ms")
            .arg(opts.heartbeat_interval_ms.to_string())
            .arg("--peer-timeout-ms")
            .arg("1000")
            .env("RUST_LOG", "error")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap_or_else(|e| panic!("failed to spawn {}: {e}", binary.display()));

        wait_for_port(port, "ringkv-coordinator");
        Self { child, port }
    }
}

impl Drop for TestCoordinator {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A ringkv-server subprocess joined to a test coordinator.
pub struct TestNode {
    child: Child,
    pub port: u16,
    pub peer_port: u16,
}

impl TestNode {
    /// Starts a node on random client and peer ports and blocks until
    /// its client port accepts connections. The join itself completes
    /// asynchronously; use [`wait_for_members`] to wait for it.
    pub fn start(coordinator: &TestCoordinator) -> Self {
        let port = find_free_port();
        let peer_port = find_free_port();
        let binary = binary("ringkv-server");

        let child = Command::new(&binary)
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .arg("--peer-port")
            .arg(peer_port.to_string())
            .arg("--coordinator")
            .arg(format!("127.0.0.1:{}", coordinator.port))
            .arg("--peer-timeout-ms")
            .arg("1000")
            .env("RUST_LOG", "error")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap_or_else(|e| panic!("failed to spawn {}: {e}", binary.display()));

        wait_for_port(port, "ringkv-server");
        Self {
            child,
            port,
            peer_port,
        }
    }

    /// `ip:client_port` as it appears in keyrange replies.
    pub fn name(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub async fn connect(&self) -> TestClient {
        TestClient::connect(self.port).await
    }

    /// Kills the process without giving it a chance to leave the ring.
    pub fn crash(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    /// Sends SIGINT and waits for the node to leave the ring and exit.
    /// All client connections to it must be closed first.
    #[cfg(unix)]
    pub fn interrupt(mut self) {
        let status = Command::new("kill")
            .arg("-INT")
            .arg(self.child.id().to_string())
            .status()
            .expect("failed to run kill");
        assert!(status.success(), "kill -INT failed");

        let deadline = Instant::now() + CONVERGE_TIMEOUT;
        loop {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            assert!(Instant::now() < deadline, "node did not exit after SIGINT");
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A minimal line client for integration testing.
pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(format!("127.0.0.1:{port}"))
            .await
            .unwrap_or_else(|e| panic!("failed to connect to 127.0.0.1:{port}: {e}"));
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Sends one request line and returns the raw reply line.
    pub async fn cmd(&mut self, line: &str) -> String {
        self.stream
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();

        loop {
            if let Some(end) = self.buf.iter().position(|&b| b == b'\n') {
                let reply = String::from_utf8_lossy(&self.buf[..end])
                    .trim_end_matches('\r')
                    .to_string();
                self.buf.advance(end + 1);
                return reply;
            }
            let n = self.stream.read_buf(&mut self.buf).await.unwrap();
            if n == 0 {
                panic!("server closed connection while waiting for reply to '{line}'");
            }
        }
    }

    /// Sends a request and parses the reply.
    pub async fn reply(&mut self, line: &str) -> Reply {
        let raw = self.cmd(line).await;
        Reply::parse(&raw).unwrap_or_else(|e| panic!("bad reply '{raw}': {e}"))
    }

    /// Returns this node's current view of the ring, or `None` when the
    /// node answers with anything but `keyrange_success`.
    pub async fn keyrange(&mut self) -> Option<Vec<ClientRange>> {
        match self.reply("keyrange").await {
            Reply::KeyrangeSuccess(text) => Some(parse_client_snapshot(&text).unwrap()),
            _ => None,
        }
    }
}

/// Sends `line` to the node on `port` every 50ms until `accept` matches
/// the reply, and returns that reply.
pub async fn wait_for_reply(
    port: u16,
    line: &str,
    what: &str,
    accept: impl Fn(&Reply) -> bool,
) -> Reply {
    let deadline = Instant::now() + CONVERGE_TIMEOUT;
    let mut client = TestClient::connect(port).await;
    loop {
        let reply = client.reply(line).await;
        if accept(&reply) {
            return reply;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {what}, last reply: {reply}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Waits until every node in `nodes` sees exactly `nodes.len()` members
/// and returns the agreed ring.
pub async fn wait_for_members(nodes: &[&TestNode]) -> Vec<ClientRange> {
    let expected = nodes.len();
    let mut ring = Vec::new();
    for node in nodes {
        let reply = wait_for_reply(
            node.port,
            "keyrange",
            &format!("{} to see {expected} members", node.name()),
            |reply| match reply {
                Reply::KeyrangeSuccess(text) => {
                    parse_client_snapshot(text).is_ok_and(|r| r.len() == expected)
                }
                _ => false,
            },
        )
        .await;
        if let Reply::KeyrangeSuccess(text) = reply {
            ring = parse_client_snapshot(&text).unwrap();
        }
    }
    ring
}

/// Returns the node among `nodes` whose range covers `key`.
pub fn owner_of<'a>(ranges: &[ClientRange], nodes: &[&'a TestNode], key: &str) -> &'a TestNode {
    let range = ranges
        .iter()
        .find(|r| r.covers_key(key))
        .unwrap_or_else(|| panic!("no range covers '{key}'"));
    nodes
        .iter()
        .copied()
        .find(|n| n.port == range.endpoint.port)
        .unwrap_or_else(|| panic!("owner {} is not a test node", range.endpoint))
}

/// Runs the ringkv-cli binary in one-shot mode against `port`.
pub fn run_cli(port: u16, args: &[&str]) -> Output {
    let binary = binary("ringkv-cli");
    Command::new(&binary)
        .arg("-p")
        .arg(port.to_string())
        .arg("--retries")
        .arg("8")
        .args(args)
        .env("NO_COLOR", "1")
        .output()
        .unwrap_or_else(|e| panic!("failed to run {}: {e}", binary.display()))
}

fn wait_for_port(port: u16, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if Instant::now() > deadline {
            panic!("{what} failed to start within 5 seconds on port {port}");
        }
        if std::net::TcpStream::connect(format!("127.0.0.1:{port}")).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Finds a free TCP port by binding to port 0.
fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Locates a workspace binary next to the test binary.
fn binary(name: &str) -> PathBuf {
    // test binary is in target/<profile>/deps/
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push(name);
    if !path.exists() {
        panic!(
            "{name} binary not found. run `cargo build` first.\nlooked at: {}",
            path.display()
        );
    }
    path
}
