//! Ring-aware client.
//!
//! Keeps the latest `keyrange` and `keyrange_read` tables and routes each
//! keyed request to a node that covers the key. Writes go to the owner;
//! reads go to a random node among the owner and its replicas. When a
//! node answers `server_not_responsible` the tables are refreshed and the
//! request is sent again. `server_write_lock` and `server_stopped` are
//! retried after an exponential backoff with jitter.

use std::collections::HashMap;
use std::time::Duration;

use rand::seq::IndexedRandom;
use rand::Rng;
use ringkv_cluster::{parse_client_snapshot, ClientRange, ClusterError, Endpoint};
use ringkv_protocol::{Command, Reply};
use tracing::debug;

use crate::connection::{Connection, ConnectionError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("invalid keyrange from server: {0}")]
    Keyrange(#[from] ClusterError),

    #[error("no node answered a keyrange request")]
    NoRoute,
}

/// Exponential backoff with random jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`
    /// capped at `max`, plus up to half of that again as jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max);
        let spread = exp.as_millis() as u64 / 2;
        let jitter = rand::rng().random_range(0..=spread);
        exp + Duration::from_millis(jitter)
    }
}

pub struct Client {
    seed: Endpoint,
    write_ranges: Vec<ClientRange>,
    read_ranges: Vec<ClientRange>,
    conns: HashMap<Endpoint, Connection>,
    backoff: Backoff,
    max_attempts: u32,
    timeout: Duration,
}

impl Client {
    /// Creates a client that bootstraps routing from `seed`. No connection
    /// is opened until the first request.
    pub fn new(seed: Endpoint, max_attempts: u32, timeout: Duration) -> Self {
        Self {
            seed,
            write_ranges: Vec::new(),
            read_ranges: Vec::new(),
            conns: HashMap::new(),
            backoff: Backoff::default(),
            max_attempts: max_attempts.max(1),
            timeout,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn seed(&self) -> &Endpoint {
        &self.seed
    }

    /// Points the client at a different bootstrap node and forgets all
    /// routing state.
    pub async fn reseed(&mut self, seed: Endpoint) {
        self.close().await;
        self.write_ranges.clear();
        self.read_ranges.clear();
        self.seed = seed;
    }

    /// The cached write routing table.
    pub fn ranges(&self) -> &[ClientRange] {
        &self.write_ranges
    }

    /// Runs one command against the ring.
    ///
    /// Keyed commands are routed and retried. `keyrange` and
    /// `keyrange_read` are sent to the seed (or any known node) and also
    /// update the cached tables.
    pub async fn execute(&mut self, cmd: &Command) -> Result<Reply, ClientError> {
        if cmd.key().is_none() {
            return self.execute_unkeyed(cmd).await;
        }

        let mut last_reply = None;
        let mut last_err = None;
        for attempt in 0..self.max_attempts {
            let target = self.route(cmd);
            let reply = match self.send_to(&target, cmd).await {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(%target, "request failed: {e}");
                    self.forget(&target);
                    last_err = Some(e);
                    if self.refresh().await.is_err() {
                        tokio::time::sleep(self.backoff.delay(attempt)).await;
                    }
                    continue;
                }
            };

            match reply {
                Reply::NotResponsible => {
                    debug!(%target, cmd = cmd.name(), "not responsible, refreshing keyrange");
                    self.refresh().await?;
                }
                Reply::WriteLock | Reply::Stopped => {
                    let delay = self.backoff.delay(attempt);
                    debug!(%target, ?delay, "{reply}, backing off");
                    tokio::time::sleep(delay).await;
                    if reply == Reply::Stopped {
                        self.forget(&target);
                        let _ = self.refresh().await;
                    }
                }
                other => return Ok(other),
            }
            last_reply = Some(reply);
            last_err = None;
        }

        match (last_reply, last_err) {
            (_, Some(e)) => Err(e.into()),
            (Some(reply), None) => Ok(reply),
            (None, None) => Err(ClientError::NoRoute),
        }
    }

    async fn execute_unkeyed(&mut self, cmd: &Command) -> Result<Reply, ClientError> {
        let seed = self.seed.clone();
        let reply = self.send_to(&seed, cmd).await?;
        match &reply {
            Reply::KeyrangeSuccess(text) => self.write_ranges = parse_client_snapshot(text)?,
            Reply::KeyrangeReadSuccess(text) => self.read_ranges = parse_client_snapshot(text)?,
            _ => {}
        }
        Ok(reply)
    }

    /// Picks the node for a keyed command. Falls back to the seed when
    /// no cached range covers the key.
    fn route(&self, cmd: &Command) -> Endpoint {
        let Some(key) = cmd.key() else {
            return self.seed.clone();
        };
        let table = if cmd.is_write() || self.read_ranges.is_empty() {
            &self.write_ranges
        } else {
            &self.read_ranges
        };
        let candidates: Vec<&ClientRange> = table.iter().filter(|r| r.covers_key(key)).collect();
        let chosen = if cmd.is_write() {
            candidates.first().copied()
        } else {
            candidates.choose(&mut rand::rng()).copied()
        };
        chosen
            .map(|r| r.endpoint.clone())
            .unwrap_or_else(|| self.seed.clone())
    }

    /// Refetches both routing tables from the first node that answers.
    async fn refresh(&mut self) -> Result<(), ClientError> {
        let mut candidates: Vec<Endpoint> = vec![self.seed.clone()];
        for r in &self.write_ranges {
            if !candidates.contains(&r.endpoint) {
                candidates.push(r.endpoint.clone());
            }
        }

        for endpoint in candidates {
            let text = match self.send_to(&endpoint, &Command::Keyrange).await {
                Ok(Reply::KeyrangeSuccess(text)) => text,
                Ok(other) => {
                    debug!(%endpoint, "keyrange refused: {other}");
                    continue;
                }
                Err(e) => {
                    debug!(%endpoint, "keyrange failed: {e}");
                    self.forget(&endpoint);
                    continue;
                }
            };
            let writes = parse_client_snapshot(&text)?;
            let reads = match self.send_to(&endpoint, &Command::KeyrangeRead).await {
                Ok(Reply::KeyrangeReadSuccess(text)) => parse_client_snapshot(&text)?,
                _ => writes.clone(),
            };
            debug!(%endpoint, nodes = writes.len(), "keyrange refreshed");
            self.write_ranges = writes;
            self.read_ranges = reads;
            return Ok(());
        }
        Err(ClientError::NoRoute)
    }

    async fn send_to(&mut self, endpoint: &Endpoint, cmd: &Command) -> Result<Reply, ConnectionError> {
        if !self.conns.contains_key(endpoint) {
            let conn = Connection::connect(&endpoint.host, endpoint.port, self.timeout).await?;
            self.conns.insert(endpoint.clone(), conn);
        }
        let Some(conn) = self.conns.get_mut(endpoint) else {
            return Err(ConnectionError::Disconnected);
        };
        let result = tokio::time::timeout(self.timeout, conn.send(cmd))
            .await
            .map_err(|_| ConnectionError::Timeout(self.timeout))
            .and_then(|r| r);
        if result.is_err() {
            self.conns.remove(endpoint);
        }
        result
    }

    fn forget(&mut self, endpoint: &Endpoint) {
        self.conns.remove(endpoint);
    }

    /// Closes every open connection.
    pub async fn close(&mut self) {
        for (_, conn) in self.conns.drain() {
            conn.shutdown().await;
        }
    }
}
