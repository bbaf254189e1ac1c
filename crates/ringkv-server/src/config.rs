//! Storage node configuration.
//!
//! Resolution order is defaults, then an optional TOML file, then
//! environment variables and CLI flags (applied in `main`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use ringkv_cluster::Endpoint;
use serde::{Deserialize, Serialize};

/// Errors from loading or rendering a node config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid coordinator address '{0}', expected host:port")]
    Coordinator(String),
}

/// Everything a storage node needs to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address to bind both listeners to. Also the address peers and
    /// clients are told to use.
    pub host: String,
    /// Client-facing port. Together with `host` it fixes the ring position.
    pub port: u16,
    /// Peer-facing port for coordinator and agent traffic. 0 picks an
    /// ephemeral port.
    pub peer_port: u16,
    /// Coordinator peer address, `host:port`.
    pub coordinator: String,
    /// Entries held by the read cache. 0 disables it.
    pub cache_capacity: usize,
    /// Maximum concurrent client connections.
    pub max_connections: usize,
    /// Connect and write timeout for outbound peer deliveries.
    pub peer_timeout_ms: u64,
    /// Idle client connections are closed after this many seconds.
    pub idle_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5551,
            peer_port: 0,
            coordinator: "127.0.0.1:5153".into(),
            cache_capacity: 100,
            max_connections: 1024,
            peer_timeout_ms: 5000,
            idle_timeout_secs: 300,
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn coordinator_endpoint(&self) -> Result<Endpoint, ConfigError> {
        self.coordinator
            .parse()
            .map_err(|_| ConfigError::Coordinator(self.coordinator.clone()))
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}
