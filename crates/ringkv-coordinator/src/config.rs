//! Coordinator configuration, loaded the same way as the node's.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

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
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Address to bind to.
    pub host: String,
    /// Port nodes send membership messages to.
    pub port: u16,
    /// Time between gossip rounds.
    pub gossip_interval_ms: u64,
    /// Time between heartbeats to each member.
    pub heartbeat_interval_ms: u64,
    /// Connect and write timeout for outbound deliveries.
    pub peer_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5153,
            gossip_interval_ms: 5000,
            heartbeat_interval_ms: 1000,
            peer_timeout_ms: 5000,
        }
    }
}

impl CoordinatorConfig {
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

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 7000\ngossip_interval_ms = 250").unwrap();
        let cfg = CoordinatorConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.gossip_interval(), Duration::from_millis(250));
        assert_eq!(cfg.heartbeat_interval_ms, 1000);
    }

    #[test]
    fn template_parses_back() {
        let cfg = CoordinatorConfig::default();
        let parsed: CoordinatorConfig = toml::from_str(&cfg.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn out_of_range_port_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = -1").unwrap();
        assert!(matches!(
            CoordinatorConfig::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
