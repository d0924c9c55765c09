//! Configuration for a blockfs storage node

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BlockfsError, Result};
use crate::{
    DEFAULT_BLOCK_CAPACITY, DEFAULT_DRAIN_TIMEOUT_SECS, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_REQUEST_BYTES,
};

/// Storage node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Interface to listen on
    pub bind_host: IpAddr,
    /// TCP port; also names the node's storage directory
    pub port: u16,
    /// Number of block slots owned by this node
    pub capacity: usize,
    /// Directory under which `data_<port>` is created
    pub data_root: PathBuf,
    /// Close sessions that stay silent this long. `None` waits forever.
    pub idle_timeout_secs: Option<u64>,
    /// Upper bound on concurrently served connections
    pub max_connections: usize,
    /// Longest request line accepted; longer lines get an error response
    pub max_request_bytes: usize,
    /// How long shutdown waits for in-flight sessions
    pub drain_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            capacity: DEFAULT_BLOCK_CAPACITY,
            data_root: PathBuf::from("."),
            idle_timeout_secs: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
        }
    }
}

impl NodeConfig {
    /// Load configuration from a `.toml` or `.json` file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            BlockfsError::ConfigError(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::load_from_toml(&content),
            Some("json") => Self::load_from_json(&content),
            _ => Err(BlockfsError::ConfigError(format!(
                "Unsupported config file format: {:?}",
                path
            ))),
        }
    }

    pub fn load_from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn load_from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Reject settings the node cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(BlockfsError::ConfigError(
                "port must be between 1 and 65535".to_string(),
            ));
        }
        if self.capacity == 0 {
            return Err(BlockfsError::ConfigError(
                "capacity must be at least 1".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(BlockfsError::ConfigError(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.max_request_bytes == 0 {
            return Err(BlockfsError::ConfigError(
                "max_request_bytes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.port)
    }

    /// Per-node storage directory, named after the port
    pub fn data_dir(&self) -> PathBuf {
        self.data_root.join(format!("data_{}", self.port))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}
