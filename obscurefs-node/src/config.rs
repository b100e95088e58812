//! Configuration management for the ObscureFS storage node
//!
//! Supports loading from TOML files, CLI overrides and environment variables.

use libp2p::Multiaddr;
use obscurefs_core::ErasureConfig;
use obscurefs_network::{peer_id_from_addr, PlacementConfig, RetrievalConfig, SwarmConfig};
use obscurefs_storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub erasure: ErasureSettings,

    #[serde(default)]
    pub placement: PlacementSettings,

    #[serde(default)]
    pub retrieval: RetrievalSettings,
}

impl NodeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Validate the configuration, creating the data directory if needed
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.node.data_dir.exists() {
            std::fs::create_dir_all(&self.node.data_dir).map_err(|e| {
                ConfigError::ValidationError(format!(
                    "Cannot create data directory {:?}: {}",
                    self.node.data_dir, e
                ))
            })?;
        }

        self.erasure_config()?;

        if self.placement.replication == 0 {
            return Err(ConfigError::ValidationError(
                "placement.replication must be at least 1".to_string(),
            ));
        }
        if self.placement.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "placement.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retrieval.provider_limit == 0 {
            return Err(ConfigError::ValidationError(
                "retrieval.provider_limit must be at least 1".to_string(),
            ));
        }

        for peer in &self.network.bootstrap_peers {
            let addr: Multiaddr = peer.parse().map_err(|e| {
                ConfigError::ValidationError(format!("Bad bootstrap address {}: {}", peer, e))
            })?;
            peer_id_from_addr(&addr)
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }

        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(
        mut self,
        data_dir: Option<PathBuf>,
        port: Option<u16>,
        bootstrap: Vec<String>,
    ) -> Self {
        if let Some(dir) = data_dir {
            self.node.data_dir = dir;
        }
        if let Some(p) = port {
            self.network.listen_port = p;
        }
        if !bootstrap.is_empty() {
            self.network.bootstrap_peers = bootstrap;
        }
        self
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("OBSCUREFS_DATA_DIR") {
            self.node.data_dir = PathBuf::from(dir);
        }

        if let Ok(port) = std::env::var("OBSCUREFS_PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.network.listen_port = p,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid OBSCUREFS_PORT"),
            }
        }

        if let Some(n) = env_usize("ERASURE_DATA_SHARDS") {
            self.erasure.data_shards = n;
        }
        if let Some(n) = env_usize("ERASURE_PARITY_SHARDS") {
            self.erasure.parity_shards = n;
        }

        // Comma separated
        if let Ok(peers) = std::env::var("OBSCUREFS_BOOTSTRAP") {
            self.network.bootstrap_peers = peers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        self
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig::new(self.node.data_dir.clone())
    }

    pub fn erasure_config(&self) -> Result<ErasureConfig, ConfigError> {
        ErasureConfig::new(self.erasure.data_shards, self.erasure.parity_shards)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    pub fn swarm_config(&self) -> SwarmConfig {
        SwarmConfig::default()
            .with_listen_port(self.network.listen_port)
            .with_request_timeout(Duration::from_secs(self.network.request_timeout_secs))
    }

    pub fn placement_config(&self) -> PlacementConfig {
        PlacementConfig::default()
            .with_replication(self.placement.replication)
            .with_max_attempts(self.placement.max_attempts)
    }

    pub fn retrieval_config(&self) -> RetrievalConfig {
        let config = RetrievalConfig::default()
            .with_provider_limit(self.retrieval.provider_limit)
            .with_fetch_timeout(Duration::from_secs(self.retrieval.fetch_timeout_secs));
        match self.retrieval.deadline_secs {
            Some(secs) => config.with_deadline(Duration::from_secs(secs)),
            None => config,
        }
    }

    /// Path of the node's libp2p identity key
    pub fn identity_path(&self) -> PathBuf {
        self.node
            .identity_path
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("identity.key"))
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(var = name, value = %value, "Ignoring invalid value");
            None
        }
    }
}

/// Local node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Root of everything the node writes
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Protobuf-encoded keypair; defaults to `<data_dir>/identity.key`
    #[serde(default)]
    pub identity_path: Option<PathBuf>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            identity_path: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./obscurefs_data")
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// libp2p port, used for both TCP and QUIC
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Multiaddrs ending in `/p2p/<peer-id>`
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            bootstrap_peers: Vec::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_listen_port() -> u16 {
    4001
}

fn default_request_timeout() -> u64 {
    30
}

/// Erasure coding settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErasureSettings {
    #[serde(default = "default_data_shards")]
    pub data_shards: usize,

    #[serde(default = "default_parity_shards")]
    pub parity_shards: usize,
}

impl Default for ErasureSettings {
    fn default() -> Self {
        Self {
            data_shards: default_data_shards(),
            parity_shards: default_parity_shards(),
        }
    }
}

fn default_data_shards() -> usize {
    obscurefs_core::DATA_SHARDS
}

fn default_parity_shards() -> usize {
    obscurefs_core::PARITY_SHARDS
}

/// Shard placement settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementSettings {
    /// Peers that must acknowledge each shard
    #[serde(default = "default_replication")]
    pub replication: usize,

    /// Attempts per wanted replica before a shard is reported failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

impl Default for PlacementSettings {
    fn default() -> Self {
        Self {
            replication: default_replication(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_replication() -> usize {
    1
}

fn default_max_attempts() -> usize {
    3
}

/// Retrieval settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSettings {
    /// Providers looked up per shard
    #[serde(default = "default_provider_limit")]
    pub provider_limit: usize,

    /// Timeout for one shard fetch from one provider
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Overall deadline for a retrieval (none by default)
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            provider_limit: default_provider_limit(),
            fetch_timeout_secs: default_fetch_timeout(),
            deadline_secs: None,
        }
    }
}

fn default_provider_limit() -> usize {
    10
}

fn default_fetch_timeout() -> u64 {
    30
}
