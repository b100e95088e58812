//! ObscureFS Storage Node Library
//!
//! Provides the pieces the daemon is built from:
//! - Configuration management (TOML, CLI and environment overrides)
//! - Persistent libp2p identity
//! - `StorageNode`, the upload / download / listing façade over a running node

pub mod config;
pub mod identity;
pub mod node;

pub use config::{
    ConfigError, ErasureSettings, NetworkSettings, NodeConfig, NodeSettings, PlacementSettings,
    RetrievalSettings,
};
pub use identity::load_or_generate_keypair;
pub use node::{NetworkListing, StorageNode, UploadReceipt};
