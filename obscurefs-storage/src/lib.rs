//! ObscureFS Storage
//!
//! Local state of a node:
//! - `ContentStore` maps shard ids to local paths and checksums to file metadata
//! - `ShardDir` is the on-disk area shards received from peers are written to
//! - `StorageConfig` lays out every path a node uses under its data directory

pub mod shard_dir;
pub mod store;

pub use shard_dir::ShardDir;
pub use store::ContentStore;

use std::path::{Path, PathBuf};

/// Storage layout configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for everything the node writes
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./obscurefs_data"),
        }
    }
}

impl StorageConfig {
    /// Create a new storage config with the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.path
    }

    /// Where shards received from peers are kept: `uploads/<peer>`
    pub fn upload_dir(&self, peer: &str) -> PathBuf {
        self.path.join("uploads").join(peer)
    }

    /// Content store snapshot: `filestore_<peer>.json`
    pub fn snapshot_path(&self, peer: &str) -> PathBuf {
        self.path.join(format!("filestore_{}.json", peer))
    }

    /// Root for reconstructed files: `decoded`
    pub fn decode_dir(&self) -> PathBuf {
        self.path.join("decoded")
    }

    /// Scratch area for downloads: `temp/<peer>`
    pub fn temp_dir(&self, peer: &str) -> PathBuf {
        self.path.join("temp").join(peer)
    }
}
