//! Content store
//!
//! Records what this node holds locally: shard id → path of the shard file,
//! and checksum → metadata for files uploaded through this node. Both maps sit
//! behind one lock so a snapshot always sees them in a consistent state.

use obscurefs_core::error::{ObscureFsError, Result};
use obscurefs_core::{ContentId, Metadata};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Serialized form of the store
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    files: HashMap<ContentId, PathBuf>,
    #[serde(rename = "metaData", default)]
    metadata: HashMap<ContentId, Metadata>,
}

/// Thread-safe local index of shards and file metadata
#[derive(Debug, Default)]
pub struct ContentStore {
    state: RwLock<StoreState>,
}

impl ContentStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `shard_id` is held locally at `path`
    pub fn store_file(&self, shard_id: ContentId, path: impl Into<PathBuf>) {
        let path = path.into();
        debug!(shard_id = %shard_id, path = %path.display(), "Stored shard location");
        self.state.write().files.insert(shard_id, path);
    }

    /// Record metadata for an uploaded file, keyed by its checksum
    pub fn store_metadata(&self, metadata: Metadata) {
        debug!(checksum = %metadata.checksum, name = %metadata.name, "Stored metadata");
        self.state
            .write()
            .metadata
            .insert(metadata.checksum, metadata);
    }

    /// Local path of a shard
    pub fn get_file(&self, shard_id: &ContentId) -> Result<PathBuf> {
        self.state
            .read()
            .files
            .get(shard_id)
            .cloned()
            .ok_or_else(|| ObscureFsError::ShardNotFound(shard_id.to_string()))
    }

    /// Metadata of a file uploaded through this node
    pub fn get_metadata(&self, checksum: &ContentId) -> Result<Metadata> {
        self.state
            .read()
            .metadata
            .get(checksum)
            .cloned()
            .ok_or_else(|| ObscureFsError::MetadataNotFound(checksum.to_string()))
    }

    /// Whether a shard is held locally
    pub fn contains_file(&self, shard_id: &ContentId) -> bool {
        self.state.read().files.contains_key(shard_id)
    }

    /// Copy of the shard id → path map
    pub fn list_files(&self) -> HashMap<ContentId, PathBuf> {
        self.state.read().files.clone()
    }

    /// Copy of the checksum → metadata map
    pub fn list_metadata(&self) -> HashMap<ContentId, Metadata> {
        self.state.read().metadata.clone()
    }

    /// Ids of every shard held locally
    pub fn list_shard_ids(&self) -> Vec<ContentId> {
        self.state.read().files.keys().copied().collect()
    }

    pub fn file_count(&self) -> usize {
        self.state.read().files.len()
    }

    pub fn metadata_count(&self) -> usize {
        self.state.read().metadata.len()
    }

    /// Write a JSON snapshot of both maps to `path`
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = {
            let state = self.state.read();
            serde_json::to_vec_pretty(&*state)?
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;

        info!(path = %path.display(), "Content store snapshot saved");
        Ok(())
    }

    /// Replace the in-memory state with the snapshot at `path`
    pub fn load_from_file(&self, path: &Path) -> Result<()> {
        let bytes = fs::read(path)?;
        let loaded: StoreState = serde_json::from_slice(&bytes).map_err(|e| {
            ObscureFsError::Serialization(format!("{}: {}", path.display(), e))
        })?;

        let (files, metadata) = (loaded.files.len(), loaded.metadata.len());
        *self.state.write() = loaded;

        info!(path = %path.display(), files, metadata, "Content store snapshot loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obscurefs_core::ErrorKind;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn metadata(name: &str) -> Metadata {
        let mut meta = Metadata::for_data(name, name.as_bytes());
        meta.shards = 2;
        meta.parity = 1;
        meta.parts = vec![
            ContentId::from_data(b"p0"),
            ContentId::from_data(b"p1"),
            ContentId::from_data(b"p2"),
        ];
        meta.size = Some(name.len() as u64);
        meta
    }

    #[test]
    fn test_store_and_get() {
        let store = ContentStore::new();
        let id = ContentId::from_data(b"shard");
        store.store_file(id, "uploads/peer/shard");

        assert_eq!(store.get_file(&id).unwrap(), PathBuf::from("uploads/peer/shard"));
        assert!(store.contains_file(&id));

        let missing = ContentId::from_data(b"missing");
        let err = store.get_file(&missing).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let meta = metadata("a.txt");
        store.store_metadata(meta.clone());
        assert_eq!(store.get_metadata(&meta.checksum).unwrap(), meta);
        assert!(matches!(
            store.get_metadata(&missing),
            Err(ObscureFsError::MetadataNotFound(_))
        ));
    }

    #[test]
    fn test_lists_are_copies() {
        let store = ContentStore::new();
        let id = ContentId::from_data(b"one");
        store.store_file(id, "one");

        let mut listed = store.list_files();
        listed.clear();
        assert_eq!(store.file_count(), 1);

        let mut metas = store.list_metadata();
        metas.insert(ContentId::from_data(b"x"), metadata("x"));
        assert_eq!(store.metadata_count(), 0);
        assert_eq!(store.list_shard_ids(), vec![id]);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("filestore_peer.json");

        let store = ContentStore::new();
        store.store_file(ContentId::from_data(b"s1"), "uploads/p/s1");
        store.store_file(ContentId::from_data(b"s2"), "uploads/p/s2");
        store.store_metadata(metadata("doc.pdf"));
        store.save_to_file(&path).unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert!(raw.get("files").is_some());
        assert!(raw.get("metaData").is_some());

        let restored = ContentStore::new();
        restored.load_from_file(&path).unwrap();
        assert_eq!(restored.list_files(), store.list_files());
        assert_eq!(restored.list_metadata(), store.list_metadata());

        // save → load → save produces the same snapshot
        let second = dir.path().join("second.json");
        restored.save_to_file(&second).unwrap();
        let a: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let b: serde_json::Value = serde_json::from_slice(&fs::read(&second).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.json");

        ContentStore::new().save_to_file(&path).unwrap();
        let restored = ContentStore::new();
        restored.store_file(ContentId::from_data(b"stale"), "stale");
        restored.load_from_file(&path).unwrap();

        assert_eq!(restored.file_count(), 0);
        assert_eq!(restored.metadata_count(), 0);
    }

    #[test]
    fn test_load_replaces_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snap.json");

        let original = ContentStore::new();
        original.store_file(ContentId::from_data(b"kept"), "kept");
        original.save_to_file(&path).unwrap();

        let store = ContentStore::new();
        store.store_file(ContentId::from_data(b"dropped"), "dropped");
        store.load_from_file(&path).unwrap();

        assert!(store.contains_file(&ContentId::from_data(b"kept")));
        assert!(!store.contains_file(&ContentId::from_data(b"dropped")));
    }

    #[test]
    fn test_load_errors() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.json");
        assert!(matches!(
            ContentStore::new().load_from_file(&missing),
            Err(ObscureFsError::Io(_))
        ));

        let garbage = dir.path().join("garbage.json");
        fs::write(&garbage, b"{not json").unwrap();
        assert!(matches!(
            ContentStore::new().load_from_file(&garbage),
            Err(ObscureFsError::Serialization(_))
        ));
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let store = Arc::new(ContentStore::new());
        let writers = 8;
        let per_writer = 200;

        let mut handles = Vec::new();
        for w in 0..writers {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for i in 0..per_writer {
                    let id = ContentId::from_data(format!("{w}-{i}").as_bytes());
                    store.store_file(id, format!("uploads/{w}/{i}"));
                    if i % 50 == 0 {
                        store.store_metadata(metadata(&format!("{w}-{i}.bin")));
                    }
                }
            }));
        }
        for _ in 0..4 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for _ in 0..per_writer {
                    let files = store.list_files();
                    let ids = store.list_shard_ids();
                    assert!(files.len() <= writers * per_writer);
                    assert!(ids.len() <= writers * per_writer);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.file_count(), writers * per_writer);
        assert_eq!(store.metadata_count(), writers * (per_writer / 50));
    }
}
