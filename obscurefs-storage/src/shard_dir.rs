//! On-disk shard area
//!
//! Shards received from peers are written as one file per shard, named by the
//! shard id, under the node's upload directory.

use bytes::Bytes;
use obscurefs_core::error::{ObscureFsError, Result};
use obscurefs_core::ContentId;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Directory holding shard files
#[derive(Debug, Clone)]
pub struct ShardDir {
    root: PathBuf,
}

impl ShardDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a shard is (or would be) stored at
    pub fn path_for(&self, shard_id: &ContentId) -> PathBuf {
        self.root.join(shard_id.to_string())
    }

    /// Write `data` as the file for `shard_id`, returning its path.
    ///
    /// Each write stages into its own temp file, so concurrent writes of the
    /// same shard all succeed and the last rename wins.
    pub async fn write(&self, shard_id: &ContentId, data: &[u8]) -> Result<PathBuf> {
        fs::create_dir_all(&self.root).await?;

        let path = self.path_for(shard_id);
        let (root, target, owned) = (self.root.clone(), path.clone(), data.to_vec());
        tokio::task::spawn_blocking(move || {
            let mut staged = tempfile::NamedTempFile::new_in(&root)?;
            staged.write_all(&owned)?;
            staged.persist(&target).map_err(|e| e.error)?;
            Ok::<_, ObscureFsError>(())
        })
        .await
        .map_err(|e| ObscureFsError::Internal(format!("shard write task failed: {}", e)))??;

        debug!(shard_id = %shard_id, size = data.len(), "Wrote shard file");
        Ok(path)
    }

    /// Read a shard file recorded in the content store
    pub async fn read(&self, path: &Path) -> Result<Bytes> {
        Ok(Bytes::from(fs::read(path).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let shards = ShardDir::new(dir.path().join("uploads").join("peer"));
        let data = b"shard bytes";
        let id = ContentId::from_data(data);

        let path = shards.write(&id, data).await.unwrap();
        assert_eq!(path, shards.path_for(&id));
        assert_eq!(shards.read(&path).await.unwrap().as_ref(), data);
    }

    #[tokio::test]
    async fn test_read_missing() {
        let dir = TempDir::new().unwrap();
        let shards = ShardDir::new(dir.path());
        assert!(shards.read(&dir.path().join("nope")).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_of_same_shard() {
        let dir = TempDir::new().unwrap();
        let shards = ShardDir::new(dir.path().join("uploads"));
        let data = bytes::Bytes::from(vec![42u8; 256 * 1024]);
        let id = ContentId::from_data(&data);

        let writes: Vec<_> = (0..8)
            .map(|_| {
                let shards = shards.clone();
                let data = data.clone();
                tokio::spawn(async move { shards.write(&id, &data).await })
            })
            .collect();
        for write in writes {
            assert_eq!(write.await.unwrap().unwrap(), shards.path_for(&id));
        }

        assert_eq!(shards.read(&shards.path_for(&id)).await.unwrap(), data);
        // only the shard file remains, no staged leftovers
        let entries = std::fs::read_dir(shards.root()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
