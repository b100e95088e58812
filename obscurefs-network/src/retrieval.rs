//! File retrieval
//!
//! Rebuilds a file from its shards: local shards are read from disk, the rest
//! are fetched from providers found through the peer directory. Every shard is
//! fetched concurrently and, within a shard, providers are raced; the first
//! response whose hash matches the shard id wins.

use crate::protocol::WireRequest;
use crate::NodeContext;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use libp2p::PeerId;
use obscurefs_core::error::{ObscureFsError, Result};
use obscurefs_core::{ContentId, ErasureCodec, Metadata};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Retrieval configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalConfig {
    /// Providers asked for per shard
    pub provider_limit: usize,
    /// Bound on a single provider fetch
    pub fetch_timeout: Duration,
    /// Bound on the whole retrieval
    pub deadline: Option<Duration>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            provider_limit: 10,
            fetch_timeout: Duration::from_secs(30),
            deadline: None,
        }
    }
}

impl RetrievalConfig {
    pub fn with_provider_limit(mut self, limit: usize) -> Self {
        self.provider_limit = limit.max(1);
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Discovers providers for a file's shards and drives reconstruction
pub struct RetrievalManager {
    ctx: NodeContext,
    codec: Arc<ErasureCodec>,
    config: RetrievalConfig,
}

impl RetrievalManager {
    pub fn new(ctx: NodeContext, codec: Arc<ErasureCodec>, config: RetrievalConfig) -> Self {
        Self { ctx, codec, config }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Reconstruct the file with `checksum` and copy it to `output`.
    ///
    /// Fails with a not-found error when the metadata is unknown, when any
    /// shard has no provider, or when no shard at all could be fetched.
    #[instrument(skip(self, output, cancel), fields(checksum = %checksum))]
    pub async fn retrieve_file(
        &self,
        checksum: &ContentId,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        // Cancelled on every exit so an abandoned copy never lands in `output`
        let abandon = cancel.child_token();
        let _abandon_on_exit = abandon.clone().drop_guard();
        let work = self.retrieve_inner(checksum, output, abandon);

        let bounded = async {
            match self.config.deadline {
                Some(deadline) => match tokio::time::timeout(deadline, work).await {
                    Ok(result) => result,
                    Err(_) => Err(ObscureFsError::Timeout(format!(
                        "retrieval of {} exceeded {:?}",
                        checksum, deadline
                    ))),
                },
                None => work.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Retrieval cancelled");
                Err(ObscureFsError::Cancelled)
            }
            result = bounded => result,
        }
    }

    async fn retrieve_inner(
        &self,
        checksum: &ContentId,
        output: &Path,
        abandon: CancellationToken,
    ) -> Result<PathBuf> {
        let metadata = self.ctx.store.get_metadata(checksum)?;
        let local_peer = self.ctx.local_peer_id();

        // Unique shard ids; identical shards share an id
        let unique: Vec<ContentId> = {
            let mut seen = HashSet::new();
            metadata
                .parts
                .iter()
                .filter(|id| seen.insert(**id))
                .copied()
                .collect()
        };

        let mut collected: HashMap<ContentId, Bytes> = HashMap::new();
        let mut remote = Vec::new();
        for id in unique {
            match self.read_local(&id).await {
                Some(data) => {
                    collected.insert(id, data);
                }
                None => remote.push(id),
            }
        }

        let providers = self.discover_providers(&remote, local_peer).await?;

        let fetches = providers
            .into_iter()
            .map(|(id, peers)| async move { (id, self.fetch_shard(id, peers).await) });
        for (id, fetched) in futures::future::join_all(fetches).await {
            if let Some(data) = fetched {
                collected.insert(id, data);
            }
        }

        let shards: Vec<Option<Bytes>> = metadata
            .parts
            .iter()
            .map(|id| collected.get(id).cloned())
            .collect();
        let available = shards.iter().filter(|s| s.is_some()).count();
        if available == 0 {
            return Err(ObscureFsError::ShardNotFound(format!(
                "no shard of {} could be retrieved",
                checksum
            )));
        }
        info!(
            available,
            total = shards.len(),
            "Collected shards, reconstructing"
        );

        let decoded = self.decode(metadata, shards).await?;
        copy_to_output(&decoded, output, abandon).await?;

        info!(output = %output.display(), "File retrieved");
        Ok(output.to_path_buf())
    }

    /// Shard bytes from the local store, if held and intact
    async fn read_local(&self, id: &ContentId) -> Option<Bytes> {
        let path = self.ctx.store.get_file(id).ok()?;
        match self.ctx.shards.read(&path).await {
            Ok(data) if id.matches(&data) => {
                debug!(shard_id = %id, "Using local shard");
                Some(data)
            }
            Ok(_) => {
                warn!(shard_id = %id, "Local shard is corrupted, fetching from peers");
                None
            }
            Err(e) => {
                warn!(shard_id = %id, error = %e, "Local shard unreadable, fetching from peers");
                None
            }
        }
    }

    /// Provider lists for every id. Any id without providers aborts.
    async fn discover_providers(
        &self,
        ids: &[ContentId],
        local_peer: PeerId,
    ) -> Result<Vec<(ContentId, Vec<PeerId>)>> {
        let limit = self.config.provider_limit;
        let lookups = ids.iter().map(|id| async move {
            let found = self.ctx.directory.find_providers(id, limit).await;
            (*id, found)
        });

        let mut result = Vec::with_capacity(ids.len());
        for (id, found) in futures::future::join_all(lookups).await {
            let peers: Vec<PeerId> = found?.into_iter().filter(|p| *p != local_peer).collect();
            if peers.is_empty() {
                warn!(shard_id = %id, "No providers for shard");
                return Err(ObscureFsError::NoProviders(id.to_string()));
            }
            debug!(shard_id = %id, providers = peers.len(), "Found providers");
            result.push((id, peers));
        }
        Ok(result)
    }

    /// Race `providers` for one shard; the first hash-verified response wins.
    async fn fetch_shard(&self, id: ContentId, providers: Vec<PeerId>) -> Option<Bytes> {
        let timeout = self.config.fetch_timeout;
        let mut pending: FuturesUnordered<_> = providers
            .into_iter()
            .map(|peer| async move {
                let result = tokio::time::timeout(
                    timeout,
                    self.ctx.directory.request(peer, WireRequest::GetShard(id)),
                )
                .await;
                (peer, result)
            })
            .collect();

        while let Some((peer, result)) = pending.next().await {
            match result {
                Ok(Ok(frame)) => match frame.into_body() {
                    Ok(data) if id.matches(&data) => {
                        debug!(peer = %peer, shard_id = %id, size = data.len(), "Fetched shard");
                        return Some(data);
                    }
                    Ok(_) => {
                        warn!(peer = %peer, shard_id = %id, "Provider returned corrupted shard")
                    }
                    Err(e) => warn!(
                        peer = %peer,
                        shard_id = %id,
                        error = %e,
                        "Provider could not serve shard"
                    ),
                },
                Ok(Err(e)) => warn!(peer = %peer, shard_id = %id, error = %e, "Shard fetch failed"),
                Err(_) => warn!(peer = %peer, shard_id = %id, "Shard fetch timed out"),
            }
        }

        warn!(shard_id = %id, "No provider delivered the shard");
        None
    }

    async fn decode(&self, metadata: Metadata, shards: Vec<Option<Bytes>>) -> Result<PathBuf> {
        let codec = Arc::clone(&self.codec);
        tokio::task::spawn_blocking(move || codec.decode(&metadata, shards))
            .await
            .map_err(|e| ObscureFsError::Internal(format!("decode task failed: {}", e)))?
    }
}

/// Stage the copy next to `output` and rename it into place. The staged file
/// is removed on failure, and nothing is renamed once `abandon` fires.
async fn copy_to_output(decoded: &Path, output: &Path, abandon: CancellationToken) -> Result<()> {
    if decoded == output {
        return Ok(());
    }
    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&dir).await?;

    let (decoded, output) = (decoded.to_path_buf(), output.to_path_buf());
    tokio::task::spawn_blocking(move || {
        let mut staged = tempfile::NamedTempFile::new_in(&dir)?;
        let mut source = std::fs::File::open(&decoded)?;
        std::io::copy(&mut source, staged.as_file_mut())?;
        staged.as_file().sync_all()?;

        if abandon.is_cancelled() {
            return Err(ObscureFsError::Cancelled);
        }
        staged.persist(&output).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| ObscureFsError::Internal(format!("copy task failed: {}", e)))?
}
