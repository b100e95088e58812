//! Storage node façade
//!
//! Wires the content store, the peer directory, the inbound protocol handler
//! and the distribution/retrieval managers into one running node.

use crate::config::NodeConfig;
use bytes::Bytes;
use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId};
use obscurefs_core::error::{ObscureFsError, Result};
use obscurefs_core::{ContentId, ErasureCodec, Metadata};
use obscurefs_network::{
    peer_id_from_addr, serve_inbound, DistributionManager, NodeContext, PeerDirectory,
    PeerProtocolHandler, PlacementReport, RetrievalManager, SwarmDirectory, WireRequest,
    MAX_SHARD_SIZE,
};
use obscurefs_storage::{ContentStore, ShardDir, StorageConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Result of an upload
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub metadata: Metadata,
    pub report: PlacementReport,
}

impl UploadReceipt {
    pub fn checksum(&self) -> ContentId {
        self.metadata.checksum
    }
}

/// Files one peer reported holding
#[derive(Debug, Clone)]
pub struct NetworkListing {
    pub peer_id: PeerId,
    pub files: HashMap<ContentId, PathBuf>,
}

/// A running storage node
pub struct StorageNode {
    ctx: NodeContext,
    storage: StorageConfig,
    handler: Arc<PeerProtocolHandler>,
    codec: Arc<ErasureCodec>,
    distribution: DistributionManager,
    retrieval: RetrievalManager,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl StorageNode {
    /// Start a node on the libp2p swarm.
    ///
    /// Loads the snapshot, connects to the configured bootstrap peers and
    /// re-announces every shard already held.
    pub async fn start(config: &NodeConfig, keypair: Keypair) -> Result<Self> {
        let (directory, inbound, driver) = SwarmDirectory::spawn(keypair, config.swarm_config())?;
        let mut node = Self::assemble(config, Arc::new(directory))?;

        node.tasks.push(driver);
        node.tasks
            .push(tokio::spawn(serve_inbound(node.handler.clone(), inbound)));

        node.bootstrap(&config.network.bootstrap_peers).await;
        Ok(node)
    }

    /// Start a node on an existing directory. The caller routes inbound
    /// requests to [`StorageNode::handler`].
    pub async fn with_directory(
        config: &NodeConfig,
        directory: Arc<dyn PeerDirectory>,
    ) -> Result<Self> {
        let node = Self::assemble(config, directory)?;
        node.bootstrap(&config.network.bootstrap_peers).await;
        Ok(node)
    }

    fn assemble(config: &NodeConfig, directory: Arc<dyn PeerDirectory>) -> Result<Self> {
        let storage = config.storage_config();
        let peer = directory.local_peer_id().to_string();

        let erasure = config
            .erasure_config()
            .map_err(|e| ObscureFsError::Configuration(e.to_string()))?;
        // Peers cannot serve back anything larger
        let codec = Arc::new(
            ErasureCodec::new(erasure)?
                .with_output_dir(storage.decode_dir())
                .with_max_shard_size(MAX_SHARD_SIZE),
        );

        let ctx = NodeContext::new(
            directory,
            Arc::new(ContentStore::new()),
            ShardDir::new(storage.upload_dir(&peer)),
        );
        let handler = Arc::new(PeerProtocolHandler::new(ctx.clone()));
        let distribution = DistributionManager::new(ctx.clone(), config.placement_config());
        let retrieval =
            RetrievalManager::new(ctx.clone(), codec.clone(), config.retrieval_config());

        Ok(Self {
            ctx,
            storage,
            handler,
            codec,
            distribution,
            retrieval,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    async fn bootstrap(&self, bootstrap_peers: &[String]) {
        self.load_snapshot();
        let connected = self.connect_bootstrap(bootstrap_peers).await;
        let announced = self.distribution.reannounce_local_shards().await;
        info!(
            peer_id = %self.peer_id(),
            bootstrap = connected,
            shards = announced,
            "Storage node ready"
        );
    }

    pub fn peer_id(&self) -> PeerId {
        self.ctx.local_peer_id()
    }

    pub fn handler(&self) -> &Arc<PeerProtocolHandler> {
        &self.handler
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.ctx.store
    }

    pub fn codec(&self) -> &ErasureCodec {
        &self.codec
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.storage.snapshot_path(&self.peer_id().to_string())
    }

    fn load_snapshot(&self) {
        let path = self.snapshot_path();
        if !path.exists() {
            info!(path = %path.display(), "No content store snapshot, starting fresh");
            return;
        }
        match self.ctx.store.load_from_file(&path) {
            Ok(()) => info!(
                path = %path.display(),
                shards = self.ctx.store.file_count(),
                files = self.ctx.store.metadata_count(),
                "Loaded content store snapshot"
            ),
            Err(e) => warn!(
                path = %path.display(),
                error = %e,
                "Failed to load snapshot, starting fresh"
            ),
        }
    }

    pub fn save_snapshot(&self) -> Result<()> {
        let path = self.snapshot_path();
        self.ctx.store.save_to_file(&path)?;
        debug!(path = %path.display(), "Saved content store snapshot");
        Ok(())
    }

    /// Dial each bootstrap address, skipping our own. Returns how many connected.
    pub async fn connect_bootstrap(&self, peers: &[String]) -> usize {
        let local = self.peer_id();
        let mut connected = 0;

        for peer in peers {
            let addr: Multiaddr = match peer.parse() {
                Ok(addr) => addr,
                Err(e) => {
                    warn!(addr = %peer, error = %e, "Skipping malformed bootstrap address");
                    continue;
                }
            };
            match peer_id_from_addr(&addr) {
                Ok(id) if id == local => {
                    debug!(addr = %addr, "Skipping our own bootstrap address");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(addr = %addr, error = %e, "Skipping bootstrap address");
                    continue;
                }
            }
            match self.ctx.directory.connect(addr.clone()).await {
                Ok(id) => {
                    info!(peer = %id, "Connected to bootstrap peer");
                    connected += 1;
                }
                Err(e) => warn!(addr = %addr, error = %e, "Failed to connect to bootstrap peer"),
            }
        }
        connected
    }

    /// Encode `data`, place its shards and record its metadata
    #[instrument(skip(self, data), fields(size = data.len()))]
    pub async fn upload(&self, name: &str, data: Bytes) -> Result<UploadReceipt> {
        self.codec.check_size(data.len())?;
        let codec = self.codec.clone();
        let name = name.to_string();
        let (metadata, shards) = tokio::task::spawn_blocking(move || {
            let mut metadata = Metadata::for_data(name, &data);
            let shards = codec.encode(&mut metadata, &data)?;
            Ok::<_, ObscureFsError>((metadata, shards))
        })
        .await
        .map_err(|e| ObscureFsError::Internal(format!("encode task failed: {}", e)))??;

        let report = self.distribution.share_file_to_peers(&shards).await;
        if !report.is_complete() {
            warn!(
                checksum = %metadata.checksum,
                failed = report.failed.len(),
                "Upload is missing shards"
            );
        }
        self.distribution.share_metadata(metadata.clone());

        info!(
            checksum = %metadata.checksum,
            shards = shards.len(),
            placed = report.placed.len(),
            "Upload finished"
        );
        Ok(UploadReceipt { metadata, report })
    }

    /// Upload a file from disk under its file name
    pub async fn upload_file(&self, path: &Path) -> Result<UploadReceipt> {
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.upload(&name, Bytes::from(data)).await
    }

    /// Reconstruct a file into `temp/<peer>/<checksum>`
    pub async fn download(&self, checksum: &ContentId) -> Result<PathBuf> {
        let output = self
            .storage
            .temp_dir(&self.peer_id().to_string())
            .join(checksum.to_string());
        self.retrieve_to(checksum, &output).await
    }

    /// Reconstruct a file into `output`. Cancelled when the node shuts down.
    pub async fn retrieve_to(&self, checksum: &ContentId, output: &Path) -> Result<PathBuf> {
        let cancel = self.shutdown.child_token();
        self.retrieval.retrieve_file(checksum, output, &cancel).await
    }

    /// Shards held by this node
    pub fn list_files(&self) -> HashMap<ContentId, PathBuf> {
        self.ctx.store.list_files()
    }

    /// Ask every known peer for its shard listing. Peers that fail are skipped.
    pub async fn list_network_files(&self) -> Vec<NetworkListing> {
        let peers = self.ctx.directory.known_peers().await;
        let queries = peers.into_iter().map(|peer| async move {
            let frame = self.ctx.directory.request(peer, WireRequest::ListFiles).await?;
            let files: HashMap<ContentId, PathBuf> = parse_listing(frame.into_body()?)?;
            Ok::<_, ObscureFsError>(NetworkListing {
                peer_id: peer,
                files,
            })
        });

        futures::future::join_all(queries)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(listing) => Some(listing),
                Err(e) => {
                    warn!(error = %e, "Failed to list files on peer");
                    None
                }
            })
            .collect()
    }

    /// Cancel in-flight retrievals, save the snapshot and stop background tasks
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        let saved = self.save_snapshot();
        for task in &self.tasks {
            task.abort();
        }
        info!(peer_id = %self.peer_id(), "Storage node stopped");
        saved
    }
}

fn parse_listing(body: Bytes) -> Result<HashMap<ContentId, PathBuf>> {
    Ok(serde_json::from_slice(&body)?)
}
