//! Shard placement and provider announcements

use crate::placement::{PeerSelector, RandomSelector};
use crate::protocol::WireRequest;
use crate::NodeContext;
use bytes::Bytes;
use libp2p::PeerId;
use obscurefs_core::error::{ObscureFsError, Result};
use obscurefs_core::{ContentId, Metadata};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Placement configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementConfig {
    /// Peers each shard should be placed on
    pub replication: usize,
    /// Peers tried per replica before giving up on it
    pub max_attempts: usize,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            replication: 1,
            max_attempts: 3,
        }
    }
}

impl PlacementConfig {
    pub fn with_replication(mut self, replication: usize) -> Self {
        self.replication = replication.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// Where each shard of an upload ended up
#[derive(Debug, Clone, Default)]
pub struct PlacementReport {
    /// Shards acknowledged by at least one peer
    pub placed: HashMap<ContentId, Vec<PeerId>>,
    /// Shards no peer acknowledged
    pub failed: Vec<ContentId>,
}

impl PlacementReport {
    /// True when every shard was placed somewhere
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn placed_count(&self) -> usize {
        self.placed.len()
    }
}

/// Places freshly encoded shards on peers and announces local holdings
pub struct DistributionManager {
    ctx: NodeContext,
    selector: Arc<dyn PeerSelector>,
    config: PlacementConfig,
}

impl DistributionManager {
    /// Create a manager using uniform random placement
    pub fn new(ctx: NodeContext, config: PlacementConfig) -> Self {
        Self {
            ctx,
            selector: Arc::new(RandomSelector),
            config,
        }
    }

    /// Replace the placement policy
    pub fn with_selector(mut self, selector: Arc<dyn PeerSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    /// Send every shard to peers chosen by the placement policy.
    ///
    /// Each placement must be acknowledged; a peer that fails is replaced by
    /// the next candidate until the attempt budget is spent. Failures are
    /// reported, not returned as errors.
    pub async fn share_file_to_peers(&self, shards: &HashMap<ContentId, Bytes>) -> PlacementReport {
        let mut report = PlacementReport::default();
        let candidates = self.ctx.directory.known_peers().await;

        if candidates.is_empty() {
            warn!(shards = shards.len(), "No peers available for shard placement");
            report.failed = shards.keys().copied().collect();
            return report;
        }

        let placements = shards
            .iter()
            .map(|(id, data)| self.place_shard(*id, data.clone(), &candidates));
        let results = futures::future::join_all(placements).await;

        for (id, peers) in results {
            if peers.is_empty() {
                warn!(shard_id = %id, "Shard could not be placed on any peer");
                report.failed.push(id);
            } else {
                if peers.len() < self.config.replication {
                    warn!(
                        shard_id = %id,
                        placed = peers.len(),
                        wanted = self.config.replication,
                        "Shard under-replicated"
                    );
                }
                report.placed.insert(id, peers);
            }
        }

        info!(
            placed = report.placed.len(),
            failed = report.failed.len(),
            peers = candidates.len(),
            "Shard placement finished"
        );
        report
    }

    async fn place_shard(
        &self,
        id: ContentId,
        data: Bytes,
        candidates: &[PeerId],
    ) -> (ContentId, Vec<PeerId>) {
        let order = self.selector.select_peers(&id, candidates, candidates.len());
        let budget = self.config.replication * self.config.max_attempts;

        let mut placed = Vec::new();
        let mut attempts = 0;
        for peer in order {
            if placed.len() >= self.config.replication || attempts >= budget {
                break;
            }
            attempts += 1;
            match self.send_file(peer, id, data.clone()).await {
                Ok(()) => placed.push(peer),
                Err(e) => warn!(
                    peer = %peer,
                    shard_id = %id,
                    attempt = attempts,
                    error = %e,
                    "Shard placement failed"
                ),
            }
        }
        (id, placed)
    }

    /// Push one shard to one peer and wait for its acknowledgement
    #[instrument(skip(self, data), fields(peer = %peer, shard_id = %id))]
    pub async fn send_file(&self, peer: PeerId, id: ContentId, data: Bytes) -> Result<()> {
        let size = data.len();
        let ack = self
            .ctx
            .directory
            .request(peer, WireRequest::SendFile { key: id, value: data })
            .await?
            .into_body()?;

        if ack.as_ref() != id.to_string().as_bytes() {
            return Err(ObscureFsError::Protocol(format!(
                "peer acknowledged {} instead of {}",
                String::from_utf8_lossy(&ack),
                id
            )));
        }
        debug!(size, "Shard placed");
        Ok(())
    }

    /// Announce this node as provider of a shard given by its text id
    pub async fn announce_file(&self, shard_id: &str) -> Result<()> {
        let id = ContentId::from_base58(shard_id)?;
        self.announce(&id).await
    }

    /// Announce this node as provider of `id`
    pub async fn announce(&self, id: &ContentId) -> Result<()> {
        self.ctx.directory.provide(id).await?;
        debug!(shard_id = %id, "Announced shard");
        Ok(())
    }

    /// Re-announce every shard in the local store. Returns how many succeeded.
    pub async fn reannounce_local_shards(&self) -> usize {
        let ids = self.ctx.store.list_shard_ids();
        let mut announced = 0;
        for id in &ids {
            match self.announce(id).await {
                Ok(()) => announced += 1,
                Err(e) => warn!(shard_id = %id, error = %e, "Failed to re-announce shard"),
            }
        }
        info!(announced, total = ids.len(), "Re-announced local shards");
        announced
    }

    /// Record file metadata locally. Metadata is not replicated to peers.
    pub fn share_metadata(&self, metadata: Metadata) {
        self.ctx.store.store_metadata(metadata);
    }
}
