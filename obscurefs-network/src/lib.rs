//! ObscureFS Network Layer
//!
//! Moves shards between nodes and keeps track of who holds what:
//! - **Shard protocol**: one framed request/response per stream (`protocol`, `codec`)
//! - **Peer directory**: peer lookup and shard provider records (`directory`)
//! - **libp2p swarm**: Kademlia + identify + ping + the shard protocol (`swarm`)
//!
//! # Architecture
//!
//! ```text
//!   upload                                   download
//!     │                                          │
//!     ▼                                          ▼
//! ┌──────────────────────┐          ┌──────────────────────┐
//! │ DistributionManager  │          │  RetrievalManager    │
//! │ (place + announce)   │          │ (discover + race)    │
//! └──────────┬───────────┘          └──────────┬───────────┘
//!            │          NodeContext            │
//!            ▼                                 ▼
//! ┌──────────────────────────────────────────────────────┐
//! │ PeerDirectory  (SwarmDirectory | MemoryDirectory)    │
//! └──────────────────────────┬───────────────────────────┘
//!                            │ shard protocol
//!                            ▼
//!                 ┌──────────────────────┐
//!                 │ PeerProtocolHandler  │ ── ContentStore / ShardDir
//!                 └──────────────────────┘
//! ```

pub mod behavior;
pub mod codec;
pub mod directory;
pub mod distribution;
pub mod handler;
pub mod memory;
pub mod placement;
pub mod protocol;
pub mod retrieval;
pub mod swarm;

// Re-exports
pub use behavior::{BehaviourConfig, NodeEvent, ObscureBehaviour};
pub use codec::ShardCodec;
pub use directory::{peer_id_from_addr, PeerDirectory, PeerRecord};
pub use distribution::{DistributionManager, PlacementConfig, PlacementReport};
pub use handler::{serve_inbound, InboundRequest, PeerProtocolHandler};
pub use memory::{MemoryDirectory, MemoryNetwork};
pub use placement::{PeerSelector, RandomSelector};
pub use protocol::{ResponseFrame, ResponseStatus, WireRequest, MAX_SHARD_SIZE, PROTOCOL_NAME};
pub use retrieval::{RetrievalConfig, RetrievalManager};
pub use swarm::{SwarmConfig, SwarmDirectory};

use obscurefs_storage::{ContentStore, ShardDir};
use std::sync::Arc;

/// Shared state handed to every component of a node
#[derive(Clone)]
pub struct NodeContext {
    /// Overlay access
    pub directory: Arc<dyn PeerDirectory>,
    /// Local shard and metadata index
    pub store: Arc<ContentStore>,
    /// Where received shards are written
    pub shards: ShardDir,
}

impl NodeContext {
    pub fn new(
        directory: Arc<dyn PeerDirectory>,
        store: Arc<ContentStore>,
        shards: ShardDir,
    ) -> Self {
        Self {
            directory,
            store,
            shards,
        }
    }

    /// Identity of this node
    pub fn local_peer_id(&self) -> libp2p::PeerId {
        self.directory.local_peer_id()
    }
}
