//! In-process peer directory
//!
//! Used for testing and local development. Every node joined to the same
//! [`MemoryNetwork`] can reach every other online node; requests still go
//! through the shard protocol's wire encoding so framing bugs surface here too.

use crate::directory::{peer_id_from_addr, PeerDirectory, PeerRecord};
use crate::handler::PeerProtocolHandler;
use crate::protocol::{ResponseFrame, WireRequest};
use async_trait::async_trait;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use obscurefs_core::error::{ObscureFsError, Result};
use obscurefs_core::ContentId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

struct MemoryPeer {
    address: Multiaddr,
    online: bool,
    handler: Option<Weak<PeerProtocolHandler>>,
}

#[derive(Default)]
struct HubState {
    peers: HashMap<PeerId, MemoryPeer>,
    providers: HashMap<ContentId, Vec<PeerId>>,
}

/// A simulated overlay shared by in-process nodes
#[derive(Default)]
pub struct MemoryNetwork {
    state: RwLock<HubState>,
    next_port: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a node with a fresh identity
    pub fn join(self: &Arc<Self>) -> Arc<MemoryDirectory> {
        self.join_as(PeerId::random())
    }

    /// Add a node with the given identity
    pub fn join_as(self: &Arc<Self>, peer_id: PeerId) -> Arc<MemoryDirectory> {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed) + 1;
        let address = Multiaddr::empty()
            .with(Protocol::Memory(port))
            .with(Protocol::P2p(peer_id));

        self.state.write().peers.insert(
            peer_id,
            MemoryPeer {
                address,
                online: true,
                handler: None,
            },
        );
        debug!(peer = %peer_id, "Joined memory network");

        Arc::new(MemoryDirectory {
            network: Arc::clone(self),
            local_peer_id: peer_id,
        })
    }

    /// Route requests addressed to `peer` to `handler`
    pub fn attach(&self, peer: PeerId, handler: &Arc<PeerProtocolHandler>) {
        if let Some(entry) = self.state.write().peers.get_mut(&peer) {
            entry.handler = Some(Arc::downgrade(handler));
        }
    }

    /// Take a node offline or bring it back. Its provider records stay.
    pub fn set_online(&self, peer: PeerId, online: bool) {
        if let Some(entry) = self.state.write().peers.get_mut(&peer) {
            entry.online = online;
        }
    }

    /// Every peer advertising `key`
    pub fn providers_of(&self, key: &ContentId) -> Vec<PeerId> {
        self.state
            .read()
            .providers
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    fn is_online(&self, peer: &PeerId) -> bool {
        self.state
            .read()
            .peers
            .get(peer)
            .is_some_and(|p| p.online)
    }

    fn handler_for(&self, peer: &PeerId) -> Result<Arc<PeerProtocolHandler>> {
        let state = self.state.read();
        let entry = state
            .peers
            .get(peer)
            .ok_or_else(|| ObscureFsError::PeerNotFound(peer.to_string()))?;
        if !entry.online {
            return Err(ObscureFsError::Network(format!("peer {} is unreachable", peer)));
        }
        entry
            .handler
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                ObscureFsError::Network(format!(
                    "peer {} does not support the shard protocol",
                    peer
                ))
            })
    }
}

/// One node's view of a [`MemoryNetwork`]
pub struct MemoryDirectory {
    network: Arc<MemoryNetwork>,
    local_peer_id: PeerId,
}

impl MemoryDirectory {
    /// Route requests for this node to `handler`
    pub fn attach(&self, handler: &Arc<PeerProtocolHandler>) {
        self.network.attach(self.local_peer_id, handler);
    }

    /// Dialable address of this node
    pub fn address(&self) -> Option<Multiaddr> {
        self.network
            .state
            .read()
            .peers
            .get(&self.local_peer_id)
            .map(|p| p.address.clone())
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

#[async_trait]
impl PeerDirectory for MemoryDirectory {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn known_peers(&self) -> Vec<PeerId> {
        self.network
            .state
            .read()
            .peers
            .keys()
            .filter(|p| **p != self.local_peer_id)
            .copied()
            .collect()
    }

    async fn find_peer(&self, peer: PeerId) -> Result<PeerRecord> {
        self.network
            .state
            .read()
            .peers
            .get(&peer)
            .map(|p| PeerRecord {
                peer_id: peer,
                addresses: vec![p.address.clone()],
            })
            .ok_or_else(|| ObscureFsError::PeerNotFound(peer.to_string()))
    }

    async fn provide(&self, key: &ContentId) -> Result<()> {
        let mut state = self.network.state.write();
        let providers = state.providers.entry(*key).or_default();
        if !providers.contains(&self.local_peer_id) {
            providers.push(self.local_peer_id);
        }
        Ok(())
    }

    async fn find_providers(&self, key: &ContentId, limit: usize) -> Result<Vec<PeerId>> {
        let mut providers = self.network.providers_of(key);
        providers.truncate(limit);
        Ok(providers)
    }

    async fn connect(&self, addr: Multiaddr) -> Result<PeerId> {
        let peer = peer_id_from_addr(&addr)?;
        if self.network.is_online(&peer) {
            Ok(peer)
        } else {
            Err(ObscureFsError::Network(format!("failed to dial {}", addr)))
        }
    }

    async fn request(&self, peer: PeerId, request: WireRequest) -> Result<ResponseFrame> {
        if !self.network.is_online(&self.local_peer_id) {
            return Err(ObscureFsError::Network("local node is offline".to_string()));
        }
        let handler = self.network.handler_for(&peer)?;

        let request = WireRequest::decode(&request.encode()?)?;
        let response = handler.handle(self.local_peer_id, request).await;
        ResponseFrame::decode(&response.encode())
    }
}
