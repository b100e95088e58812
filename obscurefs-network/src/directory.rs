//! Peer directory capability
//!
//! Everything the pipeline needs from the overlay: peer lookup, provider
//! records for shard ids, dialing, and one request/response exchange on the
//! shard protocol. [`crate::swarm::SwarmDirectory`] implements it on libp2p,
//! [`crate::memory::MemoryDirectory`] in process.

use crate::protocol::{ResponseFrame, WireRequest};
use async_trait::async_trait;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use obscurefs_core::error::{ObscureFsError, Result};
use obscurefs_core::ContentId;

/// Known addresses of a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addresses: Vec<Multiaddr>,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            addresses: Vec::new(),
        }
    }
}

#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Identity of this node
    fn local_peer_id(&self) -> PeerId;

    /// Peers this node knows about, never including itself
    async fn known_peers(&self) -> Vec<PeerId>;

    /// Look up a peer's addresses
    async fn find_peer(&self, peer: PeerId) -> Result<PeerRecord>;

    /// Advertise this node as a provider of `key`
    async fn provide(&self, key: &ContentId) -> Result<()>;

    /// Up to `limit` peers advertising `key`
    async fn find_providers(&self, key: &ContentId, limit: usize) -> Result<Vec<PeerId>>;

    /// Dial `addr`, which must end in `/p2p/<peer-id>`
    async fn connect(&self, addr: Multiaddr) -> Result<PeerId>;

    /// Send one request and wait for its response
    async fn request(&self, peer: PeerId, request: WireRequest) -> Result<ResponseFrame>;
}

/// Extract the peer id from the trailing `/p2p/<id>` component of an address
pub fn peer_id_from_addr(addr: &Multiaddr) -> Result<PeerId> {
    addr.iter()
        .find_map(|p| match p {
            Protocol::P2p(peer_id) => Some(peer_id),
            _ => None,
        })
        .ok_or_else(|| {
            ObscureFsError::Configuration(format!("address {} has no /p2p/ component", addr))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_from_addr() {
        let peer = PeerId::random();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{peer}").parse().unwrap();
        assert_eq!(peer_id_from_addr(&addr).unwrap(), peer);

        let bare: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        let err = peer_id_from_addr(&bare).unwrap_err();
        assert_eq!(err.kind(), obscurefs_core::ErrorKind::Config);
    }
}
