//! libp2p NetworkBehaviour implementation
//!
//! Combines multiple protocols into a single behaviour:
//! - Kademlia for peer routing and shard provider records
//! - Identify for peer info exchange
//! - Ping for liveness checking
//! - Request-response carrying the shard protocol

use crate::codec::ShardCodec;
use crate::protocol::{ResponseFrame, WireRequest, SHARD_PROTOCOL};
use libp2p::{
    identify, kad, kad::store::MemoryStore, ping,
    request_response::{self, ProtocolSupport},
    swarm::NetworkBehaviour,
    Multiaddr, PeerId, StreamProtocol,
};
use std::time::Duration;
use tracing::{debug, info};

/// Protocol name for the ObscureFS Kademlia DHT
pub const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/obscurefs/kad/1.0.0");

/// Protocol name for ObscureFS Identify
pub const IDENTIFY_PROTOCOL: &str = "/obscurefs/id/1.0.0";

/// Agent version string
pub const AGENT_VERSION: &str = concat!("obscurefs/", env!("CARGO_PKG_VERSION"));

/// Combined network behaviour for ObscureFS nodes
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "NodeEvent")]
pub struct ObscureBehaviour {
    /// Kademlia DHT for peer routing and provider records
    pub kademlia: kad::Behaviour<MemoryStore>,
    /// Identify protocol for exchanging peer info
    pub identify: identify::Behaviour,
    /// Ping protocol for liveness checking
    pub ping: ping::Behaviour,
    /// Shard protocol
    pub shard_transfer: request_response::Behaviour<ShardCodec>,
}

/// Events emitted by the ObscureFS behaviour
#[derive(Debug)]
pub enum NodeEvent {
    /// Kademlia event
    Kademlia(kad::Event),
    /// Identify info received from a peer
    IdentifyReceived {
        peer_id: PeerId,
        info: identify::Info,
    },
    /// Identify exchange failed
    IdentifyFailed { peer_id: PeerId },
    /// Ping result
    Ping {
        peer_id: PeerId,
        rtt: Option<Duration>,
    },
    /// Shard protocol event
    ShardTransfer(ShardTransferEvent),
    /// Events the node does not act on
    Ignored,
}

/// Events from the shard protocol
pub type ShardTransferEvent = request_response::Event<WireRequest, ResponseFrame>;

impl From<kad::Event> for NodeEvent {
    fn from(event: kad::Event) -> Self {
        if let kad::Event::RoutingUpdated { peer, .. } = &event {
            debug!(peer = %peer, "Kademlia routing updated");
        }
        NodeEvent::Kademlia(event)
    }
}

impl From<identify::Event> for NodeEvent {
    fn from(event: identify::Event) -> Self {
        match event {
            identify::Event::Received { peer_id, info } => {
                debug!(
                    peer = %peer_id,
                    agent = %info.agent_version,
                    "Identify info received"
                );
                NodeEvent::IdentifyReceived { peer_id, info }
            }
            identify::Event::Error { peer_id, error } => {
                debug!(peer = %peer_id, error = %error, "Identify error");
                NodeEvent::IdentifyFailed { peer_id }
            }
            identify::Event::Sent { .. } | identify::Event::Pushed { .. } => NodeEvent::Ignored,
        }
    }
}

impl From<ping::Event> for NodeEvent {
    fn from(event: ping::Event) -> Self {
        match event.result {
            Ok(rtt) => NodeEvent::Ping {
                peer_id: event.peer,
                rtt: Some(rtt),
            },
            Err(e) => {
                debug!(peer = %event.peer, error = %e, "Ping failed");
                NodeEvent::Ping {
                    peer_id: event.peer,
                    rtt: None,
                }
            }
        }
    }
}

impl From<ShardTransferEvent> for NodeEvent {
    fn from(event: ShardTransferEvent) -> Self {
        NodeEvent::ShardTransfer(event)
    }
}

/// Configuration for the ObscureFS behaviour
#[derive(Debug, Clone)]
pub struct BehaviourConfig {
    /// Local peer ID
    pub local_peer_id: PeerId,
    /// Local public key (for identify protocol)
    pub local_public_key: libp2p::identity::PublicKey,
    /// Ping interval
    pub ping_interval: Duration,
    /// Ping timeout
    pub ping_timeout: Duration,
    /// Kademlia query timeout
    pub kademlia_query_timeout: Duration,
    /// Shard protocol request timeout
    pub request_timeout: Duration,
}

impl BehaviourConfig {
    /// Create a new config from a keypair
    pub fn from_keypair(keypair: &libp2p::identity::Keypair) -> Self {
        Self {
            local_peer_id: keypair.public().to_peer_id(),
            local_public_key: keypair.public(),
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            kademlia_query_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Set ping interval
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set shard protocol request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl ObscureBehaviour {
    /// Create a new ObscureFS behaviour
    pub fn new(config: BehaviourConfig) -> Self {
        let store = MemoryStore::new(config.local_peer_id);
        let mut kad_config = kad::Config::default();
        kad_config.set_query_timeout(config.kademlia_query_timeout);
        kad_config.set_protocol_names(vec![KAD_PROTOCOL]);

        let mut kademlia = kad::Behaviour::with_config(config.local_peer_id, store, kad_config);
        // Serve DHT queries even before an external address is confirmed
        kademlia.set_mode(Some(kad::Mode::Server));

        let identify_config = identify::Config::new(
            IDENTIFY_PROTOCOL.to_string(),
            config.local_public_key.clone(),
        )
        .with_agent_version(AGENT_VERSION.to_string());
        let identify = identify::Behaviour::new(identify_config);

        let ping_config = ping::Config::new()
            .with_interval(config.ping_interval)
            .with_timeout(config.ping_timeout);
        let ping = ping::Behaviour::new(ping_config);

        let shard_transfer = request_response::Behaviour::new(
            [(SHARD_PROTOCOL, ProtocolSupport::Full)],
            request_response::Config::default().with_request_timeout(config.request_timeout),
        );

        info!(
            peer_id = %config.local_peer_id,
            request_timeout = ?config.request_timeout,
            "ObscureFS behaviour initialized"
        );

        Self {
            kademlia,
            identify,
            ping,
            shard_transfer,
        }
    }

    /// Add a known address for a peer to Kademlia
    pub fn add_address(&mut self, peer_id: &PeerId, addr: Multiaddr) {
        self.kademlia.add_address(peer_id, addr);
        debug!(peer = %peer_id, "Added peer address to Kademlia");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    #[test]
    fn test_behaviour_creation() {
        let keypair = Keypair::generate_ed25519();
        let config = BehaviourConfig::from_keypair(&keypair);
        let behaviour = ObscureBehaviour::new(config);

        assert!(behaviour.kademlia.iter_queries().next().is_none());
        assert_eq!(behaviour.kademlia.protocol_names(), &[KAD_PROTOCOL]);
    }

    #[test]
    fn test_config_builder() {
        let keypair = Keypair::generate_ed25519();

        let config = BehaviourConfig::from_keypair(&keypair)
            .with_ping_interval(Duration::from_secs(60))
            .with_request_timeout(Duration::from_secs(5));

        assert_eq!(config.ping_interval, Duration::from_secs(60));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.local_peer_id, keypair.public().to_peer_id());
    }
}
