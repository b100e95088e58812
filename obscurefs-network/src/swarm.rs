//! libp2p-backed peer directory
//!
//! The swarm is owned by a single driver task. [`SwarmDirectory`] handles talk
//! to it over a command channel and wait on one-shot replies; inbound shard
//! protocol requests leave the driver on a separate channel and their
//! responses come back through one-shot channels polled by the driver.

use crate::behavior::{BehaviourConfig, NodeEvent, ObscureBehaviour, ShardTransferEvent};
use crate::directory::{peer_id_from_addr, PeerDirectory, PeerRecord};
use crate::handler::InboundRequest;
use crate::protocol::{ResponseFrame, WireRequest};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use libp2p::multiaddr::Protocol;
use libp2p::request_response::{self, OutboundRequestId, ResponseChannel};
use libp2p::swarm::SwarmEvent;
use libp2p::{identity::Keypair, kad, noise, tcp, yamux, Multiaddr, PeerId, Swarm};
use obscurefs_core::error::{ObscureFsError, Result};
use obscurefs_core::ContentId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration for the libp2p swarm
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Listen addresses for libp2p
    pub listen_addrs: Vec<Multiaddr>,
    /// Shard protocol request timeout
    pub request_timeout: Duration,
    /// Close connections idle for this long
    pub idle_connection_timeout: Duration,
    /// Capacity of the command and inbound request channels
    pub channel_capacity: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            listen_addrs: listen_addrs_for_port(4001),
            request_timeout: Duration::from_secs(30),
            idle_connection_timeout: Duration::from_secs(60),
            channel_capacity: 256,
        }
    }
}

impl SwarmConfig {
    /// Listen on TCP and QUIC on all interfaces. Port 0 picks a free port.
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_addrs = listen_addrs_for_port(port);
        self
    }

    pub fn with_listen_addrs(mut self, addrs: Vec<Multiaddr>) -> Self {
        self.listen_addrs = addrs;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

fn listen_addrs_for_port(port: u16) -> Vec<Multiaddr> {
    let any = Multiaddr::empty().with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED));
    vec![
        any.clone().with(Protocol::Tcp(port)),
        any.with(Protocol::Udp(port)).with(Protocol::QuicV1),
    ]
}

enum Command {
    Provide {
        key: kad::RecordKey,
        reply: oneshot::Sender<Result<()>>,
    },
    FindProviders {
        key: kad::RecordKey,
        limit: usize,
        reply: oneshot::Sender<Result<Vec<PeerId>>>,
    },
    FindPeer {
        peer: PeerId,
        reply: oneshot::Sender<Result<PeerRecord>>,
    },
    Dial {
        peer: PeerId,
        addr: Multiaddr,
        reply: oneshot::Sender<Result<PeerId>>,
    },
    Request {
        peer: PeerId,
        request: WireRequest,
        reply: oneshot::Sender<Result<ResponseFrame>>,
    },
}

/// Handle to a running swarm
#[derive(Clone)]
pub struct SwarmDirectory {
    local_peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    peers: Arc<RwLock<HashMap<PeerId, PeerRecord>>>,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
}

impl SwarmDirectory {
    /// Build the swarm, start listening and spawn its driver task.
    ///
    /// Returns the directory handle, the stream of inbound shard protocol
    /// requests and the driver's join handle. The driver stops once every
    /// directory handle is dropped.
    pub fn spawn(
        keypair: Keypair,
        config: SwarmConfig,
    ) -> Result<(Self, mpsc::Receiver<InboundRequest>, JoinHandle<()>)> {
        let local_peer_id = keypair.public().to_peer_id();
        let mut swarm = build_swarm(keypair, &config)?;

        let mut listening = 0;
        for addr in &config.listen_addrs {
            match swarm.listen_on(addr.clone()) {
                Ok(_) => {
                    info!(addr = %addr, "Listening on address");
                    listening += 1;
                }
                Err(e) => error!(addr = %addr, error = %e, "Failed to listen on address"),
            }
        }
        if listening == 0 {
            return Err(ObscureFsError::Network(
                "could not listen on any configured address".to_string(),
            ));
        }

        let (command_tx, command_rx) = mpsc::channel(config.channel_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity);
        let peers = Arc::new(RwLock::new(HashMap::new()));
        let listen_addrs = Arc::new(RwLock::new(Vec::new()));

        let driver = SwarmDriver {
            swarm,
            local_peer_id,
            commands: command_rx,
            inbound: inbound_tx,
            peers: peers.clone(),
            listen_addrs: listen_addrs.clone(),
            pending_dials: HashMap::new(),
            pending_providers: HashMap::new(),
            pending_find_peer: HashMap::new(),
            pending_requests: HashMap::new(),
            pending_responses: FuturesUnordered::new(),
        };
        let handle = tokio::spawn(driver.run());

        info!(peer_id = %local_peer_id, "Swarm started");

        Ok((
            Self {
                local_peer_id,
                commands: command_tx,
                peers,
                listen_addrs,
            },
            inbound_rx,
            handle,
        ))
    }

    /// Addresses the swarm is listening on, each ending in `/p2p/<local-peer-id>`
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs
            .read()
            .iter()
            .map(|a| a.clone().with(Protocol::P2p(self.local_peer_id)))
            .collect()
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| ObscureFsError::Network("swarm driver has stopped".to_string()))?;
        rx.await
            .map_err(|_| ObscureFsError::Network("swarm driver dropped the request".to_string()))?
    }
}

#[async_trait]
impl PeerDirectory for SwarmDirectory {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn known_peers(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .keys()
            .filter(|p| **p != self.local_peer_id)
            .copied()
            .collect()
    }

    async fn find_peer(&self, peer: PeerId) -> Result<PeerRecord> {
        let known = self.peers.read().get(&peer).cloned();
        match known {
            Some(record) => Ok(record),
            None => self.call(|reply| Command::FindPeer { peer, reply }).await,
        }
    }

    async fn provide(&self, key: &ContentId) -> Result<()> {
        let key = kad::RecordKey::new(key.as_bytes());
        self.call(|reply| Command::Provide { key, reply }).await
    }

    async fn find_providers(&self, key: &ContentId, limit: usize) -> Result<Vec<PeerId>> {
        let key = kad::RecordKey::new(key.as_bytes());
        self.call(|reply| Command::FindProviders { key, limit, reply })
            .await
    }

    async fn connect(&self, addr: Multiaddr) -> Result<PeerId> {
        let peer = peer_id_from_addr(&addr)?;
        if peer == self.local_peer_id {
            return Err(ObscureFsError::Configuration(format!(
                "refusing to dial our own address {}",
                addr
            )));
        }
        self.call(|reply| Command::Dial { peer, addr, reply }).await
    }

    async fn request(&self, peer: PeerId, request: WireRequest) -> Result<ResponseFrame> {
        self.call(|reply| Command::Request {
            peer,
            request,
            reply,
        })
        .await
    }
}

/// Build and return the libp2p swarm
fn build_swarm(keypair: Keypair, config: &SwarmConfig) -> Result<Swarm<ObscureBehaviour>> {
    let behaviour_config =
        BehaviourConfig::from_keypair(&keypair).with_request_timeout(config.request_timeout);
    let idle_timeout = config.idle_connection_timeout;

    let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| ObscureFsError::Network(format!("tcp transport: {}", e)))?
        .with_quic()
        .with_behaviour(|_key| Ok(ObscureBehaviour::new(behaviour_config.clone())))
        .map_err(|e| ObscureFsError::Network(format!("behaviour: {}", e)))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(idle_timeout))
        .build();

    Ok(swarm)
}

struct ProviderQuery {
    limit: usize,
    found: Vec<PeerId>,
    reply: oneshot::Sender<Result<Vec<PeerId>>>,
}

type PendingResponse = BoxFuture<'static, (ResponseChannel<ResponseFrame>, Option<ResponseFrame>)>;

struct SwarmDriver {
    swarm: Swarm<ObscureBehaviour>,
    local_peer_id: PeerId,
    commands: mpsc::Receiver<Command>,
    inbound: mpsc::Sender<InboundRequest>,
    peers: Arc<RwLock<HashMap<PeerId, PeerRecord>>>,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<PeerId>>>>,
    pending_providers: HashMap<kad::QueryId, ProviderQuery>,
    pending_find_peer: HashMap<kad::QueryId, (PeerId, oneshot::Sender<Result<PeerRecord>>)>,
    pending_requests: HashMap<OutboundRequestId, oneshot::Sender<Result<ResponseFrame>>>,
    pending_responses: FuturesUnordered<PendingResponse>,
}

impl SwarmDriver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("All directory handles dropped, stopping swarm");
                        break;
                    }
                },
                Some((channel, response)) = self.pending_responses.next(),
                    if !self.pending_responses.is_empty() =>
                {
                    self.send_response(channel, response);
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Provide { key, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .start_providing(key)
                    .map(|query_id| debug!(?query_id, "Publishing provider record"))
                    .map_err(|e| ObscureFsError::Network(format!("provider record: {:?}", e)));
                let _ = reply.send(result);
            }
            Command::FindProviders { key, limit, reply } => {
                let query_id = self.swarm.behaviour_mut().kademlia.get_providers(key);
                self.pending_providers.insert(
                    query_id,
                    ProviderQuery {
                        limit: limit.max(1),
                        found: Vec::new(),
                        reply,
                    },
                );
            }
            Command::FindPeer { peer, reply } => {
                let query_id = self.swarm.behaviour_mut().kademlia.get_closest_peers(peer);
                self.pending_find_peer.insert(query_id, (peer, reply));
            }
            Command::Dial { peer, addr, reply } => {
                if self.swarm.is_connected(&peer) {
                    let _ = reply.send(Ok(peer));
                    return;
                }
                self.swarm.behaviour_mut().add_address(&peer, addr.clone());
                match self.swarm.dial(addr.clone()) {
                    Ok(()) => {
                        debug!(peer = %peer, addr = %addr, "Dialing peer");
                        self.pending_dials.entry(peer).or_default().push(reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(ObscureFsError::Network(format!(
                            "failed to dial {}: {}",
                            addr, e
                        ))));
                    }
                }
            }
            Command::Request {
                peer,
                request,
                reply,
            } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .shard_transfer
                    .send_request(&peer, request);
                self.pending_requests.insert(request_id, reply);
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<NodeEvent>) {
        match event {
            SwarmEvent::Behaviour(NodeEvent::Kademlia(event)) => {
                self.handle_kademlia_event(event)
            }
            SwarmEvent::Behaviour(NodeEvent::ShardTransfer(event)) => {
                self.handle_transfer_event(event)
            }
            SwarmEvent::Behaviour(NodeEvent::IdentifyReceived { peer_id, info }) => {
                if peer_id == self.local_peer_id {
                    return;
                }
                for addr in &info.listen_addrs {
                    self.swarm.behaviour_mut().add_address(&peer_id, addr.clone());
                }
                let mut peers = self.peers.write();
                let record = peers.entry(peer_id).or_insert_with(|| PeerRecord::new(peer_id));
                record.addresses = info.listen_addrs;
                debug!(peer = %peer_id, "Updated peer info from identify");
            }
            SwarmEvent::Behaviour(NodeEvent::IdentifyFailed { .. })
            | SwarmEvent::Behaviour(NodeEvent::Ping { .. })
            | SwarmEvent::Behaviour(NodeEvent::Ignored) => {}
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "New listen address");
                self.listen_addrs.write().push(address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                debug!(peer = %peer_id, "Connection established");
                {
                    let mut peers = self.peers.write();
                    let record = peers.entry(peer_id).or_insert_with(|| PeerRecord::new(peer_id));
                    let addr = endpoint.get_remote_address().clone();
                    if !record.addresses.contains(&addr) {
                        record.addresses.push(addr);
                    }
                }
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(peer_id));
                    }
                    if let Err(e) = self.swarm.behaviour_mut().kademlia.bootstrap() {
                        debug!(error = ?e, "Kademlia bootstrap skipped");
                    }
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                debug!(peer = %peer_id, "Connection closed");
                if num_established == 0 {
                    self.peers.write().remove(&peer_id);
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                warn!(peer = %peer_id, error = %error, "Outgoing connection failed");
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Err(ObscureFsError::Network(format!(
                            "failed to connect to {}: {}",
                            peer_id, error
                        ))));
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_kademlia_event(&mut self, event: kad::Event) {
        let kad::Event::OutboundQueryProgressed {
            id, result, step, ..
        } = event
        else {
            return;
        };

        match result {
            kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                providers,
                ..
            })) => {
                let Some(query) = self.pending_providers.get_mut(&id) else {
                    return;
                };
                for peer in providers {
                    if !query.found.contains(&peer) {
                        query.found.push(peer);
                    }
                }
                if query.found.len() >= query.limit {
                    if let Some(mut running) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                        running.finish();
                    }
                    self.finish_provider_query(id);
                } else if step.last {
                    self.finish_provider_query(id);
                }
            }
            kad::QueryResult::GetProviders(Ok(
                kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
            )) => self.finish_provider_query(id),
            kad::QueryResult::GetProviders(Err(e)) => {
                debug!(error = %e, "Provider query ended with error");
                self.finish_provider_query(id);
            }
            kad::QueryResult::StartProviding(Ok(kad::AddProviderOk { key })) => {
                debug!(key = ?key, "Provider record published");
            }
            kad::QueryResult::StartProviding(Err(e)) => {
                debug!(error = %e, "Provider record only stored locally");
            }
            kad::QueryResult::GetClosestPeers(result) => {
                let peers = match result {
                    Ok(ok) => ok.peers,
                    Err(kad::GetClosestPeersError::Timeout { peers, .. }) => peers,
                };
                if let Some((target, reply)) = self.pending_find_peer.remove(&id) {
                    let outcome = if peers.contains(&target) {
                        Ok(self
                            .peers
                            .read()
                            .get(&target)
                            .cloned()
                            .unwrap_or_else(|| PeerRecord::new(target)))
                    } else {
                        Err(ObscureFsError::PeerNotFound(target.to_string()))
                    };
                    let _ = reply.send(outcome);
                }
            }
            kad::QueryResult::Bootstrap(result) => {
                debug!(?result, "Kademlia bootstrap progressed");
            }
            _ => {}
        }
    }

    fn finish_provider_query(&mut self, id: kad::QueryId) {
        if let Some(query) = self.pending_providers.remove(&id) {
            let mut found = query.found;
            found.truncate(query.limit);
            debug!(providers = found.len(), "Provider query finished");
            let _ = query.reply.send(Ok(found));
        }
    }

    fn handle_transfer_event(&mut self, event: ShardTransferEvent) {
        match event {
            request_response::Event::Message { peer, message } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    let (reply, response) = oneshot::channel();
                    let inbound = InboundRequest {
                        peer,
                        request,
                        reply,
                    };
                    if let Err(e) = self.inbound.try_send(inbound) {
                        warn!(peer = %peer, error = %e, "Dropping inbound request");
                        self.send_response(channel, Some(ResponseFrame::error("node busy")));
                        return;
                    }
                    self.pending_responses
                        .push(Box::pin(async move { (channel, response.await.ok()) }));
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(reply) = self.pending_requests.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
            } => {
                warn!(peer = %peer, error = %error, "Shard request failed");
                if let Some(reply) = self.pending_requests.remove(&request_id) {
                    let _ = reply.send(Err(ObscureFsError::Network(format!(
                        "request to {} failed: {}",
                        peer, error
                    ))));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                warn!(peer = %peer, error = %error, "Inbound shard request failed");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn send_response(
        &mut self,
        channel: ResponseChannel<ResponseFrame>,
        response: Option<ResponseFrame>,
    ) {
        let frame = response.unwrap_or_else(|| ResponseFrame::error("request handler dropped"));
        if self
            .swarm
            .behaviour_mut()
            .shard_transfer
            .send_response(channel, frame)
            .is_err()
        {
            debug!("Connection closed before the response could be sent");
        }
    }
}
