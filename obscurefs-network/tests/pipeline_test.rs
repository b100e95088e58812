//! Upload, distribute and retrieve across an in-process network

use bytes::Bytes;
use libp2p::PeerId;
use obscurefs_core::{ContentId, ErasureCodec, ErasureConfig, ErrorKind, Metadata};
use obscurefs_network::{
    serve_inbound, DistributionManager, MemoryDirectory, MemoryNetwork, NodeContext, PeerDirectory,
    PeerProtocolHandler, PeerSelector, PlacementConfig, RetrievalConfig, RetrievalManager,
    WireRequest,
};
use obscurefs_storage::{ContentStore, ShardDir};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct TestNode {
    directory: Arc<MemoryDirectory>,
    ctx: NodeContext,
    _handler: Arc<PeerProtocolHandler>,
}

impl TestNode {
    fn spawn(network: &Arc<MemoryNetwork>, root: &TempDir) -> Self {
        let directory = network.join();
        let ctx = NodeContext::new(
            directory.clone(),
            Arc::new(ContentStore::new()),
            ShardDir::new(root.path().join(directory.local_peer_id().to_string())),
        );
        let handler = Arc::new(PeerProtocolHandler::new(ctx.clone()));
        directory.attach(&handler);
        Self {
            directory,
            ctx,
            _handler: handler,
        }
    }

    fn peer_id(&self) -> PeerId {
        self.directory.local_peer_id()
    }
}

/// Starts each shard at the next candidate so shards land on distinct peers
#[derive(Default)]
struct RoundRobin(AtomicUsize);

impl PeerSelector for RoundRobin {
    fn select_peers(&self, _: &ContentId, candidates: &[PeerId], k: usize) -> Vec<PeerId> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let start = self.0.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates
            .iter()
            .cycle()
            .skip(start)
            .take(k.min(candidates.len()))
            .copied()
            .collect()
    }
}

fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

async fn upload(
    node: &TestNode,
    codec: &ErasureCodec,
    name: &str,
    data: &[u8],
) -> (Metadata, HashMap<ContentId, Bytes>) {
    let mut metadata = Metadata::for_data(name, data);
    let shards = codec.encode(&mut metadata, data).unwrap();

    let manager = DistributionManager::new(node.ctx.clone(), PlacementConfig::default())
        .with_selector(Arc::new(RoundRobin::default()));
    let report = manager.share_file_to_peers(&shards).await;
    assert!(report.is_complete(), "failed shards: {:?}", report.failed);
    manager.share_metadata(metadata.clone());

    (metadata, shards)
}

#[tokio::test]
async fn test_upload_then_retrieve_with_two_nodes_down() {
    let root = TempDir::new().unwrap();
    let network = MemoryNetwork::new();
    let uploader = TestNode::spawn(&network, &root);
    let peers: Vec<TestNode> = (0..6).map(|_| TestNode::spawn(&network, &root)).collect();

    let codec = ErasureCodec::new(ErasureConfig::default())
        .unwrap()
        .with_output_dir(root.path().join("decoded"));
    let data = sample_data(300_000);
    let (metadata, _) = upload(&uploader, &codec, "report.bin", &data).await;

    // One shard per peer; take down two holders
    let holders: Vec<&TestNode> = peers.iter().filter(|p| p.ctx.store.file_count() > 0).collect();
    assert_eq!(holders.len(), 6);
    for holder in holders.iter().take(2) {
        network.set_online(holder.peer_id(), false);
    }

    let retrieval = RetrievalManager::new(
        uploader.ctx.clone(),
        Arc::new(codec),
        RetrievalConfig::default().with_fetch_timeout(Duration::from_secs(5)),
    );
    let output = root.path().join("out").join("report.bin");
    let written = retrieval
        .retrieve_file(&metadata.checksum, &output, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(written, output);
    let restored = tokio::fs::read(&output).await.unwrap();
    assert_eq!(restored, data);
    assert!(metadata.checksum.matches(&restored));
}

#[tokio::test]
async fn test_list_files_reports_received_shards() {
    let root = TempDir::new().unwrap();
    let network = MemoryNetwork::new();
    let uploader = TestNode::spawn(&network, &root);
    let holder = TestNode::spawn(&network, &root);

    let codec = ErasureCodec::new(ErasureConfig::new(2, 1).unwrap()).unwrap();
    let (_, shards) = upload(&uploader, &codec, "small.txt", b"hello shards").await;

    let frame = uploader
        .directory
        .request(holder.peer_id(), WireRequest::ListFiles)
        .await
        .unwrap();
    let listing: HashMap<ContentId, PathBuf> =
        serde_json::from_slice(&frame.into_body().unwrap()).unwrap();

    assert_eq!(listing.len(), shards.len());
    for (id, path) in listing {
        assert!(shards.contains_key(&id));
        assert_eq!(path, holder.ctx.shards.path_for(&id));
    }
}

#[tokio::test]
async fn test_retrieval_fails_once_parity_is_exhausted() {
    let root = TempDir::new().unwrap();
    let network = MemoryNetwork::new();
    let uploader = TestNode::spawn(&network, &root);
    let peers: Vec<TestNode> = (0..6).map(|_| TestNode::spawn(&network, &root)).collect();

    let codec = ErasureCodec::new(ErasureConfig::default())
        .unwrap()
        .with_output_dir(root.path().join("decoded"));
    let data = sample_data(64 * 1024);
    let (metadata, _) = upload(&uploader, &codec, "lost.bin", &data).await;

    // Losing three of six single-shard holders leaves fewer than four shards
    let holders: Vec<&TestNode> = peers.iter().filter(|p| p.ctx.store.file_count() > 0).collect();
    assert_eq!(holders.len(), 6);
    for holder in holders.iter().take(3) {
        network.set_online(holder.peer_id(), false);
    }

    let retrieval = RetrievalManager::new(
        uploader.ctx.clone(),
        Arc::new(codec),
        RetrievalConfig::default().with_fetch_timeout(Duration::from_secs(5)),
    );
    let result = retrieval
        .retrieve_file(
            &metadata.checksum,
            &root.path().join("never.bin"),
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(result.unwrap_err().kind(), ErrorKind::Integrity);
}

#[tokio::test]
async fn test_swarm_style_inbound_loop_serves_requests() {
    let root = TempDir::new().unwrap();
    let network = MemoryNetwork::new();
    let node = TestNode::spawn(&network, &root);
    let handler = Arc::new(PeerProtocolHandler::new(node.ctx.clone()));

    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let server = tokio::spawn(serve_inbound(handler, rx));

    let data = Bytes::from_static(b"pushed over the inbound channel");
    let key = ContentId::from_data(&data);
    let (reply, response) = tokio::sync::oneshot::channel();
    tx.send(obscurefs_network::InboundRequest {
        peer: PeerId::random(),
        request: WireRequest::SendFile {
            key,
            value: data.clone(),
        },
        reply,
    })
    .await
    .unwrap();

    let frame = response.await.unwrap();
    assert_eq!(frame.into_body().unwrap(), Bytes::from(key.to_string()));
    assert!(node.ctx.store.contains_file(&key));
    assert_eq!(network.providers_of(&key), vec![node.peer_id()]);

    drop(tx);
    server.await.unwrap();
}
