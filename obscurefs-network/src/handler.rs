//! Inbound side of the shard protocol

use crate::protocol::{ResponseFrame, WireRequest, MAX_SHARD_SIZE};
use crate::NodeContext;
use bytes::Bytes;
use libp2p::PeerId;
use obscurefs_core::ContentId;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

/// A request received from a peer, with the channel its response goes back on
#[derive(Debug)]
pub struct InboundRequest {
    pub peer: PeerId,
    pub request: WireRequest,
    pub reply: oneshot::Sender<ResponseFrame>,
}

/// Answers shard protocol requests from the node's local state
#[derive(Clone)]
pub struct PeerProtocolHandler {
    ctx: NodeContext,
}

impl PeerProtocolHandler {
    pub fn new(ctx: NodeContext) -> Self {
        Self { ctx }
    }

    /// Handle one request. Never fails: errors become `ERR` frames.
    #[instrument(skip(self, request), fields(command = request.command()))]
    pub async fn handle(&self, peer: PeerId, request: WireRequest) -> ResponseFrame {
        match request {
            WireRequest::ListFiles => self.list_files(),
            WireRequest::SendFile { key, value } => self.receive_shard(peer, key, value).await,
            WireRequest::GetShard(id) => self.serve_shard(peer, id).await,
        }
    }

    fn list_files(&self) -> ResponseFrame {
        match serde_json::to_vec(&self.ctx.store.list_files()) {
            Ok(json) => ResponseFrame::ok(json),
            Err(e) => {
                error!(error = %e, "Failed to serialize file list");
                ResponseFrame::error(e)
            }
        }
    }

    async fn receive_shard(&self, peer: PeerId, key: ContentId, value: Bytes) -> ResponseFrame {
        if value.len() > MAX_SHARD_SIZE {
            warn!(peer = %peer, shard_id = %key, size = value.len(), "Refusing oversized shard");
            return ResponseFrame::error(format!("shard exceeds {} bytes", MAX_SHARD_SIZE));
        }

        // Content-addressing: the key must be the hash of the bytes
        let computed = ContentId::from_data(&value);
        if computed != key {
            warn!(
                peer = %peer,
                expected = %key,
                computed = %computed,
                "Shard ID mismatch - data doesn't match claimed ID"
            );
            return ResponseFrame::error("shard id does not match data hash");
        }

        let path = match self.ctx.shards.write(&key, &value).await {
            Ok(path) => path,
            Err(e) => {
                error!(shard_id = %key, error = %e, "Failed to write shard");
                return ResponseFrame::error(e);
            }
        };
        self.ctx.store.store_file(key, path);

        if let Err(e) = self.ctx.directory.provide(&key).await {
            warn!(shard_id = %key, error = %e, "Failed to announce received shard");
        }

        info!(peer = %peer, shard_id = %key, size = value.len(), "Shard stored");
        ResponseFrame::ok(key.to_string())
    }

    async fn serve_shard(&self, peer: PeerId, id: ContentId) -> ResponseFrame {
        let path = match self.ctx.store.get_file(&id) {
            Ok(path) => path,
            Err(_) => {
                debug!(peer = %peer, shard_id = %id, "Requested shard not held");
                return ResponseFrame::not_found();
            }
        };

        match self.ctx.shards.read(&path).await {
            Ok(data) => {
                debug!(peer = %peer, shard_id = %id, size = data.len(), "Serving shard");
                ResponseFrame::ok(data)
            }
            Err(e) => {
                error!(shard_id = %id, path = %path.display(), error = %e, "Failed to read shard");
                ResponseFrame::error(e)
            }
        }
    }
}

/// Serve inbound requests until the channel closes, one task per request
pub async fn serve_inbound(
    handler: Arc<PeerProtocolHandler>,
    mut inbound: mpsc::Receiver<InboundRequest>,
) {
    while let Some(InboundRequest {
        peer,
        request,
        reply,
    }) = inbound.recv().await
    {
        let handler = handler.clone();
        tokio::spawn(async move {
            let response = handler.handle(peer, request).await;
            if reply.send(response).is_err() {
                debug!(peer = %peer, "Requester went away before the response was sent");
            }
        });
    }
    debug!("Inbound request channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use crate::protocol::ResponseStatus;
    use obscurefs_storage::{ContentStore, ShardDir};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn handler(dir: &TempDir) -> (PeerProtocolHandler, NodeContext) {
        let network = MemoryNetwork::new();
        let directory = network.join();
        let ctx = NodeContext::new(
            directory,
            Arc::new(ContentStore::new()),
            ShardDir::new(dir.path().join("uploads")),
        );
        (PeerProtocolHandler::new(ctx.clone()), ctx)
    }

    #[tokio::test]
    async fn test_send_file_then_get() {
        let dir = TempDir::new().unwrap();
        let (handler, ctx) = handler(&dir);
        let peer = PeerId::random();
        let data = Bytes::from_static(b"pushed shard");
        let key = ContentId::from_data(&data);

        let ack = handler
            .handle(
                peer,
                WireRequest::SendFile {
                    key,
                    value: data.clone(),
                },
            )
            .await;
        assert!(ack.is_ok());
        assert_eq!(ack.body, Bytes::from(key.to_string()));
        assert!(ctx.store.contains_file(&key));

        let fetched = handler.handle(peer, WireRequest::GetShard(key)).await;
        assert_eq!(fetched, ResponseFrame::ok(data));

        // the receiver announced itself as provider
        let providers = ctx.directory.find_providers(&key, 10).await.unwrap();
        assert_eq!(providers, vec![ctx.local_peer_id()]);
    }

    #[tokio::test]
    async fn test_send_file_hash_mismatch() {
        let dir = TempDir::new().unwrap();
        let (handler, ctx) = handler(&dir);
        let key = ContentId::from_data(b"claimed");

        let response = handler
            .handle(
                PeerId::random(),
                WireRequest::SendFile {
                    key,
                    value: Bytes::from_static(b"actual"),
                },
            )
            .await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(ctx.store.file_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_shard_refused() {
        let dir = TempDir::new().unwrap();
        let (handler, ctx) = handler(&dir);
        let value = Bytes::from(vec![7u8; MAX_SHARD_SIZE + 1]);
        let key = ContentId::from_data(&value);

        let response = handler
            .handle(PeerId::random(), WireRequest::SendFile { key, value })
            .await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert!(!ctx.store.contains_file(&key));
        assert!(ctx.directory.find_providers(&key, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_and_empty_shards() {
        let dir = TempDir::new().unwrap();
        let (handler, _) = handler(&dir);
        let peer = PeerId::random();

        let missing = handler
            .handle(peer, WireRequest::GetShard(ContentId::from_data(b"nope")))
            .await;
        assert_eq!(missing.status, ResponseStatus::NotFound);

        let empty_key = ContentId::from_data(b"");
        handler
            .handle(
                peer,
                WireRequest::SendFile {
                    key: empty_key,
                    value: Bytes::new(),
                },
            )
            .await;
        let empty = handler.handle(peer, WireRequest::GetShard(empty_key)).await;
        assert_eq!(empty.status, ResponseStatus::Ok);
        assert!(empty.body.is_empty());
    }

    #[tokio::test]
    async fn test_list_files_json() {
        let dir = TempDir::new().unwrap();
        let (handler, ctx) = handler(&dir);
        let id = ContentId::from_data(b"listed");
        ctx.store.store_file(id, "uploads/listed");

        let response = handler.handle(PeerId::random(), WireRequest::ListFiles).await;
        let files: HashMap<ContentId, PathBuf> = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(files.get(&id), Some(&PathBuf::from("uploads/listed")));
    }

    #[tokio::test]
    async fn test_unreadable_shard_is_error() {
        let dir = TempDir::new().unwrap();
        let (handler, ctx) = handler(&dir);
        let id = ContentId::from_data(b"gone");
        ctx.store.store_file(id, dir.path().join("deleted"));

        let response = handler.handle(PeerId::random(), WireRequest::GetShard(id)).await;
        assert_eq!(response.status, ResponseStatus::Error);
    }

    #[tokio::test]
    async fn test_serve_inbound_replies() {
        let dir = TempDir::new().unwrap();
        let (handler, _) = handler(&dir);
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(serve_inbound(Arc::new(handler), rx));

        let (reply, response) = oneshot::channel();
        tx.send(InboundRequest {
            peer: PeerId::random(),
            request: WireRequest::ListFiles,
            reply,
        })
        .await
        .unwrap();
        assert!(response.await.unwrap().is_ok());
    }
}
