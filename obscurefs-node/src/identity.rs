//! Persistent node identity

use libp2p::identity::Keypair;
use obscurefs_core::error::{ObscureFsError, Result};
use std::path::Path;
use tracing::info;

/// Load the keypair at `path`, or generate an Ed25519 keypair and save it there.
///
/// The file holds the protobuf encoding used by libp2p.
pub fn load_or_generate_keypair(path: &Path) -> Result<Keypair> {
    if path.exists() {
        let bytes = std::fs::read(path)?;
        let keypair = Keypair::from_protobuf_encoding(&bytes).map_err(|e| {
            ObscureFsError::Configuration(format!("bad identity key {}: {}", path.display(), e))
        })?;
        info!(
            peer_id = %keypair.public().to_peer_id(),
            path = %path.display(),
            "Loaded node identity"
        );
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    let encoded = keypair
        .to_protobuf_encoding()
        .map_err(|e| ObscureFsError::Internal(format!("encode identity key: {}", e)))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, encoded)?;
    info!(
        peer_id = %keypair.public().to_peer_id(),
        path = %path.display(),
        "Generated new node identity"
    );
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_identity_is_stable_across_restarts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("identity.key");

        let first = load_or_generate_keypair(&path).unwrap();
        let second = load_or_generate_keypair(&path).unwrap();
        assert_eq!(first.public().to_peer_id(), second.public().to_peer_id());
    }

    #[test]
    fn test_garbage_identity_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.key");
        std::fs::write(&path, b"not a key").unwrap();

        let err = load_or_generate_keypair(&path).unwrap_err();
        assert_eq!(err.kind(), obscurefs_core::ErrorKind::Config);
    }
}
