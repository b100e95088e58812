//! Error types for ObscureFS
//!
//! One error enum for every library crate in the workspace. Callers that only
//! care about the broad failure class use [`ObscureFsError::kind`].

use std::fmt;
use thiserror::Error;

/// Result type alias for ObscureFS operations
pub type Result<T> = std::result::Result<T, ObscureFsError>;

/// Unified error type for ObscureFS
#[derive(Error, Debug)]
pub enum ObscureFsError {
    // ===== Erasure Coding Errors =====
    #[error("Erasure coding error: {0}")]
    ErasureCoding(String),

    #[error("Insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Invalid shard index: {index} (max: {max})")]
    InvalidShardIndex { index: usize, max: usize },

    // ===== Content Errors =====
    #[error("Invalid content ID: {0}")]
    InvalidContentId(String),

    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    #[error("Metadata not found for checksum {0}")]
    MetadataNotFound(String),

    #[error("No providers found for shard {0}")]
    NoProviders(String),

    // ===== Storage Errors =====
    #[error("Storage error: {0}")]
    Storage(String),

    // ===== Network Errors =====
    #[error("Network error: {0}")]
    Network(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Protocol error: {0}")]
    Protocol(String),

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse failure classes reported to callers of the upload/download pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    NotFound,
    Integrity,
    Io,
    Protocol,
    Network,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Config => "config",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Io => "io",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Network => "network",
        };
        f.write_str(name)
    }
}

impl ObscureFsError {
    /// Map this error onto its failure class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ObscureFsError::Configuration(_) => ErrorKind::Config,

            ObscureFsError::ShardNotFound(_)
            | ObscureFsError::MetadataNotFound(_)
            | ObscureFsError::NoProviders(_)
            | ObscureFsError::PeerNotFound(_) => ErrorKind::NotFound,

            ObscureFsError::ErasureCoding(_)
            | ObscureFsError::InsufficientShards { .. }
            | ObscureFsError::Integrity(_)
            | ObscureFsError::InvalidShardIndex { .. } => ErrorKind::Integrity,

            ObscureFsError::Io(_)
            | ObscureFsError::Storage(_)
            | ObscureFsError::Internal(_) => ErrorKind::Io,

            ObscureFsError::InvalidContentId(_)
            | ObscureFsError::Protocol(_)
            | ObscureFsError::Serialization(_) => ErrorKind::Protocol,

            ObscureFsError::Network(_)
            | ObscureFsError::Timeout(_)
            | ObscureFsError::Cancelled => ErrorKind::Network,
        }
    }

    /// True for the lookup misses (missing metadata, shard or provider).
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<reed_solomon_erasure::Error> for ObscureFsError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        match err {
            reed_solomon_erasure::Error::TooFewShardsPresent => ObscureFsError::Integrity(
                "too few shards present to reconstruct".to_string(),
            ),
            other => ObscureFsError::ErasureCoding(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ObscureFsError {
    fn from(err: serde_json::Error) -> Self {
        ObscureFsError::Serialization(err.to_string())
    }
}
