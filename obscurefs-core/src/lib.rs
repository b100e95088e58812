//! ObscureFS Core Library
//!
//! Shared building blocks for the ObscureFS peer-to-peer file store:
//! - Reed-Solomon erasure coding over GF(2^8) with content-addressed shards
//! - Blake3 content identifiers rendered as base58
//! - File metadata describing how a file was sharded
//! - Common error type and the error taxonomy surfaced to callers

pub mod content;
pub mod erasure;
pub mod error;
pub mod metadata;

pub use content::ContentId;
pub use erasure::{ErasureCodec, ErasureConfig};
pub use error::{ErrorKind, ObscureFsError, Result};
pub use metadata::Metadata;

/// Default erasure coding configuration
/// - 4 data shards: minimum required to reconstruct
/// - 2 parity shards: any 2 shards may be lost or corrupted
///
/// Nodes override these through their config file or environment.
pub const DATA_SHARDS: usize = 4;
pub const PARITY_SHARDS: usize = 2;

/// Upper bound on data + parity shards for GF(2^8) Reed-Solomon.
pub const MAX_TOTAL_SHARDS: usize = 256;

