//! File metadata
//!
//! Describes how one original file was split: which erasure parameters were
//! used and the ordered list of shard identifiers. The order of `parts` is the
//! shard position used during reconstruction.

use crate::content::ContentId;
use serde::{Deserialize, Serialize};

/// Metadata for one erasure-coded file, keyed by `checksum` in the content store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Metadata {
    /// Original file name
    pub name: String,

    /// Content hash of the original file bytes
    pub checksum: ContentId,

    /// Number of data shards
    pub shards: usize,

    /// Number of parity shards
    pub parity: usize,

    /// Shard ids in position order (data shards first, then parity)
    #[serde(default)]
    pub parts: Vec<ContentId>,

    /// Length of the original file in bytes. Absent in snapshots that predate it,
    /// in which case decoding keeps the zero padding of the last data shard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl Metadata {
    /// Create metadata for a file before it has been encoded
    pub fn new(name: impl Into<String>, checksum: ContentId) -> Self {
        Self {
            name: name.into(),
            checksum,
            shards: 0,
            parity: 0,
            parts: Vec::new(),
            size: None,
        }
    }

    /// Create metadata for `data`, computing its checksum
    pub fn for_data(name: impl Into<String>, data: &[u8]) -> Self {
        Self::new(name, ContentId::from_data(data))
    }

    /// Total number of shards the file was encoded into
    pub fn total_shards(&self) -> usize {
        self.shards + self.parity
    }

    /// True once encoding has filled in one id per shard position
    pub fn is_encoded(&self) -> bool {
        self.shards > 0 && self.parts.len() == self.total_shards()
    }

    /// Position of `shard_id` within `parts`
    pub fn position_of(&self, shard_id: &ContentId) -> Option<usize> {
        self.parts.iter().position(|p| p == shard_id)
    }
}
