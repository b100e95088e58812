//! Content identifiers
//!
//! Every shard and every original file is addressed by the Blake3 hash of its
//! bytes. A receiver can therefore verify what it was sent without trusting
//! the sender.

use crate::error::{ObscureFsError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Files larger than this are hashed on the rayon pool.
const PARALLEL_HASH_THRESHOLD: usize = 1024 * 1024;

/// Content-addressed identifier (Blake3-256 digest)
///
/// Text form is base58, e.g. `2DrjgbN3Y5AHN4inRXnff2MrzqXJC1JYopNtXmMTBCry`.
/// The same text form is used on the wire, in snapshots and in logs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId([u8; 32]);

impl ContentId {
    /// Create a ContentId from raw digest bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the identifier of `data`
    pub fn from_data(data: &[u8]) -> Self {
        if data.len() >= PARALLEL_HASH_THRESHOLD {
            let mut hasher = blake3::Hasher::new();
            hasher.update_rayon(data);
            Self(*hasher.finalize().as_bytes())
        } else {
            Self(*blake3::hash(data).as_bytes())
        }
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// True when `data` hashes to this identifier
    pub fn matches(&self, data: &[u8]) -> bool {
        Self::from_data(data) == *self
    }

    /// Convert to base58 string
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    /// Parse from base58 string
    pub fn from_base58(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s.trim())
            .into_vec()
            .map_err(|e| ObscureFsError::InvalidContentId(e.to_string()))?;

        if bytes.len() != 32 {
            return Err(ObscureFsError::InvalidContentId(format!(
                "Invalid length: expected 32, got {}",
                bytes.len()
            )));
        }

        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.to_base58();
        write!(f, "ContentId({})", &text[..text.len().min(8)])
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl FromStr for ContentId {
    type Err = ObscureFsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_base58(s)
    }
}

// Serialized as text so ids can be JSON object keys.
impl Serialize for ContentId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        Self::from_base58(&text).map_err(serde::de::Error::custom)
    }
}
