//! Reed-Solomon Erasure Coding
//!
//! Implements systematic (k data, m parity) erasure coding over GF(2^8):
//! - the file is split into k equal data shards (last one zero padded)
//! - m parity shards are computed from them
//! - any k of the k+m shards reconstruct the file
//!
//! Every shard is content-addressed. On decode, a shard whose hash does not
//! match the id recorded in [`Metadata::parts`] is treated as missing, so
//! corruption and loss are both repaired as erasures.

use crate::content::ContentId;
use crate::error::{ObscureFsError, Result};
use crate::metadata::Metadata;
use crate::{DATA_SHARDS, MAX_TOTAL_SHARDS, PARITY_SHARDS};
use bytes::Bytes;
use rayon::prelude::*;
use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Erasure coding configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureConfig {
    /// Number of data shards (k)
    pub data_shards: usize,
    /// Number of parity shards (m)
    pub parity_shards: usize,
}

impl Default for ErasureConfig {
    fn default() -> Self {
        Self {
            data_shards: DATA_SHARDS,
            parity_shards: PARITY_SHARDS,
        }
    }
}

impl ErasureConfig {
    /// Create a new erasure config
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 {
            return Err(ObscureFsError::Configuration(
                "data_shards must be > 0".to_string(),
            ));
        }
        if parity_shards == 0 {
            return Err(ObscureFsError::Configuration(
                "parity_shards must be > 0".to_string(),
            ));
        }
        if data_shards + parity_shards > MAX_TOTAL_SHARDS {
            return Err(ObscureFsError::Configuration(format!(
                "data_shards + parity_shards must be <= {}, got {}",
                MAX_TOTAL_SHARDS,
                data_shards + parity_shards
            )));
        }
        Ok(Self {
            data_shards,
            parity_shards,
        })
    }

    /// Total number of shards
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Maximum number of lost or corrupted shards that can be tolerated
    pub fn max_failures(&self) -> usize {
        self.parity_shards
    }
}

/// Reed-Solomon encoder/decoder bound to one configuration
pub struct ErasureCodec {
    config: ErasureConfig,
    encoder: ReedSolomon,
    output_dir: PathBuf,
    max_shard_size: Option<usize>,
}

impl ErasureCodec {
    /// Create a codec for `config`, decoding into `./decoded`
    pub fn new(config: ErasureConfig) -> Result<Self> {
        // re-check: the fields are public and may bypass ErasureConfig::new
        let config = ErasureConfig::new(config.data_shards, config.parity_shards)?;
        let encoder = ReedSolomon::new(config.data_shards, config.parity_shards)?;
        Ok(Self {
            config,
            encoder,
            output_dir: PathBuf::from("./decoded"),
            max_shard_size: None,
        })
    }

    /// Set the directory decoded files are written under
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Refuse to encode data whose shards would exceed `limit` bytes
    pub fn with_max_shard_size(mut self, limit: usize) -> Self {
        self.max_shard_size = Some(limit);
        self
    }

    pub fn max_shard_size(&self) -> Option<usize> {
        self.max_shard_size
    }

    /// Fail with a configuration error when `data_size` bytes would need
    /// shards larger than the configured limit
    pub fn check_size(&self, data_size: usize) -> Result<()> {
        let shard_size = self.calculate_shard_size(data_size);
        match self.max_shard_size {
            Some(limit) if shard_size > limit => Err(ObscureFsError::Configuration(format!(
                "{} bytes would need {} byte shards, limit is {}",
                data_size, shard_size, limit
            ))),
            _ => Ok(()),
        }
    }

    /// Get the erasure configuration
    pub fn config(&self) -> &ErasureConfig {
        &self.config
    }

    /// Directory decoded files are written under
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Encode `data` into content-addressed shards.
    ///
    /// Fills in `metadata.parts` in shard order and records the erasure
    /// parameters and original size. Identical shards share one map entry.
    pub fn encode(
        &self,
        metadata: &mut Metadata,
        data: &[u8],
    ) -> Result<HashMap<ContentId, Bytes>> {
        self.check_size(data.len())?;
        let shard_size = self.calculate_shard_size(data.len());

        // Pad data to be evenly divisible by data_shards
        let padded_size = shard_size * self.config.data_shards;
        let mut padded_data = data.to_vec();
        padded_data.resize(padded_size, 0);

        let mut shards: Vec<Vec<u8>> = padded_data
            .chunks(shard_size)
            .map(|c| c.to_vec())
            .collect();
        for _ in 0..self.config.parity_shards {
            shards.push(vec![0u8; shard_size]);
        }

        // Encode (fills in parity shards)
        self.encoder.encode(&mut shards)?;

        let hashed: Vec<(ContentId, Bytes)> = shards
            .into_par_iter()
            .map(|shard| (ContentId::from_data(&shard), Bytes::from(shard)))
            .collect();

        metadata.parts = hashed.iter().map(|(id, _)| *id).collect();
        metadata.shards = self.config.data_shards;
        metadata.parity = self.config.parity_shards;
        metadata.size = Some(data.len() as u64);

        debug!(
            checksum = %metadata.checksum,
            shards = metadata.parts.len(),
            shard_size,
            "Encoded file"
        );

        Ok(hashed.into_iter().collect())
    }

    /// Reconstruct the file described by `metadata` and write it to
    /// `<output_dir>/<checksum>/<name>`.
    ///
    /// `shards` is positional; `None` marks a missing shard. Nothing is
    /// written unless reconstruction and verification both succeed.
    pub fn decode(&self, metadata: &Metadata, shards: Vec<Option<Bytes>>) -> Result<PathBuf> {
        let data = self.reconstruct(metadata, shards)?;
        let path = self.output_path(metadata);
        write_atomic(&path, &data)?;
        debug!(checksum = %metadata.checksum, path = %path.display(), "Decoded file");
        Ok(path)
    }

    /// Reconstruct the original bytes in memory.
    pub fn reconstruct(&self, metadata: &Metadata, shards: Vec<Option<Bytes>>) -> Result<Bytes> {
        self.check_metadata(metadata)?;

        let total_shards = self.config.total_shards();
        if shards.len() > total_shards {
            return Err(ObscureFsError::InvalidShardIndex {
                index: shards.len() - 1,
                max: total_shards - 1,
            });
        }

        let mut slots = self.screen_shards(metadata, shards);

        let available = slots.iter().filter(|s| s.is_some()).count();
        if available < self.config.data_shards {
            return Err(ObscureFsError::InsufficientShards {
                available,
                required: self.config.data_shards,
            });
        }

        if available < total_shards {
            self.encoder.reconstruct(&mut slots)?;
        }

        let complete: Vec<Vec<u8>> = slots
            .into_iter()
            .map(|s| {
                s.ok_or_else(|| {
                    ObscureFsError::Integrity("shard missing after reconstruction".to_string())
                })
            })
            .collect::<Result<_>>()?;

        let refs: Vec<&[u8]> = complete.iter().map(|s| s.as_slice()).collect();
        if !self.encoder.verify(&refs)? {
            return Err(ObscureFsError::Integrity(format!(
                "parity verification failed for {}",
                metadata.checksum
            )));
        }

        let shard_size = complete.first().map(|s| s.len()).unwrap_or(0);
        let mut result = Vec::with_capacity(shard_size * self.config.data_shards);
        for shard in complete.iter().take(self.config.data_shards) {
            result.extend_from_slice(shard);
        }

        if let Some(size) = metadata.size {
            let size = size as usize;
            if size > result.len() {
                return Err(ObscureFsError::Integrity(format!(
                    "recorded size {} exceeds reconstructed length {}",
                    size,
                    result.len()
                )));
            }
            result.truncate(size);
        }

        Ok(Bytes::from(result))
    }

    /// Check that a complete shard set is consistent with its parity
    pub fn verify(&self, shards: &[Bytes]) -> Result<bool> {
        if shards.len() != self.config.total_shards() {
            return Ok(false);
        }
        let expected_size = shards.first().map(|s| s.len()).unwrap_or(0);
        if !shards.iter().all(|s| s.len() == expected_size) {
            return Ok(false);
        }
        let refs: Vec<&[u8]> = shards.iter().map(|s| s.as_ref()).collect();
        Ok(self.encoder.verify(&refs)?)
    }

    /// Deterministic output location for a decoded file
    pub fn output_path(&self, metadata: &Metadata) -> PathBuf {
        let checksum = metadata.checksum.to_string();
        let name = Path::new(&metadata.name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| checksum.clone());
        self.output_dir.join(checksum).join(name)
    }

    fn check_metadata(&self, metadata: &Metadata) -> Result<()> {
        if metadata.shards != self.config.data_shards
            || metadata.parity != self.config.parity_shards
        {
            return Err(ObscureFsError::Configuration(format!(
                "codec is {}+{} but file {} was encoded {}+{}",
                self.config.data_shards,
                self.config.parity_shards,
                metadata.checksum,
                metadata.shards,
                metadata.parity
            )));
        }
        if metadata.parts.len() != self.config.total_shards() {
            return Err(ObscureFsError::Integrity(format!(
                "metadata lists {} parts, expected {}",
                metadata.parts.len(),
                self.config.total_shards()
            )));
        }
        Ok(())
    }

    /// Pad `shards` to full width and drop any shard whose hash or length is wrong.
    fn screen_shards(
        &self,
        metadata: &Metadata,
        mut shards: Vec<Option<Bytes>>,
    ) -> Vec<Option<Vec<u8>>> {
        shards.resize(self.config.total_shards(), None);

        let mut slots: Vec<Option<Vec<u8>>> = shards
            .into_par_iter()
            .enumerate()
            .map(|(index, shard)| {
                let shard = shard?;
                if metadata.parts[index].matches(&shard) {
                    Some(shard.to_vec())
                } else {
                    warn!(
                        checksum = %metadata.checksum,
                        index,
                        "Shard hash mismatch, treating as missing"
                    );
                    None
                }
            })
            .collect();

        // Hash-verified shards agree on length unless the metadata itself is bad.
        if let Some(expected) = slots.iter().flatten().map(|s| s.len()).next() {
            for (index, slot) in slots.iter_mut().enumerate() {
                if slot.as_ref().is_some_and(|s| s.len() != expected) {
                    warn!(index, expected, "Shard length mismatch, treating as missing");
                    *slot = None;
                }
            }
        }

        slots
    }

    /// Calculate the size of each shard given the data size
    fn calculate_shard_size(&self, data_size: usize) -> usize {
        // Round up to ensure all data fits; empty input still yields 1-byte shards
        data_size.div_ceil(self.config.data_shards).max(1)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| ObscureFsError::Internal(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("decoded");
    let tmp = parent.join(format!(".{}.partial", file_name));
    fs::write(&tmp, data)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}
