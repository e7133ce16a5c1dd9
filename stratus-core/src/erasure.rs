//! Reed-Solomon Erasure Coding
//!
//! Implements (k, m) erasure coding over chunk payloads where:
//! - k data shards (minimum required to reconstruct)
//! - m parity shards (redundancy)
//! - k + m total fragments, one per storage node
//!
//! The split rule is fixed: a payload of n bytes produces data shards of
//! ceil(n / k) bytes each, zero-padded at the tail. Reconstruction trims
//! back to the original size.

use crate::error::{Result, StratusError};
use bytes::Bytes;
use rayon::prelude::*;
use reed_solomon_erasure::galois_8::ReedSolomon;

/// Erasure coding configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErasureConfig {
    /// Number of data shards (k)
    pub data_shards: usize,
    /// Number of parity shards (m)
    pub parity_shards: usize,
}

impl ErasureConfig {
    /// Create a new erasure config. Parity may be zero, in which case the
    /// coder degrades to a plain splitter.
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 {
            return Err(StratusError::InvalidParameter {
                name: "data_shards",
                reason: "must be > 0".to_string(),
            });
        }
        if data_shards + parity_shards > crate::MAX_BLOBBERS {
            return Err(StratusError::InvalidParameter {
                name: "parity_shards",
                reason: format!(
                    "total shards {} exceed {}",
                    data_shards + parity_shards,
                    crate::MAX_BLOBBERS
                ),
            });
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

    /// Maximum number of node failures that can be tolerated
    pub fn max_failures(&self) -> usize {
        self.parity_shards
    }
}

/// Reed-Solomon encoder/decoder
pub struct ErasureEncoder {
    config: ErasureConfig,
    // None when parity_shards == 0: nothing to compute.
    encoder: Option<ReedSolomon>,
}

impl ErasureEncoder {
    /// Create an encoder for the given configuration
    pub fn new(config: ErasureConfig) -> Result<Self> {
        let encoder = if config.parity_shards > 0 {
            Some(ReedSolomon::new(config.data_shards, config.parity_shards)?)
        } else {
            None
        };
        Ok(Self { config, encoder })
    }

    /// Get the erasure configuration
    pub fn config(&self) -> &ErasureConfig {
        &self.config
    }

    /// Size of each shard for a payload of `data_size` bytes
    pub fn shard_size(&self, data_size: usize) -> usize {
        data_size.div_ceil(self.config.data_shards)
    }

    /// Split a payload into `data_shards` equal-length shards plus empty
    /// parity shards, padding the tail with zeros.
    pub fn split(&self, data: &[u8]) -> Vec<Vec<u8>> {
        let shard_size = self.shard_size(data.len());

        let padded_size = shard_size * self.config.data_shards;
        let mut padded = data.to_vec();
        padded.resize(padded_size, 0);

        let mut shards: Vec<Vec<u8>> = if shard_size == 0 {
            vec![Vec::new(); self.config.data_shards]
        } else {
            padded.chunks(shard_size).map(|c| c.to_vec()).collect()
        };

        for _ in 0..self.config.parity_shards {
            shards.push(vec![0u8; shard_size]);
        }

        shards
    }

    /// Fill in the parity shards of a split payload in place.
    pub fn encode(&self, shards: &mut [Vec<u8>]) -> Result<()> {
        if let Some(encoder) = &self.encoder {
            encoder.encode(shards)?;
        }
        Ok(())
    }

    /// Split and encode in one step, returning the full fragment vector.
    pub fn split_encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut shards = self.split(data);
        self.encode(&mut shards)?;
        Ok(shards)
    }

    /// Parallel variant of [`split_encode`](Self::split_encode) for large
    /// payloads (> 1 MiB).
    pub fn split_encode_parallel(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let shard_size = self.shard_size(data.len());

        let padded_size = shard_size * self.config.data_shards;
        let mut padded = data.to_vec();
        padded.resize(padded_size, 0);

        let mut shards: Vec<Vec<u8>> = if shard_size == 0 {
            vec![Vec::new(); self.config.data_shards]
        } else {
            padded
                .par_chunks(shard_size)
                .map(|c| c.to_vec())
                .collect()
        };

        for _ in 0..self.config.parity_shards {
            shards.push(vec![0u8; shard_size]);
        }

        self.encode(&mut shards)?;
        Ok(shards)
    }

    /// Reconstruct missing shards in place. Missing shards are `None`;
    /// at least `data_shards` entries must be present.
    pub fn reconstruct(&self, shards: &mut Vec<Option<Vec<u8>>>) -> Result<()> {
        let total = self.config.total_shards();
        if shards.len() != total {
            return Err(StratusError::ErasureCoding(format!(
                "expected {} shard slots, got {}",
                total,
                shards.len()
            )));
        }

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.config.data_shards {
            return Err(StratusError::InsufficientShards {
                available,
                required: self.config.data_shards,
            });
        }

        if let Some(encoder) = &self.encoder {
            encoder.reconstruct(shards)?;
        }
        Ok(())
    }

    /// Decode shards back into the original payload of `original_size`
    /// bytes, reconstructing missing shards as needed.
    pub fn decode(
        &self,
        shards: &mut Vec<Option<Vec<u8>>>,
        original_size: usize,
    ) -> Result<Bytes> {
        self.reconstruct(shards)?;

        let mut result = Vec::with_capacity(original_size);
        for shard_opt in shards.iter().take(self.config.data_shards) {
            match shard_opt {
                Some(shard) => result.extend_from_slice(shard),
                None => {
                    return Err(StratusError::ErasureCoding(
                        "reconstruction left a data shard empty".to_string(),
                    ))
                }
            }
        }

        result.truncate(original_size);
        Ok(Bytes::from(result))
    }

    /// Verify that parity shards are consistent with the data shards.
    pub fn verify(&self, shards: &[Vec<u8>]) -> Result<bool> {
        if shards.len() != self.config.total_shards() {
            return Ok(false);
        }
        let expected = shards.first().map(|s| s.len()).unwrap_or(0);
        if !shards.iter().all(|s| s.len() == expected) {
            return Ok(false);
        }
        match &self.encoder {
            Some(encoder) => {
                let refs: Vec<&[u8]> = shards.iter().map(|s| s.as_slice()).collect();
                Ok(encoder.verify(&refs)?)
            }
            None => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder(k: usize, m: usize) -> ErasureEncoder {
        ErasureEncoder::new(ErasureConfig::new(k, m).unwrap()).unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(ErasureConfig::new(0, 2).is_err());
        assert!(ErasureConfig::new(2, 0).is_ok());
        assert!(ErasureConfig::new(100, 29).is_err());
        let config = ErasureConfig::new(10, 4).unwrap();
        assert_eq!(config.total_shards(), 14);
        assert_eq!(config.max_failures(), 4);
    }

    #[test]
    fn test_split_pads_tail() {
        let coder = encoder(3, 1);
        let shards = coder.split(b"abcdefg"); // 7 bytes -> shard size 3
        assert_eq!(shards.len(), 4);
        assert_eq!(shards[0], b"abc");
        assert_eq!(shards[1], b"def");
        assert_eq!(shards[2], b"g\0\0");
        assert_eq!(shards[3], vec![0u8; 3]);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let coder = encoder(3, 2);
        let original = b"the quick brown fox jumps over the lazy dog";

        let shards = coder.split_encode(original).unwrap();
        assert_eq!(shards.len(), 5);

        let mut opts: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        opts[0] = None;
        opts[4] = None;

        let decoded = coder.decode(&mut opts, original.len()).unwrap();
        assert_eq!(decoded.as_ref(), original);
    }

    #[test]
    fn test_too_many_missing() {
        let coder = encoder(3, 2);
        let shards = coder.split_encode(b"some payload").unwrap();
        let mut opts: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        opts[0] = None;
        opts[1] = None;
        opts[2] = None;

        let result = coder.decode(&mut opts, 12);
        assert!(matches!(
            result,
            Err(StratusError::InsufficientShards { available: 2, required: 3 })
        ));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let coder = encoder(10, 4);
        let original = vec![42u8; 2 * 1024 * 1024];

        let seq = coder.split_encode(&original).unwrap();
        let par = coder.split_encode_parallel(&original).unwrap();
        assert_eq!(seq, par);
    }

    #[test]
    fn test_zero_parity_passthrough() {
        let coder = encoder(2, 0);
        let shards = coder.split_encode(b"abcd").unwrap();
        assert_eq!(shards, vec![b"ab".to_vec(), b"cd".to_vec()]);
        assert!(coder.verify(&shards).unwrap());

        let mut opts: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        let decoded = coder.decode(&mut opts, 4).unwrap();
        assert_eq!(decoded.as_ref(), b"abcd");
    }

    #[test]
    fn test_verify_detects_corruption() {
        let coder = encoder(4, 2);
        let mut shards = coder.split_encode(b"verify me, please").unwrap();
        assert!(coder.verify(&shards).unwrap());

        shards[1][0] ^= 0xFF;
        assert!(!coder.verify(&shards).unwrap());
    }
}
