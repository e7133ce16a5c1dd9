//! Upload hashing
//!
//! As plaintext flows through the chunked reader, the hasher accumulates:
//! - one whole-file blake3 content digest, and
//! - per storage node, a validation hash over that node's fragment stream
//!   plus a fixed Merkle root committing to the same bytes.
//!
//! The per-node roots are carried in commit requests so nodes can be
//! challenged on the fragments they claim to hold.

use crate::error::{Result, StratusError};
use std::fmt;

/// Leaf count of the fixed Merkle tree. Fragment bytes are distributed
/// over the leaves in 64-byte segments, round-robin, so a challenge can
/// address any 1/1024th slice of a fragment stream.
pub const FIXED_MERKLE_LEAVES: usize = 1024;

const LEAF_SEGMENT: usize = 64;

/// Per-node hash roots, included in commit requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRoots {
    /// Hash over the node's entire fragment stream.
    pub validation_root: String,
    /// Root of the fixed Merkle tree over the same stream.
    pub fixed_merkle_root: String,
}

/// Final output of the hasher for one upload.
#[derive(Clone, PartialEq, Eq)]
pub struct FileHashes {
    /// blake3 digest of the whole plaintext stream.
    pub content_hash: String,
    /// One entry per storage node, indexed by node position.
    pub shard_roots: Vec<ShardRoots>,
}

impl fmt::Debug for FileHashes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHashes")
            .field("content_hash", &self.content_hash)
            .field("shards", &self.shard_roots.len())
            .finish()
    }
}

/// Fixed-shape Merkle tree over a byte stream.
struct FixedMerkleTree {
    leaves: Vec<blake3::Hasher>,
    next_leaf: usize,
    pending: Vec<u8>,
}

impl FixedMerkleTree {
    fn new() -> Self {
        Self {
            leaves: (0..FIXED_MERKLE_LEAVES).map(|_| blake3::Hasher::new()).collect(),
            next_leaf: 0,
            pending: Vec::with_capacity(LEAF_SEGMENT),
        }
    }

    fn write(&mut self, mut data: &[u8]) {
        // Complete a partially filled segment first.
        if !self.pending.is_empty() {
            let need = LEAF_SEGMENT - self.pending.len();
            let take = need.min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() == LEAF_SEGMENT {
                self.flush_pending();
            }
        }

        let mut chunks = data.chunks_exact(LEAF_SEGMENT);
        for seg in &mut chunks {
            self.leaves[self.next_leaf].update(seg);
            self.next_leaf = (self.next_leaf + 1) % FIXED_MERKLE_LEAVES;
        }
        self.pending.extend_from_slice(chunks.remainder());
    }

    fn flush_pending(&mut self) {
        let seg = std::mem::take(&mut self.pending);
        self.leaves[self.next_leaf].update(&seg);
        self.next_leaf = (self.next_leaf + 1) % FIXED_MERKLE_LEAVES;
    }

    fn root(mut self) -> String {
        if !self.pending.is_empty() {
            self.flush_pending();
        }

        let mut level: Vec<[u8; 32]> = self
            .leaves
            .into_iter()
            .map(|h| *h.finalize().as_bytes())
            .collect();

        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| {
                    let mut node = blake3::Hasher::new();
                    node.update(&pair[0]);
                    node.update(&pair[1]);
                    *node.finalize().as_bytes()
                })
                .collect();
        }

        blake3::Hash::from_bytes(level[0]).to_hex().to_string()
    }
}

/// Hash state for one node's fragment stream.
struct ShardHasher {
    validation: blake3::Hasher,
    merkle: FixedMerkleTree,
}

/// Accumulates hashes for one upload. Created alongside the chunked
/// reader and finalized once the final chunk has been produced.
pub struct UploadHasher {
    file: blake3::Hasher,
    shards: Vec<ShardHasher>,
    finalized: bool,
}

impl UploadHasher {
    /// `total_shards` = data shards + parity shards of the allocation.
    pub fn new(total_shards: usize) -> Result<Self> {
        if total_shards == 0 || total_shards > crate::MAX_BLOBBERS {
            return Err(StratusError::InvalidParameter {
                name: "total_shards",
                reason: total_shards.to_string(),
            });
        }
        Ok(Self {
            file: blake3::Hasher::new(),
            shards: (0..total_shards)
                .map(|_| ShardHasher {
                    validation: blake3::Hasher::new(),
                    merkle: FixedMerkleTree::new(),
                })
                .collect(),
            finalized: false,
        })
    }

    /// Feed the whole-file content digest. Called with raw plaintext,
    /// before erasure coding.
    pub fn write_to_file(&mut self, chunk: &[u8]) -> Result<()> {
        if self.finalized {
            return Err(StratusError::Crypto("hasher already finalized".to_string()));
        }
        self.file.update(chunk);
        Ok(())
    }

    /// Feed one node's fragment for the current chunk. Called once per
    /// node per chunk, after erasure coding.
    pub fn write_fragment(&mut self, shard_idx: usize, fragment: &[u8]) -> Result<()> {
        let shard = self.shards.get_mut(shard_idx).ok_or_else(|| {
            StratusError::InvalidParameter {
                name: "shard_idx",
                reason: shard_idx.to_string(),
            }
        })?;
        shard.validation.update(fragment);
        shard.merkle.write(fragment);
        Ok(())
    }

    /// Finish and produce the per-node roots.
    pub fn finalize(self) -> FileHashes {
        FileHashes {
            content_hash: self.file.finalize().to_hex().to_string(),
            shard_roots: self
                .shards
                .into_iter()
                .map(|s| ShardRoots {
                    validation_root: s.validation.finalize().to_hex().to_string(),
                    fixed_merkle_root: s.merkle.root(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_zero_shards() {
        assert!(UploadHasher::new(0).is_err());
        assert!(UploadHasher::new(129).is_err());
    }

    #[test]
    fn test_content_hash_matches_plain_blake3() {
        let mut hasher = UploadHasher::new(3).unwrap();
        hasher.write_to_file(b"hello ").unwrap();
        hasher.write_to_file(b"world").unwrap();
        let hashes = hasher.finalize();
        assert_eq!(
            hashes.content_hash,
            blake3::hash(b"hello world").to_hex().to_string()
        );
    }

    #[test]
    fn test_roots_are_deterministic() {
        let run = || {
            let mut h = UploadHasher::new(2).unwrap();
            h.write_to_file(b"payload").unwrap();
            h.write_fragment(0, b"frag-zero").unwrap();
            h.write_fragment(1, b"frag-one").unwrap();
            h.finalize()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_fragments_differentiate_roots() {
        let mut h = UploadHasher::new(2).unwrap();
        h.write_fragment(0, b"frag-zero").unwrap();
        h.write_fragment(1, b"frag-one").unwrap();
        let hashes = h.finalize();
        assert_ne!(hashes.shard_roots[0], hashes.shard_roots[1]);
        assert_ne!(
            hashes.shard_roots[0].validation_root,
            hashes.shard_roots[0].fixed_merkle_root
        );
    }

    #[test]
    fn test_merkle_root_independent_of_write_granularity() {
        let data = vec![9u8; 5000];

        let mut one = FixedMerkleTree::new();
        one.write(&data);

        let mut many = FixedMerkleTree::new();
        for piece in data.chunks(77) {
            many.write(piece);
        }

        assert_eq!(one.root(), many.root());
    }

    #[test]
    fn test_write_after_finalize_guard() {
        let mut h = UploadHasher::new(1).unwrap();
        h.finalized = true;
        assert!(h.write_to_file(b"late").is_err());
    }
}
