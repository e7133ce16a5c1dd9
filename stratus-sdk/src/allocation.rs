//! Allocation model
//!
//! An allocation is a user-scoped storage grant across N nodes with
//! (data, parity) shard counts fixed at creation. It is immutable for
//! the duration of an operation batch.

use serde::{Deserialize, Serialize};
use stratus_core::{Result, StratusError, MAX_BLOBBERS};

/// One storage node in an allocation, identified by its position in the
/// allocation's ordered node list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blobber {
    /// Position in the allocation's node list; the only identity the
    /// participation bitmask knows about.
    pub index: u32,
    /// Base URL of the node's HTTP endpoint.
    pub base_url: String,
    /// Node public key, used for challenge verification.
    #[serde(default)]
    pub public_key: Vec<u8>,
}

/// A storage allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    /// Allocation id.
    pub id: String,
    /// Transaction that created or last updated the allocation; sent to
    /// nodes as the auth token for data-plane requests.
    pub tx: String,
    /// Ordered node list; `len == data_shards + parity_shards`.
    pub blobbers: Vec<Blobber>,
    pub data_shards: usize,
    pub parity_shards: usize,
}

impl Allocation {
    /// Verify the allocation invariants.
    pub fn validate(&self) -> Result<()> {
        if self.data_shards == 0 {
            return Err(StratusError::InvalidParameter {
                name: "data_shards",
                reason: "must be >= 1".to_string(),
            });
        }
        let expected = self.data_shards + self.parity_shards;
        if self.blobbers.len() != expected {
            return Err(StratusError::InvalidParameter {
                name: "blobbers",
                reason: format!("expected {expected} nodes, got {}", self.blobbers.len()),
            });
        }
        if expected > MAX_BLOBBERS {
            return Err(StratusError::InvalidParameter {
                name: "blobbers",
                reason: format!("{expected} nodes exceed the {MAX_BLOBBERS} bound"),
            });
        }
        for (i, b) in self.blobbers.iter().enumerate() {
            if b.index as usize != i {
                return Err(StratusError::InvalidParameter {
                    name: "blobbers",
                    reason: format!("node at position {i} carries index {}", b.index),
                });
            }
        }
        Ok(())
    }

    /// Total node count.
    pub fn total_blobbers(&self) -> usize {
        self.blobbers.len()
    }
}

/// Outcome of the pre-commit allocation status probe: what the latest
/// write markers across live nodes say about the allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStatus {
    /// All probed nodes agree; safe to commit.
    Commit,
    /// A minority has drifted; a repair pass should run first.
    Repair,
    /// No majority agreement; the batch must back off entirely.
    Broken,
}

/// Classify write-marker sequence numbers reported by the probed nodes.
/// `None` entries are nodes that could not be probed.
pub fn classify_write_markers(sequences: &[Option<u64>]) -> AllocStatus {
    let live: Vec<u64> = sequences.iter().copied().flatten().collect();
    if live.is_empty() {
        return AllocStatus::Broken;
    }

    let mut best_count = 0usize;
    for seq in &live {
        let count = live.iter().filter(|s| *s == seq).count();
        if count > best_count {
            best_count = count;
        }
    }

    if best_count == live.len() {
        AllocStatus::Commit
    } else if best_count * 2 > live.len() {
        AllocStatus::Repair
    } else {
        AllocStatus::Broken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_allocation(n: usize, data_shards: usize) -> Allocation {
        Allocation {
            id: "alloc-1".to_string(),
            tx: "tx-1".to_string(),
            blobbers: (0..n)
                .map(|i| Blobber {
                    index: i as u32,
                    base_url: format!("http://node-{i}.example.com"),
                    public_key: Vec::new(),
                })
                .collect(),
            data_shards,
            parity_shards: n - data_shards,
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(test_allocation(3, 2).validate().is_ok());
    }

    #[test]
    fn test_validate_shard_mismatch() {
        let mut alloc = test_allocation(3, 2);
        alloc.blobbers.pop();
        assert!(alloc.validate().is_err());
    }

    #[test]
    fn test_validate_index_order() {
        let mut alloc = test_allocation(3, 2);
        alloc.blobbers[1].index = 5;
        assert!(alloc.validate().is_err());
    }

    #[test]
    fn test_classify_all_agree() {
        assert_eq!(
            classify_write_markers(&[Some(7), Some(7), Some(7)]),
            AllocStatus::Commit
        );
    }

    #[test]
    fn test_classify_minority_drift() {
        assert_eq!(
            classify_write_markers(&[Some(7), Some(7), Some(6)]),
            AllocStatus::Repair
        );
    }

    #[test]
    fn test_classify_no_majority() {
        assert_eq!(
            classify_write_markers(&[Some(5), Some(6), Some(7)]),
            AllocStatus::Broken
        );
        assert_eq!(classify_write_markers(&[None, None]), AllocStatus::Broken);
    }

    #[test]
    fn test_classify_ignores_unreachable() {
        assert_eq!(
            classify_write_markers(&[Some(7), None, Some(7)]),
            AllocStatus::Commit
        );
    }
}
