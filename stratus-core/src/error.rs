//! Error types for Stratus
//!
//! Provides a unified error type shared by the core primitives and the
//! SDK data plane.

use thiserror::Error;

/// Result type alias for Stratus operations
pub type Result<T> = std::result::Result<T, StratusError>;

/// Unified error type for Stratus
#[derive(Error, Debug)]
pub enum StratusError {
    // ===== Validation =====
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    // ===== Node communication =====
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Node rejected request ({status}): {reason}")]
    BlobberReject { status: u16, reason: String },

    // ===== Batch coordination =====
    #[error("Consensus not met: required {required}, achieved {achieved}{}", major_suffix(.major))]
    ConsensusNotMet {
        required: usize,
        achieved: usize,
        /// Most frequent underlying error across the batch, if any.
        major: Option<String>,
    },

    /// The caller should retry the whole batch once the pending repair
    /// pass has completed. A contract with the caller, not a failure.
    #[error("Operation should be retried")]
    RetryOperation,

    #[error("Write-marker lock unavailable: {achieved} of {required} nodes acknowledged")]
    LockUnavailable { required: usize, achieved: usize },

    #[error("Operation cancelled")]
    Cancelled,

    // ===== Data pipeline =====
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Erasure coding error: {0}")]
    ErasureCoding(String),

    #[error("Insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    // ===== Ambient =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn major_suffix(major: &Option<String>) -> String {
    match major {
        Some(m) => format!(". Major error: {m}"),
        None => String::new(),
    }
}

impl StratusError {
    /// True for the retry sentinel, which callers must not surface as a
    /// user-facing failure.
    pub fn is_retry(&self) -> bool {
        matches!(self, StratusError::RetryOperation)
    }

    /// Stable identity used when voting on the most frequent error
    /// across a batch.
    pub fn identity(&self) -> String {
        self.to_string()
    }
}

impl From<reed_solomon_erasure::Error> for StratusError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        StratusError::ErasureCoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consensus_display_with_major() {
        let err = StratusError::ConsensusNotMet {
            required: 3,
            achieved: 1,
            major: Some("Transport error: connection refused".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Consensus not met: required 3, achieved 1. Major error: Transport error: connection refused"
        );
    }

    #[test]
    fn test_consensus_display_without_major() {
        let err = StratusError::ConsensusNotMet {
            required: 2,
            achieved: 0,
            major: None,
        };
        assert_eq!(err.to_string(), "Consensus not met: required 2, achieved 0");
    }

    #[test]
    fn test_retry_sentinel() {
        assert!(StratusError::RetryOperation.is_retry());
        assert!(!StratusError::Cancelled.is_retry());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: StratusError = io_err.into();
        assert!(matches!(err, StratusError::Io(_)));
    }
}
