//! SDK configuration
//!
//! Configuration recognized by the data plane, loaded from explicit
//! values or environment variables.

use std::time::Duration;
use stratus_core::{Result, StratusError, DEFAULT_CHUNK_SIZE, MAX_BLOBBERS};

/// Data-plane configuration.
#[derive(Debug, Clone)]
pub struct SdkConfig {
    /// Number of data shards per file.
    pub data_shards: usize,

    /// Number of parity shards per file.
    pub parity_shards: usize,

    /// Plaintext chunk size in bytes (including encryption framing when
    /// encryption is enabled).
    pub chunk_size: usize,

    /// Encrypt fragments on upload.
    pub encrypt_on_upload: bool,

    /// Minimum node acknowledgements for an operation to succeed.
    pub consensus_thresh: usize,

    /// Acknowledgement count at which an operation is fully replicated.
    pub full_consensus: usize,

    /// Per-attempt timeout for connection establishment in seconds.
    pub connection_timeout_secs: u64,

    /// Per-node commit timeout in seconds.
    pub commit_timeout_secs: u64,

    /// Write-marker lock acquisition window in seconds.
    pub lock_timeout_secs: u64,
}

impl SdkConfig {
    /// Create a config for the given shard counts, with every other
    /// knob at its default.
    pub fn new(data_shards: usize, parity_shards: usize) -> Self {
        Self {
            data_shards,
            parity_shards,
            chunk_size: DEFAULT_CHUNK_SIZE,
            encrypt_on_upload: false,
            consensus_thresh: data_shards,
            full_consensus: data_shards + parity_shards,
            connection_timeout_secs: 120,
            commit_timeout_secs: 60,
            lock_timeout_secs: 60,
        }
    }

    /// Apply environment-variable overrides on top of `self`.
    pub fn from_env(mut self) -> Self {
        if let Some(v) = env_usize("STRATUS_CHUNK_SIZE") {
            self.chunk_size = v;
        }
        if let Some(v) = std::env::var("STRATUS_ENCRYPT_ON_UPLOAD")
            .ok()
            .map(|v| v == "true" || v == "1")
        {
            self.encrypt_on_upload = v;
        }
        if let Some(v) = env_usize("STRATUS_CONSENSUS_THRESH") {
            self.consensus_thresh = v;
        }
        if let Some(v) = env_u64("STRATUS_CONNECTION_TIMEOUT") {
            self.connection_timeout_secs = v;
        }
        if let Some(v) = env_u64("STRATUS_COMMIT_TIMEOUT") {
            self.commit_timeout_secs = v;
        }
        if let Some(v) = env_u64("STRATUS_LOCK_TIMEOUT") {
            self.lock_timeout_secs = v;
        }
        self
    }

    /// Verify the configuration is internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.data_shards == 0 {
            return Err(StratusError::InvalidParameter {
                name: "data_shards",
                reason: "must be > 0".to_string(),
            });
        }
        if self.data_shards + self.parity_shards > MAX_BLOBBERS {
            return Err(StratusError::InvalidParameter {
                name: "parity_shards",
                reason: format!(
                    "total shards {} exceed {MAX_BLOBBERS}",
                    self.data_shards + self.parity_shards
                ),
            });
        }
        if self.chunk_size == 0 {
            return Err(StratusError::InvalidParameter {
                name: "chunk_size",
                reason: "must be > 0".to_string(),
            });
        }
        if self.consensus_thresh == 0 || self.consensus_thresh > self.full_consensus {
            return Err(StratusError::InvalidParameter {
                name: "consensus_thresh",
                reason: format!(
                    "{} out of range 1..={}",
                    self.consensus_thresh, self.full_consensus
                ),
            });
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_secs(self.commit_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self::new(10, 4)
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SdkConfig::new(3, 1);
        assert_eq!(config.chunk_size, 64 * 1024);
        assert_eq!(config.consensus_thresh, 3);
        assert_eq!(config.full_consensus, 4);
        assert_eq!(config.connection_timeout(), Duration::from_secs(120));
        assert_eq!(config.commit_timeout(), Duration::from_secs(60));
        assert_eq!(config.lock_timeout(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = SdkConfig::new(2, 1);
        config.consensus_thresh = 4;
        assert!(config.validate().is_err());

        let mut config = SdkConfig::new(2, 1);
        config.chunk_size = 0;
        assert!(config.validate().is_err());

        let config = SdkConfig::new(0, 1);
        assert!(config.validate().is_err());
    }
}
