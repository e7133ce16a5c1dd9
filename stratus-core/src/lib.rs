//! Stratus Core Library
//!
//! Core abstractions for the Stratus client data plane.
//! This crate provides:
//! - A 128-bit participation bitmask over storage-node indices
//! - Reed-Solomon erasure coding (configurable data + parity shards)
//! - Per-fragment encryption framing (AES-256-GCM default scheme)
//! - Upload hashing (whole-file digest plus per-node Merkle roots)
//! - The chunked reader that turns a byte stream into per-node fragments

pub mod bitmask;
pub mod chunker;
pub mod encryption;
pub mod erasure;
pub mod error;
pub mod hasher;

pub use bitmask::Bitmask;
pub use chunker::{ChunkData, ChunkedReader};
pub use encryption::{AesGcmScheme, EncryptedFragment, EncryptionScheme};
pub use erasure::{ErasureConfig, ErasureEncoder};
pub use error::{Result, StratusError};
pub use hasher::{FileHashes, ShardRoots, UploadHasher};

/// Default chunk size for uploads (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum number of storage nodes in one allocation. The participation
/// bitmask is a fixed 128-bit word, so this bound is an invariant rather
/// than a tunable.
pub const MAX_BLOBBERS: usize = 128;

/// Fixed overhead added to each encrypted fragment by the scheme itself:
/// a 12-byte nonce plus a 16-byte authentication tag.
pub const ENCRYPTED_DATA_PADDING_SIZE: usize =
    encryption::NONCE_SIZE + encryption::TAG_SIZE;

/// Size of the checksum header prepended to each encrypted fragment:
/// message checksum followed by overall checksum, both hex-encoded.
pub const ENCRYPTION_HEADER_SIZE: usize =
    encryption::MESSAGE_CHECKSUM_SIZE + encryption::OVERALL_CHECKSUM_SIZE;
