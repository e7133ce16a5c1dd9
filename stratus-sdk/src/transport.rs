//! Node transport seam
//!
//! [`BlobberTransport`] is the boundary between the coordinator and the
//! wire. Production code uses the HTTP implementation in [`crate::http`];
//! tests inject fakes, the same way the platform side injects metadata
//! and network clients.

use crate::allocation::{Allocation, Blobber};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use stratus_core::Result;

/// One fragment of one chunk, addressed to one node.
#[derive(Debug, Clone)]
pub struct FragmentPayload {
    pub connection_id: String,
    pub remote_path: String,
    pub chunk_index: u32,
    pub is_final: bool,
    pub data: Bytes,
}

/// A per-node, per-operation change record. Opaque to the coordinator,
/// which only groups records by node and appends them to that node's
/// commit request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationChange {
    /// Shared across the per-node records of one operation.
    pub change_id: String,
    pub operation: String,
    pub remote_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub size: u64,
    pub lookup_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_root: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_merkle_root: Option<String>,
}

/// Commit request body for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitPayload {
    pub allocation_id: String,
    pub connection_id: String,
    /// Batch timestamp, unix milliseconds from a single clock read.
    pub timestamp: i64,
    pub changes: Vec<AllocationChange>,
}

/// Per-node file metadata, the input to repair diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub remote_path: String,
    pub lookup_hash: String,
    pub content_hash: String,
    pub chunk_count: u64,
    /// Plaintext file size.
    pub size: u64,
    pub encrypted: bool,
}

/// Entry kind in a node's directory listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One entry of a single node's directory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub remote_path: String,
    pub kind: EntryKind,
    pub size: u64,
}

/// Everything the data plane needs from a storage node.
#[async_trait]
pub trait BlobberTransport: Send + Sync {
    /// Open a batch connection on the node. Returns typed errors: HTTP
    /// 429 surfaces as `RateLimited`, other non-200 as `BlobberReject`.
    /// Retrying is the caller's concern.
    async fn create_connection(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        connection_id: &str,
    ) -> Result<()>;

    /// Stream one fragment of one chunk to the node.
    async fn upload_fragment(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        payload: &FragmentPayload,
    ) -> Result<()>;

    /// Apply the staged changes of a batch connection.
    async fn commit(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        payload: &CommitPayload,
    ) -> Result<()>;

    /// Best-effort undo of a committed connection.
    async fn rollback(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        connection_id: &str,
    ) -> Result<()>;

    /// Acquire the node's slot of the allocation write-marker lock.
    async fn lock_write_marker(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        connection_id: &str,
    ) -> Result<()>;

    /// Release the node's slot of the allocation write-marker lock.
    async fn unlock_write_marker(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        connection_id: &str,
    ) -> Result<()>;

    /// Sequence number of the node's latest write marker, `None` when
    /// the allocation has no markers yet. Feeds the status probe.
    async fn latest_write_marker(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
    ) -> Result<Option<u64>>;

    /// Per-node file metadata; `None` when the node has no trace of the
    /// path.
    async fn file_meta(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        remote_path: &str,
    ) -> Result<Option<FileMeta>>;

    /// One level of the node's directory listing.
    async fn list_dir(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        remote_path: &str,
    ) -> Result<Vec<RemoteEntry>>;

    /// Fetch the node's fragment of one chunk.
    async fn download_fragment(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        remote_path: &str,
        chunk_index: u32,
    ) -> Result<Bytes>;

    /// Stage a file deletion on the batch connection.
    async fn delete_file(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        connection_id: &str,
        remote_path: &str,
    ) -> Result<()>;

    /// Stage a rename on the batch connection.
    async fn rename_file(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        connection_id: &str,
        remote_path: &str,
        new_name: &str,
    ) -> Result<()>;

    /// Stage a copy on the batch connection.
    async fn copy_file(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        connection_id: &str,
        remote_path: &str,
        destination: &str,
    ) -> Result<()>;

    /// Stage a move on the batch connection.
    async fn move_file(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        connection_id: &str,
        remote_path: &str,
        destination: &str,
    ) -> Result<()>;

    /// Stage a directory creation on the batch connection.
    async fn create_dir(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        connection_id: &str,
        remote_path: &str,
    ) -> Result<()>;
}
