//! Stratus SDK
//!
//! Client data plane for the Stratus storage network. Files are chunked,
//! Reed-Solomon coded and optionally encrypted by `stratus-core`, then
//! written to the allocation's nodes under a two-phase process/commit
//! protocol with a quorum gate, a distributed write-marker lock and
//! rollback on commit failure. A repair worker walks the remote tree and
//! restores per-file shard consensus.
//!
//! The crate provides:
//! - The allocation model and consensus parameters
//! - A transport trait plus its reqwest HTTP implementation
//! - Batch operations (upload, update, delete, rename, move, copy,
//!   create-dir) and the multi-operation coordinator
//! - The write-marker mutex
//! - The repair worker
//! - A bounded LRU status registry behind the status callback trait

pub mod allocation;
pub mod config;
pub mod http;
pub mod multi_op;
pub mod operations;
pub mod repair;
pub mod status;
pub mod transport;
pub mod write_marker;

pub use allocation::{classify_write_markers, AllocStatus, Allocation, Blobber};
pub use config::SdkConfig;
pub use http::HttpBlobberTransport;
pub use multi_op::{CancelFlag, MultiOperation};
pub use operations::{FileRef, OpKind, Operation, UploadSource};
pub use repair::{DirListing, RepairDiagnosis, RepairWorker};
pub use status::{lookup_hash, NoopStatus, Status, StatusCallback, StatusRegistry};
pub use transport::{
    AllocationChange, BlobberTransport, CommitPayload, EntryKind, FileMeta, FragmentPayload,
    RemoteEntry,
};
pub use write_marker::WriteMarkerLock;

pub use stratus_core::{Bitmask, Result, StratusError};
