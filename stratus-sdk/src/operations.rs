//! Batch operations
//!
//! An operation is one unit of work in a multi-operation batch: it knows
//! how to run its process phase against every node, how to build the
//! per-node change records the commit phase needs, and how to report
//! completion or failure to the caller.
//!
//! Operations are a closed set of variants rather than an open trait
//! hierarchy; the coordinator only ever sees the common surface.

use crate::allocation::{Allocation, Blobber};
use crate::config::SdkConfig;
use crate::multi_op::CancelFlag;
use crate::status::{lookup_hash, NoopStatus, StatusCallback};
use crate::transport::{AllocationChange, BlobberTransport, FragmentPayload};
use bytes::Bytes;
use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;
use stratus_core::{
    AesGcmScheme, Bitmask, ChunkedReader, EncryptionScheme, ErasureConfig, ErasureEncoder,
    FileHashes, Result, StratusError, UploadHasher,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Kind tag shared by operations, change records and status callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Upload,
    Update,
    Delete,
    Rename,
    Move,
    Copy,
    CreateDir,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Upload => "upload",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
            OpKind::Rename => "rename",
            OpKind::Move => "move",
            OpKind::Copy => "copy",
            OpKind::CreateDir => "create_dir",
        }
    }
}

/// Reference to a remote file produced by an operation's process phase.
#[derive(Debug, Clone)]
pub struct FileRef {
    pub remote_path: String,
    pub name: String,
    pub mime_type: String,
    pub lookup_hash: String,
    pub content_hash: Option<String>,
    pub size: u64,
    pub chunk_count: u64,
}

/// Everything an operation needs to talk to the allocation's nodes.
pub(crate) struct OpContext<'a> {
    pub alloc: &'a Allocation,
    pub transport: &'a dyn BlobberTransport,
    pub config: &'a SdkConfig,
    pub cancel: &'a CancelFlag,
}

/// Source of upload bytes.
pub type UploadSource = Box<dyn Read + Send + 'static>;

/// Upload (or update) of one file.
pub struct UploadOperation {
    pub remote_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub total_size: u64,
    kind: OpKind,
    source: Option<UploadSource>,
    status: Arc<dyn StatusCallback>,
    /// Restricts the fan-out; repair uploads target only the nodes that
    /// miss the canonical shards.
    target_mask: Option<Bitmask>,
    hashes: Option<FileHashes>,
    uploaded_bytes: u64,
    chunk_count: u64,
}

/// Staged deletion of one path.
pub struct DeleteOperation {
    pub remote_path: String,
    target_mask: Option<Bitmask>,
}

/// Rename within the same directory.
pub struct RenameOperation {
    pub remote_path: String,
    pub new_name: String,
}

/// Move to another directory.
pub struct MoveOperation {
    pub remote_path: String,
    pub destination: String,
}

/// Server-side copy.
pub struct CopyOperation {
    pub remote_path: String,
    pub destination: String,
}

/// Directory creation.
pub struct CreateDirOperation {
    pub remote_path: String,
}

/// One unit of work in a batch.
pub enum Operation {
    Upload(UploadOperation),
    Update(UploadOperation),
    Delete(DeleteOperation),
    Rename(RenameOperation),
    Move(MoveOperation),
    Copy(CopyOperation),
    CreateDir(CreateDirOperation),
}

impl Operation {
    pub fn upload(
        remote_path: impl Into<String>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        total_size: u64,
        source: UploadSource,
        status: Arc<dyn StatusCallback>,
    ) -> Self {
        Operation::Upload(UploadOperation::new(
            remote_path,
            file_name,
            mime_type,
            total_size,
            OpKind::Upload,
            source,
            status,
            None,
        ))
    }

    pub fn update(
        remote_path: impl Into<String>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        total_size: u64,
        source: UploadSource,
        status: Arc<dyn StatusCallback>,
    ) -> Self {
        Operation::Update(UploadOperation::new(
            remote_path,
            file_name,
            mime_type,
            total_size,
            OpKind::Update,
            source,
            status,
            None,
        ))
    }

    /// Upload targeting only the nodes in `target_mask`; used by the
    /// repair worker to restore missing shards.
    pub(crate) fn repair_upload(
        remote_path: impl Into<String>,
        file_name: impl Into<String>,
        total_size: u64,
        source: UploadSource,
        status: Arc<dyn StatusCallback>,
        target_mask: Bitmask,
    ) -> Self {
        Operation::Upload(UploadOperation::new(
            remote_path,
            file_name,
            "application/octet-stream",
            total_size,
            OpKind::Upload,
            source,
            status,
            Some(target_mask),
        ))
    }

    pub fn delete(remote_path: impl Into<String>) -> Self {
        Operation::Delete(DeleteOperation {
            remote_path: remote_path.into(),
            target_mask: None,
        })
    }

    /// Deletion restricted to the nodes in `target_mask`; used by the
    /// repair worker to discard minority shards.
    pub(crate) fn delete_masked(remote_path: impl Into<String>, target_mask: Bitmask) -> Self {
        Operation::Delete(DeleteOperation {
            remote_path: remote_path.into(),
            target_mask: Some(target_mask),
        })
    }

    pub fn rename(remote_path: impl Into<String>, new_name: impl Into<String>) -> Self {
        Operation::Rename(RenameOperation {
            remote_path: remote_path.into(),
            new_name: new_name.into(),
        })
    }

    pub fn move_file(remote_path: impl Into<String>, destination: impl Into<String>) -> Self {
        Operation::Move(MoveOperation {
            remote_path: remote_path.into(),
            destination: destination.into(),
        })
    }

    pub fn copy(remote_path: impl Into<String>, destination: impl Into<String>) -> Self {
        Operation::Copy(CopyOperation {
            remote_path: remote_path.into(),
            destination: destination.into(),
        })
    }

    pub fn create_dir(remote_path: impl Into<String>) -> Self {
        Operation::CreateDir(CreateDirOperation {
            remote_path: remote_path.into(),
        })
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Upload(_) => OpKind::Upload,
            Operation::Update(_) => OpKind::Update,
            Operation::Delete(_) => OpKind::Delete,
            Operation::Rename(_) => OpKind::Rename,
            Operation::Move(_) => OpKind::Move,
            Operation::Copy(_) => OpKind::Copy,
            Operation::CreateDir(_) => OpKind::CreateDir,
        }
    }

    pub fn remote_path(&self) -> &str {
        match self {
            Operation::Upload(op) | Operation::Update(op) => &op.remote_path,
            Operation::Delete(op) => &op.remote_path,
            Operation::Rename(op) => &op.remote_path,
            Operation::Move(op) => &op.remote_path,
            Operation::Copy(op) => &op.remote_path,
            Operation::CreateDir(op) => &op.remote_path,
        }
    }

    /// Precondition check, run before the batch starts.
    pub fn verify(&self) -> Result<()> {
        let path = self.remote_path();
        if path.is_empty() || !path.starts_with('/') {
            return Err(StratusError::InvalidParameter {
                name: "remote_path",
                reason: format!("{path:?} is not an absolute path"),
            });
        }
        if let Operation::Rename(op) = self {
            if op.new_name.is_empty() || op.new_name.contains('/') {
                return Err(StratusError::InvalidParameter {
                    name: "new_name",
                    reason: format!("{:?} is not a bare file name", op.new_name),
                });
            }
        }
        Ok(())
    }

    /// Run the process phase. Returns the refs this operation produced
    /// and the mask of nodes that acknowledged it.
    pub(crate) async fn process(
        &mut self,
        ctx: &OpContext<'_>,
        connection_id: &str,
    ) -> Result<(Vec<FileRef>, Bitmask)> {
        match self {
            Operation::Upload(op) | Operation::Update(op) => op.process(ctx, connection_id).await,
            Operation::Delete(op) => {
                let mask = op
                    .target_mask
                    .unwrap_or_else(|| Bitmask::full(ctx.alloc.total_blobbers()));
                let path = op.remote_path.clone();
                let (ok, last) = fan_out(ctx.alloc, mask, |b| {
                    Box::pin(ctx.transport.delete_file(ctx.alloc, b, connection_id, &path))
                })
                .await;
                finish_fan_out(ok, last, simple_ref(ctx.alloc, &op.remote_path), ctx.config.consensus_thresh)
            }
            Operation::Rename(op) => {
                let (path, new_name) = (op.remote_path.clone(), op.new_name.clone());
                let mask = Bitmask::full(ctx.alloc.total_blobbers());
                let (ok, last) = fan_out(ctx.alloc, mask, |b| {
                    Box::pin(ctx.transport.rename_file(
                        ctx.alloc, b, connection_id, &path, &new_name,
                    ))
                })
                .await;
                finish_fan_out(ok, last, simple_ref(ctx.alloc, &op.remote_path), ctx.config.consensus_thresh)
            }
            Operation::Move(op) => {
                let (path, dest) = (op.remote_path.clone(), op.destination.clone());
                let mask = Bitmask::full(ctx.alloc.total_blobbers());
                let (ok, last) = fan_out(ctx.alloc, mask, |b| {
                    Box::pin(ctx.transport.move_file(ctx.alloc, b, connection_id, &path, &dest))
                })
                .await;
                finish_fan_out(ok, last, simple_ref(ctx.alloc, &op.remote_path), ctx.config.consensus_thresh)
            }
            Operation::Copy(op) => {
                let (path, dest) = (op.remote_path.clone(), op.destination.clone());
                let mask = Bitmask::full(ctx.alloc.total_blobbers());
                let (ok, last) = fan_out(ctx.alloc, mask, |b| {
                    Box::pin(ctx.transport.copy_file(ctx.alloc, b, connection_id, &path, &dest))
                })
                .await;
                finish_fan_out(ok, last, simple_ref(ctx.alloc, &op.remote_path), ctx.config.consensus_thresh)
            }
            Operation::CreateDir(op) => {
                let path = op.remote_path.clone();
                let mask = Bitmask::full(ctx.alloc.total_blobbers());
                let (ok, last) = fan_out(ctx.alloc, mask, |b| {
                    Box::pin(ctx.transport.create_dir(ctx.alloc, b, connection_id, &path))
                })
                .await;
                finish_fan_out(ok, last, simple_ref(ctx.alloc, &op.remote_path), ctx.config.consensus_thresh)
            }
        }
    }

    /// Build one change record per node. Element `i` joins node `i`'s
    /// commit request.
    pub(crate) fn build_change(
        &self,
        refs: &[FileRef],
        change_id: Uuid,
        n_blobbers: usize,
    ) -> Vec<AllocationChange> {
        let file_ref = refs.first();
        let (size, content_hash, lookup) = match file_ref {
            Some(r) => (r.size, r.content_hash.clone(), r.lookup_hash.clone()),
            None => (0, None, String::new()),
        };

        let destination = match self {
            Operation::Rename(op) => Some(op.new_name.clone()),
            Operation::Move(op) => Some(op.destination.clone()),
            Operation::Copy(op) => Some(op.destination.clone()),
            _ => None,
        };

        let hashes = match self {
            Operation::Upload(op) | Operation::Update(op) => op.hashes.as_ref(),
            _ => None,
        };

        (0..n_blobbers)
            .map(|b| {
                let roots = hashes.and_then(|h| h.shard_roots.get(b));
                AllocationChange {
                    change_id: change_id.to_string(),
                    operation: self.kind().as_str().to_string(),
                    remote_path: self.remote_path().to_string(),
                    destination: destination.clone(),
                    size,
                    lookup_hash: lookup.clone(),
                    content_hash: content_hash.clone(),
                    validation_root: roots.map(|r| r.validation_root.clone()),
                    fixed_merkle_root: roots.map(|r| r.fixed_merkle_root.clone()),
                }
            })
            .collect()
    }

    /// Success callback, invoked once the batch reaches commit consensus.
    pub(crate) fn completed(&self, alloc: &Allocation) {
        if let Operation::Upload(op) | Operation::Update(op) = self {
            op.status.completed(
                &alloc.id,
                &op.remote_path,
                &op.file_name,
                &op.mime_type,
                op.uploaded_bytes,
                self.kind(),
            );
        }
    }

    /// Failure callback with the consensus actually achieved.
    pub(crate) fn error(&self, alloc: &Allocation, consensus: usize, err: &StratusError) {
        debug!(path = self.remote_path(), consensus, "operation failed");
        if let Operation::Upload(op) | Operation::Update(op) = self {
            op.status.error(&alloc.id, &op.remote_path, self.kind(), err);
        }
    }
}

impl UploadOperation {
    #[allow(clippy::too_many_arguments)]
    fn new(
        remote_path: impl Into<String>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        total_size: u64,
        kind: OpKind,
        source: UploadSource,
        status: Arc<dyn StatusCallback>,
        target_mask: Option<Bitmask>,
    ) -> Self {
        Self {
            remote_path: remote_path.into(),
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            total_size,
            kind,
            source: Some(source),
            status,
            target_mask,
            hashes: None,
            uploaded_bytes: 0,
            chunk_count: 0,
        }
    }

    async fn process(
        &mut self,
        ctx: &OpContext<'_>,
        connection_id: &str,
    ) -> Result<(Vec<FileRef>, Bitmask)> {
        let n = ctx.alloc.total_blobbers();
        let upload_mask = self.target_mask.unwrap_or_else(|| Bitmask::full(n));
        let kind = self.kind;

        let source = self.source.take().ok_or(StratusError::InvalidParameter {
            name: "source",
            reason: "upload source already consumed".to_string(),
        })?;

        self.status
            .started(&ctx.alloc.id, &self.remote_path, kind, self.total_size);

        let coder = ErasureEncoder::new(ErasureConfig::new(
            ctx.alloc.data_shards,
            ctx.alloc.parity_shards,
        )?)?;
        let hasher = UploadHasher::new(n)?;
        let scheme: Option<Box<dyn EncryptionScheme>> = if ctx.config.encrypt_on_upload {
            Some(Box::new(AesGcmScheme::generate()))
        } else {
            None
        };

        // Chunk production runs on a blocking thread: the source is a
        // plain reader and must not stall the async workers.
        let (tx, mut rx) = mpsc::channel::<Result<ChunkMsg>>(2);
        let total_size = self.total_size;
        let chunk_size = ctx.config.chunk_size;
        let encrypt = ctx.config.encrypt_on_upload;
        let producer = tokio::task::spawn_blocking(move || {
            let mut reader = match ChunkedReader::new(
                source,
                total_size,
                chunk_size,
                encrypt,
                upload_mask,
                coder,
                scheme,
                hasher,
            ) {
                Ok(r) => r,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return;
                }
            };
            loop {
                match reader.next() {
                    Ok(chunk) => {
                        let is_final = chunk.is_final;
                        if tx.blocking_send(Ok(ChunkMsg::Chunk(chunk))).is_err() {
                            return;
                        }
                        if is_final {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        return;
                    }
                }
            }
            let _ = tx.blocking_send(Ok(ChunkMsg::Done(Box::new(reader.finalize_hashes()))));
        });

        let mut mask = upload_mask;
        let mut result = Ok(());
        while let Some(msg) = rx.recv().await {
            match msg {
                Ok(ChunkMsg::Chunk(mut chunk)) => {
                    if ctx.cancel.is_cancelled() {
                        result = Err(StratusError::Cancelled);
                        break;
                    }
                    if chunk.read_size == 0 {
                        continue;
                    }

                    // One payload per live node, then fan out.
                    let mut payloads = Vec::new();
                    for p in mask.iter() {
                        let data =
                            Bytes::from(std::mem::take(&mut chunk.fragments[p as usize]));
                        payloads.push((
                            p,
                            FragmentPayload {
                                connection_id: connection_id.to_string(),
                                remote_path: self.remote_path.clone(),
                                chunk_index: chunk.index,
                                is_final: chunk.is_final,
                                data,
                            },
                        ));
                    }

                    let sends = payloads.iter().map(|(p, payload)| {
                        let blobber = &ctx.alloc.blobbers[*p as usize];
                        async move {
                            (
                                *p,
                                ctx.transport
                                    .upload_fragment(ctx.alloc, blobber, payload)
                                    .await,
                            )
                        }
                    });

                    let mut last_err = None;
                    for (p, send_result) in join_all(sends).await {
                        if let Err(e) = send_result {
                            warn!(node = p, %e, "fragment upload failed, dropping node");
                            mask.clear(p);
                            last_err = Some(e);
                        }
                    }
                    if mask.count_ones() < ctx.config.consensus_thresh.min(upload_mask.count_ones())
                    {
                        result = Err(last_err.unwrap_or(StratusError::ConsensusNotMet {
                            required: ctx.config.consensus_thresh,
                            achieved: mask.count_ones(),
                            major: None,
                        }));
                        break;
                    }

                    self.uploaded_bytes += chunk.read_size;
                    self.chunk_count += 1;
                    self.status.in_progress(
                        &ctx.alloc.id,
                        &self.remote_path,
                        kind,
                        self.uploaded_bytes,
                        &[],
                    );
                }
                Ok(ChunkMsg::Done(hashes)) => {
                    self.hashes = Some(*hashes);
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        drop(rx);
        if let Err(e) = producer.await {
            warn!(%e, "chunk producer task failed");
        }
        result?;

        let hashes = self.hashes.as_ref().ok_or_else(|| {
            StratusError::Crypto("upload ended without final hashes".to_string())
        })?;

        let file_ref = FileRef {
            remote_path: self.remote_path.clone(),
            name: self.file_name.clone(),
            mime_type: self.mime_type.clone(),
            lookup_hash: lookup_hash(&ctx.alloc.id, &self.remote_path),
            content_hash: Some(hashes.content_hash.clone()),
            size: self.uploaded_bytes,
            chunk_count: self.chunk_count,
        };
        Ok((vec![file_ref], mask))
    }
}

enum ChunkMsg {
    Chunk(stratus_core::ChunkData),
    Done(Box<FileHashes>),
}

/// Dispatch one request per node in `mask`, concurrently. Returns the
/// mask of nodes that acknowledged and the last error observed.
async fn fan_out<'a, F>(
    alloc: &'a Allocation,
    mask: Bitmask,
    f: F,
) -> (Bitmask, Option<StratusError>)
where
    F: Fn(&'a Blobber) -> BoxFuture<'a, Result<()>>,
{
    let calls = mask.iter().map(|p| {
        let fut = f(&alloc.blobbers[p as usize]);
        async move { (p, fut.await) }
    });

    let mut ok = Bitmask::ZERO;
    let mut last_err = None;
    for (p, result) in join_all(calls).await {
        match result {
            Ok(()) => ok.set(p),
            Err(e) => {
                warn!(node = p, %e, "node rejected operation");
                last_err = Some(e);
            }
        }
    }
    (ok, last_err)
}

fn finish_fan_out(
    ok: Bitmask,
    last_err: Option<StratusError>,
    file_ref: FileRef,
    required: usize,
) -> Result<(Vec<FileRef>, Bitmask)> {
    if ok.is_zero() {
        return Err(last_err.unwrap_or(StratusError::ConsensusNotMet {
            required,
            achieved: 0,
            major: None,
        }));
    }
    Ok((vec![file_ref], ok))
}

fn simple_ref(alloc: &Allocation, remote_path: &str) -> FileRef {
    let name = remote_path.rsplit('/').next().unwrap_or("").to_string();
    FileRef {
        remote_path: remote_path.to_string(),
        name,
        mime_type: String::new(),
        lookup_hash: lookup_hash(&alloc.id, remote_path),
        content_hash: None,
        size: 0,
        chunk_count: 0,
    }
}

/// An operation that only tracks progress; exposed so embedders can
/// plug uploads into their own status plumbing without a registry.
pub fn noop_status() -> Arc<dyn StatusCallback> {
    Arc::new(NoopStatus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_rejects_relative_paths() {
        assert!(Operation::delete("docs/a.txt").verify().is_err());
        assert!(Operation::delete("/docs/a.txt").verify().is_ok());
        assert!(Operation::delete("").verify().is_err());
    }

    #[test]
    fn test_verify_rejects_rename_with_slash() {
        assert!(Operation::rename("/a/b.txt", "c/d.txt").verify().is_err());
        assert!(Operation::rename("/a/b.txt", "d.txt").verify().is_ok());
        assert!(Operation::rename("/a/b.txt", "").verify().is_err());
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(OpKind::Upload.as_str(), "upload");
        assert_eq!(OpKind::CreateDir.as_str(), "create_dir");
        assert_eq!(Operation::copy("/a", "/b").kind(), OpKind::Copy);
        assert_eq!(Operation::move_file("/a", "/b").kind(), OpKind::Move);
    }

    #[test]
    fn test_build_change_per_node() {
        let op = Operation::rename("/a/b.txt", "c.txt");
        let refs = vec![FileRef {
            remote_path: "/a/b.txt".to_string(),
            name: "b.txt".to_string(),
            mime_type: String::new(),
            lookup_hash: "lh".to_string(),
            content_hash: None,
            size: 0,
            chunk_count: 0,
        }];
        let changes = op.build_change(&refs, Uuid::new_v4(), 3);
        assert_eq!(changes.len(), 3);
        for c in &changes {
            assert_eq!(c.operation, "rename");
            assert_eq!(c.destination.as_deref(), Some("c.txt"));
            assert_eq!(c.remote_path, "/a/b.txt");
            assert!(c.validation_root.is_none());
        }
        assert_eq!(changes[0].change_id, changes[2].change_id);
    }
}
