//! Repair worker
//!
//! Walks the remote directory tree, diagnoses per-file shard divergence
//! across the allocation's nodes, and restores consensus: minority
//! shards are deleted, missing shards are rebuilt by re-uploading the
//! file to exactly the nodes that lack the canonical copy. When no local
//! copy exists the file is streamed down from the canonical nodes and
//! straight back up through a bounded channel, download and upload
//! running concurrently.

use crate::allocation::Allocation;
use crate::config::SdkConfig;
use crate::multi_op::{CancelFlag, MultiOperation};
use crate::operations::{Operation, UploadSource};
use crate::status::StatusCallback;
use crate::transport::{BlobberTransport, EntryKind, FileMeta};
use futures::future::{join_all, BoxFuture};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use stratus_core::{Bitmask, ErasureConfig, ErasureEncoder, Result, StratusError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// Bound of the download-to-upload pipe, in chunks.
const REPAIR_PIPE_CHUNKS: usize = 10;

/// Merged view of one remote entry across the allocation's nodes.
#[derive(Debug, Clone)]
pub struct DirListing {
    pub remote_path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub children: Vec<DirListing>,
    /// Nodes that know the entry.
    pub present_mask: Bitmask,
}

/// Outcome of diagnosing one file.
#[derive(Debug, Clone)]
pub struct RepairDiagnosis {
    /// Nodes holding the canonical copy.
    pub found: Bitmask,
    /// Nodes holding a divergent minority copy that must be discarded.
    pub delete_mask: Bitmask,
    /// True iff the file needs reconstruction.
    pub required: bool,
    /// Metadata of the canonical copy.
    pub file_ref: FileMeta,
}

/// One repair pass over (a subtree of) an allocation.
pub struct RepairWorker {
    alloc: Arc<Allocation>,
    transport: Arc<dyn BlobberTransport>,
    config: SdkConfig,
    /// Root of local copies, for files that still exist on disk.
    local_root: Option<PathBuf>,
    status: Arc<dyn StatusCallback>,
    cancel: CancelFlag,
    files_repaired: usize,
}

impl RepairWorker {
    pub fn new(
        alloc: Arc<Allocation>,
        transport: Arc<dyn BlobberTransport>,
        config: SdkConfig,
        local_root: Option<PathBuf>,
        status: Arc<dyn StatusCallback>,
    ) -> Self {
        Self {
            alloc,
            transport,
            config,
            local_root,
            status,
            cancel: CancelFlag::new(),
            files_repaired: 0,
        }
    }

    /// Cancellation handle; checked between every repair step.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Pre-order pass over the subtree rooted at `root`. Returns the
    /// number of files brought back to consensus; file-level failures
    /// are logged and skipped, never retried within one pass.
    #[instrument(skip(self), fields(alloc = %self.alloc.id))]
    pub async fn run(&mut self, root: &str) -> Result<usize> {
        info!(root, "repair pass starting");
        let root_listing = self.fetch_listing(root.to_string(), false).await?;
        let root_path = root_listing.remote_path.clone();

        let mut stack = vec![root_listing];
        while let Some(entry) = stack.pop() {
            if self.check_cancel() {
                break;
            }
            match entry.kind {
                EntryKind::Directory => {
                    // An unexpanded directory is re-fetched with full
                    // recursion before being walked.
                    let entry = if entry.children.is_empty() {
                        match self.fetch_listing(entry.remote_path.clone(), true).await {
                            Ok(fresh) => fresh,
                            Err(e) => {
                                error!(path = %entry.remote_path, %e, "listing failed");
                                continue;
                            }
                        }
                    } else {
                        entry
                    };

                    if entry.children.is_empty() {
                        self.clean_minority_dir(&entry, &root_path).await;
                    } else {
                        for child in entry.children.into_iter().rev() {
                            stack.push(child);
                        }
                    }
                }
                EntryKind::File => self.repair_file(&entry.remote_path).await,
            }
        }

        self.status.repair_completed(self.files_repaired);
        info!(files_repaired = self.files_repaired, "repair pass finished");
        Ok(self.files_repaired)
    }

    /// An empty directory present on fewer nodes than the data-shard
    /// threshold is a leftover from a failed batch; purge it.
    async fn clean_minority_dir(&mut self, entry: &DirListing, root_path: &str) {
        let present = entry.present_mask;
        if entry.remote_path == root_path
            || present.is_zero()
            || present.count_ones() >= self.alloc.data_shards
        {
            return;
        }
        info!(path = %entry.remote_path, "deleting minority directory");
        if self.delete_on(&entry.remote_path, present).await.is_ok() {
            self.files_repaired += 1;
        }
    }

    /// Diagnose one file: which nodes hold the canonical copy, which
    /// hold divergent copies, and whether reconstruction is needed.
    pub async fn repair_required(&self, remote_path: &str) -> Result<RepairDiagnosis> {
        let probes = self.alloc.blobbers.iter().map(|b| async move {
            match self.transport.file_meta(&self.alloc, b, remote_path).await {
                Ok(meta) => (b.index, meta),
                Err(e) => {
                    warn!(node = %b.base_url, %e, "file meta unavailable");
                    (b.index, None)
                }
            }
        });
        let metas = join_all(probes).await;

        diagnose(metas, self.config.full_consensus).ok_or_else(|| {
            StratusError::Transport(format!("no node holds metadata for {remote_path}"))
        })
    }

    async fn repair_file(&mut self, remote_path: &str) {
        if self.check_cancel() {
            return;
        }
        debug!(path = remote_path, "checking file");

        let diag = match self.repair_required(remote_path).await {
            Ok(d) => d,
            Err(e) => {
                error!(path = remote_path, %e, "diagnosis failed");
                return;
            }
        };

        if diag.required {
            info!(path = remote_path, found = diag.found.count_ones(), "repair required");
            if diag.found.count_ones() >= self.alloc.data_shards {
                // Reconstructable: discard divergent copies, then
                // restore the missing shards.
                if !diag.delete_mask.is_zero()
                    && self.delete_on(remote_path, diag.delete_mask).await.is_err()
                {
                    return;
                }
                if self.check_cancel() {
                    return;
                }
                if self.repair_by_upload(remote_path, &diag).await.is_err() {
                    return;
                }
            } else {
                // Unrecoverable: purge the orphaned shards.
                info!(path = remote_path, "repair by delete");
                if self.delete_on(remote_path, diag.found).await.is_err() {
                    return;
                }
            }
            info!(path = remote_path, "file repaired");
            self.files_repaired += 1;
        } else if !diag.delete_mask.is_zero() {
            info!(path = remote_path, "deleting minority shards");
            if self.delete_on(remote_path, diag.delete_mask).await.is_err() {
                return;
            }
            self.files_repaired += 1;
        }
    }

    async fn repair_by_upload(&self, remote_path: &str, diag: &RepairDiagnosis) -> Result<()> {
        let n = self.alloc.total_blobbers();
        let target = diag.found.complement_within(n);
        if target.is_zero() {
            return Ok(());
        }

        let mut config = self.config.clone();
        config.encrypt_on_upload = diag.file_ref.encrypted;

        if let Some(local_path) = self.local_file_for(remote_path) {
            info!(path = remote_path, local = %local_path.display(), "repair from local copy");
            let file = std::fs::File::open(&local_path)?;
            return self
                .run_upload_batch(remote_path, &diag.file_ref, target, Box::new(file), config)
                .await;
        }

        if diag.file_ref.encrypted {
            // Re-encrypting requires the plaintext, which only a local
            // copy can provide.
            warn!(path = remote_path, "encrypted file has no local copy, skipping");
            return Err(StratusError::Crypto(
                "cannot rebuild encrypted shards without a local copy".to_string(),
            ));
        }

        info!(path = remote_path, "repair by download");
        let per_read = config.chunk_size * self.alloc.data_shards;
        let (tx, rx) = mpsc::channel(REPAIR_PIPE_CHUNKS);
        let download = tokio::spawn(download_file_stream(
            Arc::clone(&self.transport),
            Arc::clone(&self.alloc),
            remote_path.to_string(),
            diag.file_ref.clone(),
            diag.found,
            per_read as u64,
            tx,
        ));

        let source = Box::new(ChannelReader::new(rx));
        // Upload failure drops the receiver, which stops the download;
        // download failure surfaces through the channel as a read error.
        let result = self
            .run_upload_batch(remote_path, &diag.file_ref, target, source, config)
            .await;
        let _ = download.await;
        result
    }

    async fn run_upload_batch(
        &self,
        remote_path: &str,
        file_ref: &FileMeta,
        target: Bitmask,
        source: UploadSource,
        config: SdkConfig,
    ) -> Result<()> {
        let file_name = remote_path.rsplit('/').next().unwrap_or("").to_string();
        let op = Operation::repair_upload(
            remote_path,
            file_name,
            file_ref.size,
            source,
            Arc::clone(&self.status),
            target,
        );
        let mut batch = MultiOperation::for_repair(
            Arc::clone(&self.alloc),
            Arc::clone(&self.transport),
            config,
            vec![op],
            target,
        )?;
        Box::pin(batch.run()).await.map_err(|e| {
            error!(path = remote_path, %e, "repair upload failed");
            e
        })
    }

    async fn delete_on(&self, remote_path: &str, mask: Bitmask) -> Result<()> {
        let op = Operation::delete_masked(remote_path, mask);
        let mut batch = MultiOperation::for_repair(
            Arc::clone(&self.alloc),
            Arc::clone(&self.transport),
            self.config.clone(),
            vec![op],
            mask,
        )?;
        Box::pin(batch.run()).await.map_err(|e| {
            error!(path = remote_path, %e, "shard delete failed");
            e
        })
    }

    fn local_file_for(&self, remote_path: &str) -> Option<PathBuf> {
        let root = self.local_root.as_ref()?;
        let path = root.join(remote_path.trim_start_matches('/'));
        match std::fs::metadata(&path) {
            Ok(m) if m.is_file() => Some(path),
            _ => None,
        }
    }

    fn check_cancel(&self) -> bool {
        if self.cancel.is_cancelled() {
            info!("repair cancelled");
            true
        } else {
            false
        }
    }

    /// One level of the merged tree, or the whole subtree when
    /// `recursive` is set.
    fn fetch_listing(&self, path: String, recursive: bool) -> BoxFuture<'_, Result<DirListing>> {
        Box::pin(async move {
            let lists = join_all(self.alloc.blobbers.iter().map(|b| {
                let path = path.clone();
                async move { (b.index, self.transport.list_dir(&self.alloc, b, &path).await) }
            }))
            .await;

            let mut present = Bitmask::ZERO;
            let mut merged: BTreeMap<String, (EntryKind, u64, Bitmask)> = BTreeMap::new();
            for (idx, result) in lists {
                match result {
                    Ok(entries) => {
                        present.set(idx);
                        for e in entries {
                            let slot = merged
                                .entry(e.remote_path)
                                .or_insert((e.kind, e.size, Bitmask::ZERO));
                            slot.2.set(idx);
                        }
                    }
                    Err(e) => debug!(node = idx, %e, "listing unavailable"),
                }
            }
            if present.is_zero() {
                return Err(StratusError::Transport(format!("no node could list {path}")));
            }

            let mut children = Vec::new();
            for (child_path, (kind, size, mask)) in merged {
                if kind == EntryKind::Directory && recursive {
                    match self.fetch_listing(child_path.clone(), true).await {
                        Ok(mut full) => {
                            full.present_mask = mask;
                            children.push(full);
                            continue;
                        }
                        Err(e) => {
                            warn!(path = %child_path, %e, "child listing failed");
                        }
                    }
                }
                children.push(DirListing {
                    remote_path: child_path,
                    kind,
                    size,
                    children: Vec::new(),
                    present_mask: mask,
                });
            }

            Ok(DirListing {
                remote_path: path,
                kind: EntryKind::Directory,
                size: 0,
                children,
                present_mask: present,
            })
        })
    }
}

/// Group per-node metadata by content identity. The largest group is
/// canonical (ties break toward the group containing the lowest node
/// index); every strictly smaller group must be discarded. Returns
/// `None` when no node knows the file.
fn diagnose(metas: Vec<(u32, Option<FileMeta>)>, full_consensus: usize) -> Option<RepairDiagnosis> {
    let mut groups: Vec<(Bitmask, FileMeta)> = Vec::new();
    for (idx, meta) in metas {
        let Some(meta) = meta else { continue };
        match groups.iter_mut().find(|(_, m)| {
            m.content_hash == meta.content_hash && m.chunk_count == meta.chunk_count
        }) {
            Some((mask, _)) => mask.set(idx),
            None => groups.push((Bitmask::single(idx), meta)),
        }
    }

    let canonical = groups
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a.0.count_ones()
                .cmp(&b.0.count_ones())
                .then_with(|| b.0.trailing_zeros().cmp(&a.0.trailing_zeros()))
        })
        .map(|(i, _)| i)?;

    let found = groups[canonical].0;
    let mut delete_mask = Bitmask::ZERO;
    for (i, (mask, _)) in groups.iter().enumerate() {
        if i != canonical {
            delete_mask = delete_mask | *mask;
        }
    }

    Some(RepairDiagnosis {
        found,
        delete_mask,
        required: found.count_ones() < full_consensus,
        file_ref: groups.into_iter().nth(canonical).map(|(_, m)| m)?,
    })
}

/// Streams a file down from the canonical nodes, one decoded chunk at a
/// time, into the repair pipe.
async fn download_file_stream(
    transport: Arc<dyn BlobberTransport>,
    alloc: Arc<Allocation>,
    remote_path: String,
    file_ref: FileMeta,
    found: Bitmask,
    per_read: u64,
    tx: mpsc::Sender<std::result::Result<Vec<u8>, String>>,
) {
    let coder = match ErasureConfig::new(alloc.data_shards, alloc.parity_shards)
        .and_then(ErasureEncoder::new)
    {
        Ok(c) => c,
        Err(e) => {
            let _ = tx.send(Err(e.to_string())).await;
            return;
        }
    };

    let n = alloc.total_blobbers();
    let mut remaining = file_ref.size;
    for chunk_index in 0..file_ref.chunk_count {
        let fetches = found.iter().map(|p| {
            let blobber = &alloc.blobbers[p as usize];
            let remote_path = &remote_path;
            let alloc = &alloc;
            let transport = &transport;
            async move {
                (
                    p,
                    transport
                        .download_fragment(alloc, blobber, remote_path, chunk_index as u32)
                        .await,
                )
            }
        });

        let mut shards: Vec<Option<Vec<u8>>> = vec![None; n];
        for (p, result) in join_all(fetches).await {
            match result {
                Ok(bytes) => shards[p as usize] = Some(bytes.to_vec()),
                Err(e) => warn!(node = p, chunk_index, %e, "fragment download failed"),
            }
        }

        let take = remaining.min(per_read) as usize;
        match coder.decode(&mut shards, take) {
            Ok(plain) => {
                if tx.send(Ok(plain.to_vec())).await.is_err() {
                    // Receiver gone: the upload side aborted.
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(format!("chunk {chunk_index}: {e}"))).await;
                return;
            }
        }
        remaining = remaining.saturating_sub(take as u64);
    }
}

/// Blocking reader over the repair pipe; lives on the upload side's
/// chunk-producer thread.
struct ChannelReader {
    rx: mpsc::Receiver<std::result::Result<Vec<u8>, String>>,
    pending: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<std::result::Result<Vec<u8>, String>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.pending.len() {
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Some(Err(msg)) => {
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, msg))
                }
                None => return Ok(0),
            }
        }
        let n = (self.pending.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(content: &str, chunks: u64) -> Option<FileMeta> {
        Some(FileMeta {
            remote_path: "/f".to_string(),
            lookup_hash: "lh".to_string(),
            content_hash: content.to_string(),
            chunk_count: chunks,
            size: 100,
            encrypted: false,
        })
    }

    #[test]
    fn test_diagnose_all_agree() {
        let diag = diagnose(
            vec![(0, meta("h", 2)), (1, meta("h", 2)), (2, meta("h", 2))],
            3,
        )
        .unwrap();
        assert_eq!(diag.found.bits(), 0b111);
        assert!(diag.delete_mask.is_zero());
        assert!(!diag.required);
    }

    #[test]
    fn test_diagnose_minority_divergence() {
        // The divergent copy is discarded and its node re-fed the
        // canonical shards, so the file needs reconstruction.
        let diag = diagnose(
            vec![(0, meta("h", 2)), (1, meta("h", 2)), (2, meta("x", 2))],
            3,
        )
        .unwrap();
        assert_eq!(diag.found.bits(), 0b011);
        assert_eq!(diag.delete_mask.bits(), 0b100);
        assert!(diag.required);
        assert_eq!(diag.file_ref.content_hash, "h");
    }

    #[test]
    fn test_diagnose_divergent_and_missing() {
        let diag = diagnose(
            vec![(0, meta("h", 2)), (1, None), (2, meta("x", 2))],
            3,
        )
        .unwrap();
        assert_eq!(diag.found.bits(), 0b001);
        assert_eq!(diag.delete_mask.bits(), 0b100);
        assert!(diag.required);
    }

    #[test]
    fn test_diagnose_missing_node() {
        let diag = diagnose(vec![(0, meta("h", 2)), (1, None), (2, meta("h", 2))], 3).unwrap();
        assert_eq!(diag.found.bits(), 0b101);
        assert!(diag.delete_mask.is_zero());
        assert!(diag.required);
    }

    #[test]
    fn test_diagnose_tie_prefers_lowest_index() {
        let diag = diagnose(vec![(0, meta("a", 1)), (1, meta("b", 1))], 2).unwrap();
        assert_eq!(diag.found.bits(), 0b01);
        assert_eq!(diag.delete_mask.bits(), 0b10);
        assert_eq!(diag.file_ref.content_hash, "a");
    }

    #[test]
    fn test_diagnose_nothing_found() {
        assert!(diagnose(vec![(0, None), (1, None)], 2).is_none());
    }

    #[test]
    fn test_channel_reader_streams_and_ends() {
        let (tx, rx) = mpsc::channel(4);
        tx.blocking_send(Ok(vec![1, 2, 3])).unwrap();
        tx.blocking_send(Ok(vec![4, 5])).unwrap();
        drop(tx);

        let mut reader = ChannelReader::new(rx);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_channel_reader_surfaces_errors() {
        let (tx, rx) = mpsc::channel(4);
        tx.blocking_send(Err("download died".to_string())).unwrap();
        drop(tx);

        let mut reader = ChannelReader::new(rx);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.to_string(), "download died");
    }
}
