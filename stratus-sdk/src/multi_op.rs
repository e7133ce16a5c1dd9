//! Multi-operation coordinator
//!
//! Executes a batch of file mutations across the allocation's nodes in
//! two phases: every operation's process phase fans out concurrently,
//! then, once the quorum gate passes and the write-marker lock is held,
//! the accumulated change records are committed per node. A commit
//! consensus miss rolls back the nodes that did commit.
//!
//! Phase order within a batch:
//!   A. connection establishment (per node, bounded retries)
//!   B. process (parallel fan-out/fan-in, quorum gate)
//!   C. change transpose (per-operation -> per-node)
//!   D. write-marker lock + allocation status probe
//!   E. commit (parallel fan-out/fan-in, consensus decision, rollback)

use crate::allocation::{classify_write_markers, AllocStatus, Allocation};
use crate::config::SdkConfig;
use crate::operations::{OpContext, Operation};
use crate::repair::RepairWorker;
use crate::status::NoopStatus;
use crate::transport::{AllocationChange, BlobberTransport, CommitPayload};
use crate::write_marker::WriteMarkerLock;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stratus_core::{Bitmask, Result, StratusError};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Connection establishment retry budget. Throttling responses do not
/// count against it.
const CONNECTION_ATTEMPTS: u32 = 3;

/// Cooperative cancellation scope of one batch. Tasks observe the flag
/// at their next I/O boundary and abandon.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A batch of operations against one allocation. Lives exactly as long
/// as the batch; nothing is reused across batches except the transport.
pub struct MultiOperation {
    connection_id: String,
    alloc: Arc<Allocation>,
    transport: Arc<dyn BlobberTransport>,
    config: SdkConfig,
    operations: Vec<Operation>,

    /// Nodes taking part in this batch. Full allocation by default;
    /// repair batches restrict it.
    participants: Bitmask,
    consensus_thresh: usize,

    /// Nodes that acknowledged connection setup and every process
    /// phase. The sole authoritative record of "live this batch".
    operation_mask: Arc<Mutex<Bitmask>>,
    cancel: CancelFlag,

    /// Repair batches skip the allocation status probe: they run while
    /// the allocation is in its repair state by definition.
    skip_status_probe: bool,
}

impl MultiOperation {
    pub fn new(
        alloc: Arc<Allocation>,
        transport: Arc<dyn BlobberTransport>,
        config: SdkConfig,
        operations: Vec<Operation>,
    ) -> Result<Self> {
        alloc.validate()?;
        config.validate()?;
        if operations.is_empty() {
            return Err(StratusError::InvalidParameter {
                name: "operations",
                reason: "batch is empty".to_string(),
            });
        }
        for op in &operations {
            op.verify()?;
        }

        let participants = Bitmask::full(alloc.total_blobbers());
        let consensus_thresh = config.consensus_thresh;
        Ok(Self {
            connection_id: Uuid::new_v4().to_string(),
            alloc,
            transport,
            config,
            operations,
            participants,
            consensus_thresh,
            operation_mask: Arc::new(Mutex::new(Bitmask::ZERO)),
            cancel: CancelFlag::new(),
            skip_status_probe: false,
        })
    }

    /// Batch restricted to `participants`, requiring every one of them;
    /// how the repair worker drives masked uploads and deletes.
    pub(crate) fn for_repair(
        alloc: Arc<Allocation>,
        transport: Arc<dyn BlobberTransport>,
        config: SdkConfig,
        operations: Vec<Operation>,
        participants: Bitmask,
    ) -> Result<Self> {
        let mut batch = Self::new(alloc, transport, config, operations)?;
        batch.participants = participants;
        batch.consensus_thresh = participants.count_ones();
        // Operations read the threshold from the config they are handed;
        // keep it in step with the batch override.
        batch.config.consensus_thresh = batch.consensus_thresh;
        batch.skip_status_probe = true;
        Ok(batch)
    }

    /// Cancellation handle for the batch.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Run the batch to completion.
    ///
    /// Returns `Err(RetryOperation)` when the allocation status probe
    /// diverted the batch into a repair pass; the caller retries the
    /// whole batch afterwards.
    #[instrument(skip(self), fields(alloc = %self.alloc.id, ops = self.operations.len()))]
    pub async fn run(&mut self) -> Result<()> {
        info!(connection_id = %self.connection_id, "batch starting");

        self.establish_connections().await;
        let by_blobber = self.process_phase().await?;
        self.commit_phase(by_blobber).await
    }

    // ===== Phase A =====

    async fn establish_connections(&self) {
        let setups = self.participants.iter().map(|p| async move {
            let blobber = &self.alloc.blobbers[p as usize];
            (p, self.establish_connection(p).await, &blobber.base_url)
        });

        for (p, result, base_url) in join_all(setups).await {
            match result {
                Ok(()) => {
                    debug!(node = %base_url, "connection established");
                    self.operation_mask.lock().set(p);
                }
                Err(e) => warn!(node = %base_url, %e, "connection setup failed"),
            }
        }
    }

    async fn establish_connection(&self, blobber_idx: u32) -> Result<()> {
        let blobber = &self.alloc.blobbers[blobber_idx as usize];
        let mut attempts = 0;
        let mut last_err: Option<StratusError> = None;

        while attempts < CONNECTION_ATTEMPTS {
            if self.cancel.is_cancelled() {
                return Err(StratusError::Cancelled);
            }

            let call = self
                .transport
                .create_connection(&self.alloc, blobber, &self.connection_id);
            match timeout(self.config.connection_timeout(), call).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(StratusError::RateLimited { retry_after_secs })) => {
                    // Throttling honors the advertised delay and does
                    // not consume the retry budget.
                    debug!(node = %blobber.base_url, retry_after_secs, "throttled");
                    sleep(Duration::from_secs(retry_after_secs)).await;
                }
                Ok(Err(e @ StratusError::BlobberReject { .. })) => return Err(e),
                Ok(Err(e)) => {
                    last_err = Some(e);
                    attempts += 1;
                }
                Err(_) => {
                    last_err = Some(StratusError::Transport(format!(
                        "connection attempt to {} timed out",
                        blobber.base_url
                    )));
                    attempts += 1;
                }
            }
        }

        // Always surface the last concrete error, or synthesize one if
        // the budget ran out without recording any.
        Err(last_err.unwrap_or_else(|| {
            StratusError::Transport("unknown_issue: connection retry budget exhausted".to_string())
        }))
    }

    // ===== Phases B and C =====

    async fn process_phase(&mut self) -> Result<Vec<Vec<AllocationChange>>> {
        let n_blobbers = self.alloc.total_blobbers();

        // The process phase recomputes the mask from operation
        // acknowledgements; connection bits were advisory.
        *self.operation_mask.lock() = Bitmask::ZERO;

        let operations = std::mem::take(&mut self.operations);
        let n_ops = operations.len();

        let alloc = Arc::clone(&self.alloc);
        let transport = Arc::clone(&self.transport);
        let config = self.config.clone();
        let cancel = self.cancel.clone();
        let connection_id = self.connection_id.clone();

        let tasks = operations.into_iter().map(|mut op| {
            let alloc = Arc::clone(&alloc);
            let transport = Arc::clone(&transport);
            let config = config.clone();
            let cancel = cancel.clone();
            let connection_id = connection_id.clone();
            async move {
                if cancel.is_cancelled() {
                    return (op, Err(StratusError::Cancelled));
                }
                let ctx = OpContext {
                    alloc: &alloc,
                    transport: transport.as_ref(),
                    config: &config,
                    cancel: &cancel,
                };
                let result = op.process(&ctx, &connection_id).await;
                if let Err(e) = &result {
                    error!(path = op.remote_path(), %e, "process phase failed");
                    cancel.cancel();
                }
                (op, result)
            }
        });

        // Fan-in barrier: nothing proceeds until every operation task
        // has joined.
        let results = join_all(tasks).await;

        let mut errors = Vec::new();
        let mut changes: Vec<Vec<AllocationChange>> = vec![Vec::new(); n_ops];
        let mut operations = Vec::with_capacity(n_ops);
        for (idx, (op, result)) in results.into_iter().enumerate() {
            match result {
                Ok((refs, add_mask)) => {
                    let mut mask = self.operation_mask.lock();
                    *mask = *mask | add_mask;
                    drop(mask);
                    changes[idx] = op.build_change(&refs, Uuid::new_v4(), n_blobbers);
                }
                Err(e) => errors.push(e),
            }
            operations.push(op);
        }
        self.operations = operations;

        // Quorum gate.
        let achieved = self.operation_mask.lock().count_ones();
        if achieved < self.consensus_thresh || self.cancel.is_cancelled() {
            let major = major_error(&errors);
            warn!(
                required = self.consensus_thresh,
                achieved, "process phase below consensus"
            );
            return Err(StratusError::ConsensusNotMet {
                required: self.consensus_thresh,
                achieved,
                major,
            });
        }

        Ok(transpose(changes, n_blobbers))
    }

    // ===== Phases D and E =====

    async fn commit_phase(&mut self, mut by_blobber: Vec<Vec<AllocationChange>>) -> Result<()> {
        let mask = *self.operation_mask.lock();

        let lock = WriteMarkerLock::acquire(
            self.transport.as_ref(),
            &self.alloc,
            mask,
            self.consensus_thresh,
            self.config.lock_timeout(),
            &self.connection_id,
        )
        .await?;
        debug!("write marker locked");

        if !self.skip_status_probe {
            match self.probe_alloc_status(mask).await {
                AllocStatus::Commit => {}
                AllocStatus::Repair => {
                    info!("allocation needs repair before committing");
                    lock.release(self.transport.as_ref(), &self.alloc, &self.connection_id)
                        .await;
                    self.run_repair_pass().await;
                    return Err(StratusError::RetryOperation);
                }
                AllocStatus::Broken => {
                    warn!("allocation status probe found no agreement");
                    lock.release(self.transport.as_ref(), &self.alloc, &self.connection_id)
                        .await;
                    return Err(StratusError::RetryOperation);
                }
            }
        }

        // Commit fan-out. One clock read orders this batch's changes on
        // every node; cancellation does not reach in here, commits must
        // drain so the consensus count is meaningful.
        let timestamp = chrono::Utc::now().timestamp_millis();
        let commit_timeout = self.config.commit_timeout();
        let commits = mask.iter().map(|p| {
            let payload = CommitPayload {
                allocation_id: self.alloc.id.clone(),
                connection_id: self.connection_id.clone(),
                timestamp,
                changes: std::mem::take(&mut by_blobber[p as usize]),
            };
            let blobber = self.alloc.blobbers[p as usize].clone();
            let alloc = self.alloc.clone();
            let transport = self.transport.clone();
            async move {
                let result =
                    timeout(commit_timeout, transport.commit(&alloc, &blobber, &payload))
                        .await;
                match result {
                    Ok(Ok(())) => {
                        info!(node = %blobber.base_url, "commit success");
                        (p, true)
                    }
                    Ok(Err(e)) => {
                        warn!(node = %blobber.base_url, %e, "commit failed");
                        (p, false)
                    }
                    Err(_) => {
                        warn!(node = %blobber.base_url, "commit timed out");
                        (p, false)
                    }
                }
            }
        });
        let results = join_all(commits).await;

        lock.release(self.transport.as_ref(), &self.alloc, &self.connection_id)
            .await;

        let mut commit_consensus = 0usize;
        let mut rollback_mask = Bitmask::ZERO;
        for (p, ok) in results {
            if ok {
                commit_consensus += 1;
                rollback_mask.set(p);
            }
        }

        if commit_consensus >= self.consensus_thresh {
            for op in &self.operations {
                op.completed(&self.alloc);
            }
            info!(commit_consensus, "batch committed");
            return Ok(());
        }

        if commit_consensus > 0 {
            self.rollback(rollback_mask).await;
        }
        let err = StratusError::ConsensusNotMet {
            required: self.consensus_thresh,
            achieved: commit_consensus,
            major: None,
        };
        for op in &self.operations {
            op.error(&self.alloc, commit_consensus, &err);
        }
        Err(err)
    }

    async fn probe_alloc_status(&self, mask: Bitmask) -> AllocStatus {
        let probes = mask.iter().map(|p| {
            let blobber = &self.alloc.blobbers[p as usize];
            async move {
                match self.transport.latest_write_marker(&self.alloc, blobber).await {
                    Ok(seq) => seq,
                    Err(e) => {
                        warn!(node = %blobber.base_url, %e, "status probe failed");
                        None
                    }
                }
            }
        });
        let sequences: Vec<Option<u64>> = join_all(probes).await;
        classify_write_markers(&sequences)
    }

    async fn run_repair_pass(&self) {
        let mut worker = RepairWorker::new(
            Arc::clone(&self.alloc),
            Arc::clone(&self.transport),
            self.config.clone(),
            None,
            Arc::new(NoopStatus),
        );
        match worker.run("/").await {
            Ok(repaired) => info!(repaired, "repair pass finished"),
            Err(e) => error!(%e, "repair pass failed"),
        }
    }

    /// Best-effort undo on the nodes that committed. Errors are logged
    /// and swallowed; they never displace the consensus error.
    async fn rollback(&self, rollback_mask: Bitmask) {
        info!(nodes = rollback_mask.count_ones(), "rolling back committed nodes");
        let calls = rollback_mask.iter().map(|p| {
            let blobber = &self.alloc.blobbers[p as usize];
            async move {
                if let Err(e) = self
                    .transport
                    .rollback(&self.alloc, blobber, &self.connection_id)
                    .await
                {
                    warn!(node = %blobber.base_url, %e, "rollback failed");
                }
            }
        });
        join_all(calls).await;
    }
}

/// Pivot per-operation change lists into per-node change lists. Within
/// one node, changes keep the caller's operation order.
fn transpose(changes: Vec<Vec<AllocationChange>>, n_blobbers: usize) -> Vec<Vec<AllocationChange>> {
    let mut by_blobber: Vec<Vec<AllocationChange>> = vec![Vec::new(); n_blobbers];
    for op_changes in changes {
        for (b, change) in op_changes.into_iter().enumerate() {
            if b < n_blobbers {
                by_blobber[b].push(change);
            }
        }
    }
    by_blobber
}

/// Most frequent error across a batch, by display identity.
fn major_error(errors: &[StratusError]) -> Option<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for e in errors {
        *counts.entry(e.identity()).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(msg, _)| msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(op: &str, path: &str) -> AllocationChange {
        AllocationChange {
            change_id: "c".to_string(),
            operation: op.to_string(),
            remote_path: path.to_string(),
            destination: None,
            size: 0,
            lookup_hash: String::new(),
            content_hash: None,
            validation_root: None,
            fixed_merkle_root: None,
        }
    }

    #[test]
    fn test_transpose_pivots_and_keeps_order() {
        // Two operations, three nodes.
        let changes = vec![
            vec![change("upload", "/a"), change("upload", "/a"), change("upload", "/a")],
            vec![change("delete", "/b"), change("delete", "/b"), change("delete", "/b")],
        ];
        let by_blobber = transpose(changes, 3);
        assert_eq!(by_blobber.len(), 3);
        for node_changes in &by_blobber {
            assert_eq!(node_changes.len(), 2);
            assert_eq!(node_changes[0].operation, "upload");
            assert_eq!(node_changes[1].operation, "delete");
        }
    }

    #[test]
    fn test_transpose_empty() {
        let by_blobber = transpose(Vec::new(), 4);
        assert_eq!(by_blobber.len(), 4);
        assert!(by_blobber.iter().all(|c| c.is_empty()));
    }

    #[test]
    fn test_major_error_votes() {
        let errors = vec![
            StratusError::Cancelled,
            StratusError::Transport("refused".to_string()),
            StratusError::Transport("refused".to_string()),
        ];
        assert_eq!(
            major_error(&errors).as_deref(),
            Some("Transport error: refused")
        );
        assert_eq!(major_error(&[]), None);
    }

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
