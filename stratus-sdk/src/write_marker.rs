//! Write-marker mutex
//!
//! Allocation-scoped distributed lock serializing concurrent batches.
//! The lock is held when a consensus threshold of nodes has acknowledged
//! a lock request carrying the batch connection id; node-side leases
//! expire on their own, so release failures are logged and swallowed.

use crate::allocation::Allocation;
use crate::transport::BlobberTransport;
use futures::future::join_all;
use std::time::Duration;
use stratus_core::{Bitmask, Result, StratusError};
use tokio::time::timeout;
use tracing::{debug, warn};

/// A held write-marker lock. Release it on every exit path; the lease
/// makes a missed release survivable but slow.
#[must_use = "the lock must be released on every exit path"]
#[derive(Debug)]
pub struct WriteMarkerLock {
    acquired: Bitmask,
}

impl WriteMarkerLock {
    /// Acquire the lock on the nodes in `mask`, requiring `required`
    /// acknowledgements within `window`. On failure every acquired node
    /// is unlocked again, best-effort.
    pub async fn acquire(
        transport: &dyn BlobberTransport,
        alloc: &Allocation,
        mask: Bitmask,
        required: usize,
        window: Duration,
        connection_id: &str,
    ) -> Result<Self> {
        let attempts = mask.iter().map(|p| {
            let blobber = &alloc.blobbers[p as usize];
            async move {
                let result = timeout(
                    window,
                    transport.lock_write_marker(alloc, blobber, connection_id),
                )
                .await;
                match result {
                    Ok(Ok(())) => (p, true),
                    Ok(Err(e)) => {
                        warn!(node = %blobber.base_url, %e, "lock request rejected");
                        (p, false)
                    }
                    Err(_) => {
                        warn!(node = %blobber.base_url, "lock request timed out");
                        (p, false)
                    }
                }
            }
        });

        let mut acquired = Bitmask::ZERO;
        for (p, ok) in join_all(attempts).await {
            if ok {
                acquired.set(p);
            }
        }

        let achieved = acquired.count_ones();
        if achieved >= required {
            debug!(achieved, required, "write-marker lock acquired");
            return Ok(Self { acquired });
        }

        let partial = Self { acquired };
        partial.release(transport, alloc, connection_id).await;
        Err(StratusError::LockUnavailable { required, achieved })
    }

    /// Nodes currently holding the lock for this batch.
    pub fn acquired(&self) -> Bitmask {
        self.acquired
    }

    /// Release on every acquired node. Errors are logged and swallowed;
    /// the node-side lease expires regardless.
    pub async fn release(
        self,
        transport: &dyn BlobberTransport,
        alloc: &Allocation,
        connection_id: &str,
    ) {
        let calls = self.acquired.iter().map(|p| {
            let blobber = &alloc.blobbers[p as usize];
            async move {
                if let Err(e) = transport
                    .unlock_write_marker(alloc, blobber, connection_id)
                    .await
                {
                    warn!(node = %blobber.base_url, %e, "unlock failed, lease will expire");
                }
            }
        });
        join_all(calls).await;
    }
}
