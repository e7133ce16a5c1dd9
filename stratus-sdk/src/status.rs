//! Upload status tracking
//!
//! Callers observe long-running transfers through the [`StatusCallback`]
//! trait. The SDK ships a registry-backed implementation: a bounded LRU
//! keyed by the lookup hash of `(allocation_id, remote_path)`, or by a
//! caller-supplied key. Entries are bookkeeping only; they never own any
//! part of the upload pipeline, and eviction simply drops the record.

use crate::operations::OpKind;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use stratus_core::StratusError;
use tracing::debug;

/// Bound on tracked transfers.
pub const STATUS_CAPACITY: usize = 1000;

/// Deterministic digest of `(allocation_id, remote_path)`; the key under
/// which both the SDK and the storage nodes address per-file state.
pub fn lookup_hash(allocation_id: &str, remote_path: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(allocation_id.as_bytes());
    hasher.update(b":");
    hasher.update(remote_path.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Progress callbacks for transfers and repair passes.
pub trait StatusCallback: Send + Sync {
    fn started(&self, allocation_id: &str, remote_path: &str, op: OpKind, total_bytes: u64);

    fn in_progress(
        &self,
        allocation_id: &str,
        remote_path: &str,
        op: OpKind,
        completed_bytes: u64,
        data: &[u8],
    );

    fn completed(
        &self,
        allocation_id: &str,
        remote_path: &str,
        filename: &str,
        mimetype: &str,
        size: u64,
        op: OpKind,
    );

    fn error(&self, allocation_id: &str, remote_path: &str, op: OpKind, err: &StratusError);

    fn repair_completed(&self, files_repaired: usize);
}

/// A no-op callback for callers that do not track progress.
pub struct NoopStatus;

impl StatusCallback for NoopStatus {
    fn started(&self, _: &str, _: &str, _: OpKind, _: u64) {}
    fn in_progress(&self, _: &str, _: &str, _: OpKind, _: u64, _: &[u8]) {}
    fn completed(&self, _: &str, _: &str, _: &str, _: &str, _: u64, _: OpKind) {}
    fn error(&self, _: &str, _: &str, _: OpKind, _: &StratusError) {}
    fn repair_completed(&self, _: usize) {}
}

/// Per-transfer bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct Status {
    pub started: bool,
    pub total_bytes: u64,
    pub completed_bytes: u64,
    pub error: Option<String>,
    pub completed: bool,
    pub lookup_hash: String,
    pub files_repaired: usize,
}

/// Bounded, concurrency-safe store of transfer statuses.
pub struct StatusRegistry {
    items: Mutex<LruCache<String, Status>>,
}

impl StatusRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(LruCache::new(
                NonZeroUsize::new(STATUS_CAPACITY).expect("capacity is non-zero"),
            )),
        })
    }

    /// Snapshot the status stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<Status> {
        self.items.lock().get(key).cloned()
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the entry under `key`.
    pub fn remove(&self, key: &str) {
        self.items.lock().pop(key);
    }

    /// Build a callback handle writing into this registry. With a
    /// caller-supplied key every update lands under that key; otherwise
    /// updates land under the lookup hash of the reported path.
    pub fn callback(self: &Arc<Self>, key: Option<String>) -> Arc<dyn StatusCallback> {
        Arc::new(RegistryCallback {
            registry: Arc::clone(self),
            key,
        })
    }

    fn update(&self, key: &str, f: impl FnOnce(&mut Status)) {
        let mut items = self.items.lock();
        if items.peek(key).is_none() {
            items.put(key.to_string(), Status::default());
        }
        if let Some(status) = items.get_mut(key) {
            f(status);
        }
    }
}

struct RegistryCallback {
    registry: Arc<StatusRegistry>,
    key: Option<String>,
}

impl RegistryCallback {
    fn key_for(&self, allocation_id: &str, remote_path: &str) -> String {
        match &self.key {
            Some(k) => k.clone(),
            None => lookup_hash(allocation_id, remote_path),
        }
    }
}

impl StatusCallback for RegistryCallback {
    fn started(&self, allocation_id: &str, remote_path: &str, op: OpKind, total_bytes: u64) {
        let key = self.key_for(allocation_id, remote_path);
        debug!(path = remote_path, ?op, total_bytes, "status: started");
        let hash = lookup_hash(allocation_id, remote_path);
        self.registry.update(&key, |s| {
            s.started = true;
            s.total_bytes = total_bytes;
            s.lookup_hash = hash;
        });
    }

    fn in_progress(
        &self,
        allocation_id: &str,
        remote_path: &str,
        op: OpKind,
        completed_bytes: u64,
        _data: &[u8],
    ) {
        let key = self.key_for(allocation_id, remote_path);
        debug!(path = remote_path, ?op, completed_bytes, "status: in progress");
        let hash = lookup_hash(allocation_id, remote_path);
        self.registry.update(&key, |s| {
            // Completed is terminal: a straggling progress update from a
            // chunk that raced the completion callback must not wind the
            // counter back.
            if s.completed {
                return;
            }
            s.completed_bytes = completed_bytes;
            s.lookup_hash = hash;
            if s.total_bytes > 0 && completed_bytes >= s.total_bytes {
                s.completed = true;
            }
        });
    }

    fn completed(
        &self,
        allocation_id: &str,
        remote_path: &str,
        _filename: &str,
        _mimetype: &str,
        _size: u64,
        op: OpKind,
    ) {
        let key = self.key_for(allocation_id, remote_path);
        debug!(path = remote_path, ?op, "status: completed");
        let hash = lookup_hash(allocation_id, remote_path);
        self.registry.update(&key, |s| {
            s.completed = true;
            s.completed_bytes = s.total_bytes;
            s.lookup_hash = hash;
        });
    }

    fn error(&self, allocation_id: &str, remote_path: &str, op: OpKind, err: &StratusError) {
        let key = self.key_for(allocation_id, remote_path);
        debug!(path = remote_path, ?op, %err, "status: error");
        let hash = lookup_hash(allocation_id, remote_path);
        self.registry.update(&key, |s| {
            s.error = Some(err.to_string());
            s.lookup_hash = hash;
        });
    }

    fn repair_completed(&self, files_repaired: usize) {
        if let Some(key) = &self.key {
            self.registry.update(key, |s| {
                s.files_repaired = files_repaired;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_hash_is_stable() {
        let a = lookup_hash("alloc", "/a/b.txt");
        let b = lookup_hash("alloc", "/a/b.txt");
        assert_eq!(a, b);
        assert_ne!(a, lookup_hash("alloc", "/a/c.txt"));
        assert_ne!(a, lookup_hash("other", "/a/b.txt"));
    }

    #[test]
    fn test_progress_lifecycle() {
        let registry = StatusRegistry::new();
        let cb = registry.callback(None);

        cb.started("alloc", "/f.bin", OpKind::Upload, 128);
        cb.in_progress("alloc", "/f.bin", OpKind::Upload, 64, &[]);

        let key = lookup_hash("alloc", "/f.bin");
        let status = registry.get(&key).unwrap();
        assert!(status.started);
        assert_eq!(status.total_bytes, 128);
        assert_eq!(status.completed_bytes, 64);
        assert!(!status.completed);

        cb.completed("alloc", "/f.bin", "f.bin", "application/octet-stream", 128, OpKind::Upload);
        let status = registry.get(&key).unwrap();
        assert!(status.completed);
        assert_eq!(status.completed_bytes, 128);
    }

    #[test]
    fn test_completed_is_terminal() {
        let registry = StatusRegistry::new();
        let cb = registry.callback(None);

        cb.started("alloc", "/f.bin", OpKind::Upload, 128);
        cb.completed("alloc", "/f.bin", "f.bin", "", 128, OpKind::Upload);
        cb.in_progress("alloc", "/f.bin", OpKind::Upload, 32, &[]);

        let status = registry.get(&lookup_hash("alloc", "/f.bin")).unwrap();
        assert!(status.completed);
        assert_eq!(status.completed_bytes, 128);
    }

    #[test]
    fn test_caller_supplied_key() {
        let registry = StatusRegistry::new();
        let cb = registry.callback(Some("my-key".to_string()));

        cb.started("alloc", "/f.bin", OpKind::Upload, 10);
        assert!(registry.get("my-key").is_some());
        assert!(registry.get(&lookup_hash("alloc", "/f.bin")).is_none());
    }

    #[test]
    fn test_error_recorded() {
        let registry = StatusRegistry::new();
        let cb = registry.callback(None);
        cb.error(
            "alloc",
            "/f.bin",
            OpKind::Upload,
            &StratusError::Cancelled,
        );
        let status = registry.get(&lookup_hash("alloc", "/f.bin")).unwrap();
        assert_eq!(status.error.as_deref(), Some("Operation cancelled"));
    }

    #[test]
    fn test_lru_bound() {
        let registry = StatusRegistry::new();
        let cb = registry.callback(None);
        for i in 0..(STATUS_CAPACITY + 10) {
            cb.started("alloc", &format!("/f-{i}"), OpKind::Upload, 1);
        }
        assert_eq!(registry.len(), STATUS_CAPACITY);
        // The oldest entries were evicted.
        assert!(registry.get(&lookup_hash("alloc", "/f-0")).is_none());
        assert!(registry
            .get(&lookup_hash("alloc", &format!("/f-{}", STATUS_CAPACITY + 9)))
            .is_some());
    }
}
