use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Acquisitions between idle-entry sweeps
const SWEEP_INTERVAL: usize = 256;

/// Per-document advisory locks.
///
/// Concurrent sync tasks touching the same document serialize their
/// read-modify-write of its ACL/document-set fields here; tasks for distinct
/// documents never contend. Idle entries are swept periodically so the map
/// stays proportional to the working set instead of every id ever locked.
#[derive(Clone, Default)]
pub struct DocumentLockRegistry {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    acquisitions: Arc<AtomicUsize>,
}

impl DocumentLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the advisory lock for a document id, waiting if another task
    /// holds it. The guard releases on drop, on every exit path.
    pub async fn acquire(&self, doc_id: &str) -> OwnedMutexGuard<()> {
        if self.acquisitions.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL
            == SWEEP_INTERVAL - 1
        {
            self.sweep_idle();
        }

        let lock = self
            .locks
            .entry(doc_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop entries no task holds or waits on. A holder or waiter keeps a
    /// clone of the Arc (the guard owns one), so the strong count stays above one
    /// until the lock is truly idle.
    fn sweep_idle(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}
