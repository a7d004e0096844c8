//! Worker pool: a fixed set of slots bounding how many jobs run at once.

use batchgate_core::WorkerId;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::trace;

struct PoolInner {
    capacity: usize,
    free: Mutex<Vec<WorkerId>>,
    /// Number of slots currently held.
    held: watch::Sender<usize>,
}

impl PoolInner {
    fn free(&self) -> MutexGuard<'_, Vec<WorkerId>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, id: WorkerId) {
        let mut free = self.free();
        debug_assert!(!free.contains(&id), "worker {id} released twice");
        free.push(id);
        self.held.send_modify(|held| *held -= 1);
        trace!(worker_id = %id, "Released worker slot");
    }
}

/// Pool of worker slots with ids `1..=capacity`.
///
/// Cloning is cheap and clones share the same slots.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        // Reversed so the lowest id is handed out first.
        let free = (1..=capacity).rev().map(WorkerId).collect();
        let (held, _) = watch::channel(0);
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                free: Mutex::new(free),
                held,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        *self.inner.held.borrow()
    }

    /// Take a free slot without waiting.
    ///
    /// The slot goes back to the pool when the returned guard is dropped.
    pub fn try_acquire(&self) -> Option<WorkerSlot> {
        let mut free = self.inner.free();
        let id = free.pop()?;
        self.inner.held.send_modify(|held| *held += 1);
        trace!(worker_id = %id, "Acquired worker slot");
        Some(WorkerSlot {
            id,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Wait until every slot is back in the pool.
    pub async fn wait_all(&self) {
        let mut held = self.inner.held.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = held.wait_for(|held| *held == 0).await;
    }

    /// Wait until at least one slot is free.
    pub async fn wait_available(&self) {
        let capacity = self.inner.capacity;
        let mut held = self.inner.held.subscribe();
        let _ = held.wait_for(|held| *held < capacity).await;
    }
}

/// A held worker slot.
#[must_use = "dropping a slot releases it immediately"]
pub struct WorkerSlot {
    id: WorkerId,
    pool: Arc<PoolInner>,
}

impl WorkerSlot {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Return the slot to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

impl std::fmt::Debug for WorkerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSlot").field("id", &self.id).finish()
    }
}
