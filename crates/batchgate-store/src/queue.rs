//! In-memory priority queue.

use async_trait::async_trait;
use batchgate_core::clients::PriorityQueue;
use batchgate_core::{Job, Result};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};

/// A queued job with its ordering key.
struct Entry {
    priority: i32,
    created_at: DateTime<Utc>,
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    /// Max-heap order: higher priority, then older jobs, then earlier pushes.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

/// Job queue held in process memory.
///
/// Ordered by priority, then `created_at`, so a requeued job keeps its place
/// among jobs of the same priority. Jobs do not survive a restart.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, job: Job) {
        {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Entry {
                priority: job.priority,
                created_at: job.created_at,
                seq,
                job,
            });
        }
        self.notify.notify_waiters();
    }

    fn pop(&self) -> Option<Job> {
        self.lock().heap.pop().map(|entry| entry.job)
    }
}

#[async_trait]
impl PriorityQueue for MemoryQueue {
    async fn dequeue(&self, wait: Duration) -> Result<Option<Job>> {
        let deadline = Instant::now() + wait;
        loop {
            // Register before checking so a push in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.pop() {
                return Ok(Some(job));
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn requeue(&self, job: Job) -> Result<()> {
        self.push(job);
        Ok(())
    }

    async fn enqueue(&self, job: Job) -> Result<()> {
        self.push(job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn job(priority: i32) -> Job {
        Job::new("tenant", "/v1/chat/completions", "input.jsonl").with_priority(priority)
    }

    #[tokio::test]
    async fn test_priority_then_arrival_order() {
        let queue = MemoryQueue::new();
        let low = job(0);
        let high = job(10);
        let low_later = job(0);
        queue.enqueue(low.clone()).await.unwrap();
        queue.enqueue(high.clone()).await.unwrap();
        queue.enqueue(low_later.clone()).await.unwrap();

        let wait = Duration::from_millis(10);
        assert_eq!(queue.dequeue(wait).await.unwrap().unwrap().id, high.id);
        assert_eq!(queue.dequeue(wait).await.unwrap().unwrap().id, low.id);
        assert_eq!(queue.dequeue(wait).await.unwrap().unwrap().id, low_later.id);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_keeps_place() {
        let queue = MemoryQueue::new();
        let first = job(0);
        let second = job(0);
        queue.enqueue(first.clone()).await.unwrap();
        queue.enqueue(second.clone()).await.unwrap();

        let taken = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(taken.id, first.id);
        queue.requeue(taken).await.unwrap();

        let again = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_times_out_when_empty() {
        let queue = MemoryQueue::new();
        let got = queue.dequeue(Duration::from_secs(5)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(MemoryQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(10)).await })
        };
        tokio::task::yield_now().await;

        let submitted = job(0);
        queue.enqueue(submitted.clone()).await.unwrap();
        let got = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(got.id, submitted.id);
    }

    #[tokio::test]
    async fn test_each_job_delivered_once() {
        let queue = Arc::new(MemoryQueue::new());
        for _ in 0..20 {
            queue.enqueue(job(0)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(job) = queue.dequeue(Duration::from_millis(20)).await.unwrap() {
                    ids.push(job.id);
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let total = all.len();
        all.sort_by_key(|id| *id.as_uuid());
        all.dedup();
        assert_eq!(total, 20);
        assert_eq!(all.len(), 20);
    }
}
