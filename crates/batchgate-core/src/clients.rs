//! Collaborator traits.
//!
//! The processor talks to its queue, status store, event channel, file
//! store and job repository only through these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::AsyncRead;

use crate::job::{Job, JobEvent, StatusUpdate};
use crate::{JobId, Result};

/// Priority queue of jobs waiting to run.
///
/// Ordering is priority first, then arrival. A dequeued job is delivered
/// to exactly one caller.
#[async_trait]
pub trait PriorityQueue: Send + Sync {
    /// Wait up to `wait` for a job. `Ok(None)` means the wait timed out.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Job>>;

    /// Put back a job that was dequeued but could not be started.
    async fn requeue(&self, job: Job) -> Result<()>;

    /// Add a newly created job.
    async fn enqueue(&self, job: Job) -> Result<()>;
}

/// Durable job status store.
#[async_trait]
pub trait StatusClient: Send + Sync {
    /// Write the job's status. Idempotent; last write wins.
    async fn update_status(&self, update: StatusUpdate) -> Result<()>;

    /// Whether a client asked for this job to be cancelled.
    async fn cancel_requested(&self, job_id: JobId) -> Result<bool>;
}

/// Lifecycle event channel.
#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn publish(&self, event: JobEvent) -> Result<()>;
}

/// Durable storage of newly created jobs, drained into the queue.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Take up to `limit` jobs that have not been handed to the queue yet.
    /// Each job is returned at most once while the repository is open;
    /// jobs taken but never finished are offered again after a restart.
    async fn take_unqueued(&self, limit: usize) -> Result<Vec<Job>>;

    /// Forget a job that reached a terminal status.
    async fn finish(&self, job_id: JobId) -> Result<()>;
}

/// Metadata of a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub location: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

/// Streaming reader over file contents.
pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

/// Batch file storage.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Open a stored file for streaming reads.
    async fn retrieve(&self, location: &str) -> Result<(FileReader, FileMetadata)>;

    /// Store everything `reader` yields at `location`, failing with
    /// `InvalidInput` once more than `size_limit` bytes arrive.
    async fn store(&self, location: &str, size_limit: u64, reader: FileReader)
    -> Result<FileMetadata>;
}
