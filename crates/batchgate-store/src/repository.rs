//! Job repositories: where newly created jobs wait before being queued.

use async_trait::async_trait;
use batchgate_core::clients::JobRepository;
use batchgate_core::{Job, JobId, Result};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::fs;
use tracing::{debug, info, warn};

/// Repository held in memory. Jobs come out in insertion order.
#[derive(Default)]
pub struct MemoryJobRepository {
    pending: Mutex<VecDeque<Job>>,
    finished: Mutex<HashSet<JobId>>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(job);
    }

    pub fn is_finished(&self, job_id: JobId) -> bool {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&job_id)
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn take_unqueued(&self, limit: usize) -> Result<Vec<Job>> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let n = limit.min(pending.len());
        Ok(pending.drain(..n).collect())
    }

    async fn finish(&self, job_id: JobId) -> Result<()> {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id);
        Ok(())
    }
}

/// Repository backed by a spool directory.
///
/// Submitters drop one JSON-encoded [`Job`] per file into `pending/`.
/// Taking a job moves its file to `queued/`; files that do not decode are
/// moved to `rejected/`. A queued file is deleted once its job finishes, and
/// opening the spool moves leftover queued files back to `pending/`.
pub struct SpoolJobRepository {
    root: PathBuf,
}

impl SpoolJobRepository {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in ["pending", "queued", "rejected"] {
            fs::create_dir_all(root.join(dir)).await?;
        }
        let repo = Self { root };
        repo.requeue_unfinished().await?;
        Ok(repo)
    }

    /// Return jobs taken by an earlier process to `pending/`.
    async fn requeue_unfinished(&self) -> Result<()> {
        let leftovers = json_files(&self.root.join("queued")).await?;
        for path in &leftovers {
            self.move_to(path, "pending").await?;
        }
        if !leftovers.is_empty() {
            info!(jobs = leftovers.len(), "Requeued unfinished spool jobs");
        }
        Ok(())
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.root.join("pending")
    }

    /// Write a job into `pending/`.
    pub async fn submit(&self, job: &Job) -> Result<()> {
        let name = format!("{}.json", job.id);
        let tmp = self.root.join(format!(".{name}.tmp"));
        fs::write(&tmp, serde_json::to_vec(job)?).await?;
        fs::rename(&tmp, self.pending_dir().join(name)).await?;
        Ok(())
    }

    async fn move_to(&self, path: &Path, dir: &str) -> Result<()> {
        if let Some(name) = path.file_name() {
            fs::rename(path, self.root.join(dir).join(name)).await?;
        }
        Ok(())
    }
}

async fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    // Job ids are UUIDv7, so file names sort by creation time.
    files.sort();
    Ok(files)
}

#[async_trait]
impl JobRepository for SpoolJobRepository {
    async fn take_unqueued(&self, limit: usize) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for path in json_files(&self.pending_dir()).await? {
            if jobs.len() >= limit {
                break;
            }
            let raw = fs::read(&path).await?;
            match serde_json::from_slice::<Job>(&raw) {
                Ok(job) => {
                    self.move_to(&path, "queued").await?;
                    debug!(job_id = %job.id, "Took job from spool");
                    jobs.push(job);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Rejecting undecodable job file");
                    self.move_to(&path, "rejected").await?;
                }
            }
        }
        Ok(jobs)
    }

    async fn finish(&self, job_id: JobId) -> Result<()> {
        let path = self.root.join("queued").join(format!("{job_id}.json"));
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
