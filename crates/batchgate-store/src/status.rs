//! Job status stores.

use async_trait::async_trait;
use batchgate_core::clients::StatusClient;
use batchgate_core::{JobId, Result, StatusUpdate};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tokio::fs;

#[derive(Default)]
struct Recorded {
    updates: HashMap<JobId, Vec<StatusUpdate>>,
    cancels: HashSet<JobId>,
}

/// Status store held in memory. Keeps every write for inspection.
#[derive(Default)]
pub struct MemoryStatusStore {
    inner: Mutex<Recorded>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask for a job to be cancelled.
    pub fn request_cancel(&self, job_id: JobId) {
        self.lock().cancels.insert(job_id);
    }

    /// Most recent write for a job.
    pub fn latest(&self, job_id: JobId) -> Option<StatusUpdate> {
        self.lock()
            .updates
            .get(&job_id)
            .and_then(|updates| updates.last().cloned())
    }

    /// Every write for a job, oldest first.
    pub fn history(&self, job_id: JobId) -> Vec<StatusUpdate> {
        self.lock()
            .updates
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl StatusClient for MemoryStatusStore {
    async fn update_status(&self, update: StatusUpdate) -> Result<()> {
        self.lock()
            .updates
            .entry(update.job_id)
            .or_default()
            .push(update);
        Ok(())
    }

    async fn cancel_requested(&self, job_id: JobId) -> Result<bool> {
        Ok(self.lock().cancels.contains(&job_id))
    }
}

/// Status store backed by a directory.
///
/// The latest status of each job lives in `status/<job id>.json`. A client
/// requests cancellation by creating `cancel/<job id>`.
pub struct SpoolStatusStore {
    root: PathBuf,
}

impl SpoolStatusStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("status")).await?;
        fs::create_dir_all(root.join("cancel")).await?;
        Ok(Self { root })
    }

    fn status_path(&self, job_id: JobId) -> PathBuf {
        self.root.join("status").join(format!("{job_id}.json"))
    }

    fn cancel_path(&self, job_id: JobId) -> PathBuf {
        self.root.join("cancel").join(job_id.to_string())
    }

    /// Read back the stored status of a job.
    pub async fn load(&self, job_id: JobId) -> Result<Option<StatusUpdate>> {
        match fs::read(self.status_path(job_id)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn request_cancel(&self, job_id: JobId) -> Result<()> {
        fs::write(self.cancel_path(job_id), b"").await?;
        Ok(())
    }
}

#[async_trait]
impl StatusClient for SpoolStatusStore {
    async fn update_status(&self, update: StatusUpdate) -> Result<()> {
        let path = self.status_path(update.job_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&update)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn cancel_requested(&self, job_id: JobId) -> Result<bool> {
        Ok(fs::try_exists(self.cancel_path(job_id)).await?)
    }
}
