//! Batch job processing for batchgate.
//!
//! The [`Scheduler`] polls the job queue and hands each job to a
//! [`JobExecutor`] running on a worker slot from the [`WorkerPool`]. The
//! executor streams the job's input through [`LineExecutor`]s, which retry
//! classified backend failures, and writes results to the output and error
//! artifacts.

pub mod artifact;
pub mod job;
pub mod metrics;
pub mod pool;
pub mod retry;
pub mod scheduler;
pub mod shutdown;

#[cfg(test)]
mod test_support;

pub use job::{JobExecutor, JobReport, JobSettings};
pub use metrics::PrometheusMetrics;
pub use pool::{WorkerPool, WorkerSlot};
pub use retry::{LineExecutor, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerState};
pub use shutdown::{Shutdown, ShutdownStage, listen_for_signals};

use batchgate_core::clients::{EventChannel, FileStore, JobRepository, PriorityQueue, StatusClient};
use batchgate_core::inference::InferenceClient;
use std::sync::Arc;

/// Collaborators shared by the scheduler and job executors.
#[derive(Clone)]
pub struct ProcessorClients {
    pub queue: Arc<dyn PriorityQueue>,
    pub status: Arc<dyn StatusClient>,
    pub events: Arc<dyn EventChannel>,
    pub inference: Arc<dyn InferenceClient>,
    pub files: Arc<dyn FileStore>,
    pub repository: Arc<dyn JobRepository>,
}
