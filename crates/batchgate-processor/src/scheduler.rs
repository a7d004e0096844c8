//! Scheduler: pulls jobs off the queue and hands them to free workers.

use crate::ProcessorClients;
use crate::job::JobExecutor;
use crate::pool::{WorkerPool, WorkerSlot};
use crate::shutdown::Shutdown;
use batchgate_config::SchedulerConfig;
use batchgate_core::Job;
use batchgate_core::clients::{JobRepository, PriorityQueue};
use batchgate_core::metrics::MetricsSink;
use chrono::Utc;
use derive_more::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of the scheduler loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SchedulerState {
    #[display("starting")]
    Starting,
    #[display("running")]
    Running,
    #[display("shutting_down")]
    ShuttingDown,
    #[display("stopped")]
    Stopped,
}

/// Capped exponential backoff for queue errors.
struct ErrorBackoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl ErrorBackoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.max);
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Keeps the active-workers gauge raised while a job runs.
struct ActiveWorker(Arc<dyn MetricsSink>);

impl ActiveWorker {
    fn start(metrics: Arc<dyn MetricsSink>) -> Self {
        metrics.inc_active_workers();
        Self(metrics)
    }
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        self.0.dec_active_workers();
    }
}

/// Polls the queue and dispatches jobs, one per worker slot.
pub struct Scheduler {
    config: SchedulerConfig,
    pool: WorkerPool,
    queue: Arc<dyn PriorityQueue>,
    repository: Arc<dyn JobRepository>,
    executor: Arc<JobExecutor>,
    metrics: Arc<dyn MetricsSink>,
    state: watch::Sender<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        clients: &ProcessorClients,
        executor: Arc<JobExecutor>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Starting);
        Self {
            pool: WorkerPool::new(config.num_workers),
            config,
            queue: Arc::clone(&clients.queue),
            repository: Arc::clone(&clients.repository),
            executor,
            metrics,
            state,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Run until shutdown.
    ///
    /// After the graceful stage this waits for every running job to finish,
    /// unless shutdown is forced first.
    pub async fn run(&self, shutdown: &Shutdown) {
        self.state.send_replace(SchedulerState::Running);
        self.metrics.set_total_workers(self.pool.capacity());
        info!(
            workers = self.pool.capacity(),
            max_job_concurrency = self.executor.settings().max_job_concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Scheduler started"
        );

        let refresher = self.spawn_refresher(shutdown.token());
        self.poll(shutdown).await;

        self.state.send_replace(SchedulerState::ShuttingDown);
        info!(in_flight = self.pool.in_use(), "Scheduler stopped polling, draining jobs");
        tokio::select! {
            _ = self.pool.wait_all() => info!("All jobs drained"),
            _ = shutdown.forced() => {
                warn!(in_flight = self.pool.in_use(), "Shutdown forced, abandoning running jobs")
            }
        }
        if let Err(e) = refresher.await {
            if e.is_panic() {
                error!(error = %e, "Job refresher panicked");
            }
        }

        self.state.send_replace(SchedulerState::Stopped);
        info!("Scheduler stopped");
    }

    async fn poll(&self, shutdown: &Shutdown) {
        let mut backoff =
            ErrorBackoff::new(self.config.error_backoff_initial, self.config.error_backoff_max);

        while !shutdown.is_shutting_down() {
            if self.pool.in_use() >= self.pool.capacity() {
                trace!("All workers busy");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.pool.wait_available() => {}
                    _ = sleep(self.config.poll_interval) => continue,
                }
            }

            let dequeued = tokio::select! {
                _ = shutdown.cancelled() => break,
                dequeued = self.queue.dequeue(self.config.task_wait_time) => dequeued,
            };

            match dequeued {
                Ok(Some(job)) => {
                    backoff.reset();
                    self.admit(job, shutdown).await;
                }
                Ok(None) => {
                    backoff.reset();
                    trace!("No job available");
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    let retry_in_ms = delay.as_millis() as u64;
                    if e.is_transient() {
                        warn!(error = %e, retry_in_ms, "Queue unavailable, retrying dequeue");
                    } else {
                        error!(error = %e, retry_in_ms, "Failed to dequeue job");
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Start `job` on a free worker, or put it back if there is none.
    async fn admit(&self, job: Job, shutdown: &Shutdown) {
        let Some(slot) = self.pool.try_acquire() else {
            debug!(job_id = %job.id, "Worker pool saturated, returning job to queue");
            let job_id = job.id;
            if let Err(e) = self.queue.requeue(job).await {
                error!(job_id = %job_id, error = %e, "Failed to requeue job");
            }
            return;
        };

        let waited = (Utc::now() - job.created_at).to_std().unwrap_or_default();
        self.metrics.record_queue_wait(&job.tenant_id, waited);
        self.dispatch(job, slot, shutdown.token());
    }

    fn dispatch(&self, job: Job, slot: WorkerSlot, cancel: CancellationToken) {
        info!(
            job_id = %job.id,
            tenant = %job.tenant_id,
            worker_id = %slot.id(),
            priority = job.priority,
            "Dispatching job"
        );
        let executor = Arc::clone(&self.executor);
        let active = ActiveWorker::start(Arc::clone(&self.metrics));
        tokio::spawn(async move {
            let _active = active;
            let report = executor.run(job, slot, cancel).await;
            debug!(job_id = %report.job_id, status = %report.status, "Worker finished job");
        });
    }

    /// Move newly created jobs from the repository into the queue every
    /// `refresh_interval` until `stop` fires.
    fn spawn_refresher(&self, stop: CancellationToken) -> JoinHandle<()> {
        let repository = Arc::clone(&self.repository);
        let queue = Arc::clone(&self.queue);
        let interval = self.config.refresh_interval;
        let batch = self.config.refresh_batch_size;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                refresh(repository.as_ref(), queue.as_ref(), batch).await;
            }
        })
    }
}

/// Queue up to `batch` unqueued jobs. Returns how many were queued.
async fn refresh(repository: &dyn JobRepository, queue: &dyn PriorityQueue, batch: usize) -> usize {
    let jobs = match repository.take_unqueued(batch).await {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(error = %e, "Failed to load new jobs");
            return 0;
        }
    };

    let mut queued = 0;
    for job in jobs {
        let job_id = job.id;
        match queue.enqueue(job).await {
            Ok(()) => queued += 1,
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to enqueue job"),
        }
    }
    if queued > 0 {
        info!(count = queued, "Queued new jobs");
    }
    queued
}
