//! Job executor: runs every line of one batch job and settles its status.

use crate::ProcessorClients;
use crate::artifact::ArtifactWriter;
use crate::pool::WorkerSlot;
use crate::retry::{LineExecutor, RetryPolicy};
use batchgate_config::ProcessorConfig;
use batchgate_core::clients::{FileMetadata, FileStore};
use batchgate_core::metrics::{JobResultLabel, MetricsSink, ReasonLabel, SizeBucket};
use batchgate_core::{
    Error, Job, JobError, JobEvent, JobEventKind, JobId, JobStatus, LineOutcome, LineRejection,
    LineResult, RequestCounts, RequestLine, Result, StatusUpdate, WorkerId,
};
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt, future};
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-job execution settings.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSettings {
    /// Lines in flight at once within one job.
    pub max_job_concurrency: usize,
    /// Publish progress every this many results.
    pub progress_interval: u64,
    pub cancel_poll_interval: Duration,
    pub max_output_bytes: u64,
}

impl From<&ProcessorConfig> for JobSettings {
    fn from(config: &ProcessorConfig) -> Self {
        Self {
            max_job_concurrency: config.scheduler.max_job_concurrency,
            progress_interval: config.scheduler.progress_interval,
            cancel_poll_interval: config.scheduler.cancel_poll_interval,
            max_output_bytes: config.storage.max_output_bytes,
        }
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self::from(&ProcessorConfig::default())
    }
}

/// What a finished job looked like.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub status: JobStatus,
    pub request_counts: RequestCounts,
    pub output: Option<FileMetadata>,
    pub errors: Option<FileMetadata>,
}

/// Why a job could not be processed.
#[derive(Debug, thiserror::Error)]
enum JobFailure {
    #[error("failed to read input file: {0}")]
    Input(Error),

    #[error("input file contains no requests")]
    EmptyInput,

    #[error("failed to store results: {0}")]
    Output(Error),

    #[error("job executor panicked: {0}")]
    Panicked(String),
}

impl JobFailure {
    fn code(&self) -> &'static str {
        match self {
            JobFailure::Input(Error::NotFound(_)) => "file_not_found",
            JobFailure::Input(_) => "invalid_file",
            JobFailure::EmptyInput => "empty_file",
            JobFailure::Output(_) => "output_write_failed",
            JobFailure::Panicked(_) => "internal_error",
        }
    }

    fn reason(&self) -> ReasonLabel {
        match self {
            JobFailure::Input(Error::NotFound(_) | Error::InvalidInput(_))
            | JobFailure::EmptyInput => ReasonLabel::UserError,
            JobFailure::Input(Error::Io(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                ReasonLabel::UserError
            }
            _ => ReasonLabel::SystemError,
        }
    }
}

/// Terminal outcome of a job.
enum Settlement {
    Completed,
    Cancelled,
    Expired,
    Failed(JobFailure),
}

/// Line counts shared with the panic path.
#[derive(Default)]
struct LineCounters {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl LineCounters {
    fn add_pending(&self) {
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    fn record(&self, success: bool) {
        let counter = if success { &self.completed } else { &self.failed };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> RequestCounts {
        RequestCounts {
            total: self.total.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// An input line ready to run, or already resolved.
enum Prepared {
    Run(RequestLine),
    Rejected(LineResult),
}

/// Turns raw input lines into request lines, numbering them and catching
/// repeated `custom_id`s.
struct LineParser {
    endpoint: String,
    default_model: String,
    next_ordinal: u64,
    seen: HashSet<String>,
}

impl LineParser {
    fn new(job: &Job) -> Self {
        Self {
            endpoint: job.endpoint.clone(),
            default_model: job.model.clone(),
            next_ordinal: 0,
            seen: HashSet::new(),
        }
    }

    fn prepare(&mut self, raw: &str) -> Prepared {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        match RequestLine::parse(ordinal, raw, &self.endpoint, &self.default_model) {
            Ok(line) if !self.seen.insert(line.request_id.clone()) => {
                let rejection = LineRejection {
                    message: format!("duplicate custom_id: {}", line.request_id),
                    request_id: Some(line.request_id),
                };
                Prepared::Rejected(LineResult::rejected(ordinal, rejection, &line.model))
            }
            Ok(line) => Prepared::Run(line),
            Err(rejection) => {
                Prepared::Rejected(LineResult::rejected(ordinal, rejection, &self.default_model))
            }
        }
    }
}

/// The job's output and error files.
struct Artifacts {
    output: ArtifactWriter,
    errors: ArtifactWriter,
}

#[derive(Default)]
struct StoredArtifacts {
    output: Option<FileMetadata>,
    errors: Option<FileMetadata>,
}

impl Artifacts {
    fn new(files: &Arc<dyn FileStore>, job: &Job, size_limit: u64) -> Self {
        Self {
            output: ArtifactWriter::new(Arc::clone(files), &job.output_location, size_limit),
            errors: ArtifactWriter::new(Arc::clone(files), &job.error_location, size_limit),
        }
    }

    async fn record(&mut self, result: &LineResult) -> Result<()> {
        let record = result.to_record()?;
        if result.is_success() {
            self.output.write_record(&record).await
        } else {
            self.errors.write_record(&record).await
        }
    }

    async fn finish(self) -> Result<StoredArtifacts> {
        Ok(StoredArtifacts {
            output: self.output.finish().await?,
            errors: self.errors.finish().await?,
        })
    }

    fn abort(self) {
        self.output.abort();
        self.errors.abort();
    }
}

/// Moves `job` to `next` if the lifecycle allows it.
fn advance(job: &mut Job, next: JobStatus, at: DateTime<Utc>) {
    if job.status == next {
        return;
    }
    if let Err(e) = job.transition(next, at) {
        debug!(job_id = %job.id, error = %e, "Skipping status transition");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Executes batch jobs, one call to [`JobExecutor::run`] per job.
pub struct JobExecutor {
    clients: ProcessorClients,
    lines: LineExecutor,
    metrics: Arc<dyn MetricsSink>,
    settings: JobSettings,
}

impl JobExecutor {
    pub fn new(
        clients: ProcessorClients,
        policy: RetryPolicy,
        metrics: Arc<dyn MetricsSink>,
        settings: JobSettings,
    ) -> Self {
        let lines = LineExecutor::new(Arc::clone(&clients.inference), policy);
        Self {
            clients,
            lines,
            metrics,
            settings,
        }
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    /// Run `job` to a terminal status on the worker holding `slot`.
    ///
    /// Never fails: every problem ends up in the job's status. The slot is
    /// released when this returns, including after a panic.
    pub async fn run(&self, job: Job, slot: WorkerSlot, shutdown: CancellationToken) -> JobReport {
        let worker_id = slot.id();
        let started = Instant::now();
        let counters = LineCounters::default();
        let snapshot = job.clone();

        let processed = AssertUnwindSafe(self.process(job, worker_id, &shutdown, &counters, started))
            .catch_unwind()
            .await;

        let report = match processed {
            Ok(report) => report,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    job_id = %snapshot.id,
                    worker_id = %worker_id,
                    panic = %message,
                    "Job executor panicked"
                );
                let mut job = snapshot;
                job.request_counts = counters.snapshot();
                self.settle(
                    job,
                    worker_id,
                    Settlement::Failed(JobFailure::Panicked(message)),
                    StoredArtifacts::default(),
                    started,
                )
                .await
            }
        };

        slot.release();
        report
    }

    async fn process(
        &self,
        mut job: Job,
        worker_id: WorkerId,
        shutdown: &CancellationToken,
        counters: &LineCounters,
        started: Instant,
    ) -> JobReport {
        if job.status.is_terminal() {
            warn!(job_id = %job.id, status = %job.status, "Skipping job already in a terminal status");
            self.release_from_repository(job.id).await;
            return JobReport {
                job_id: job.id,
                worker_id,
                status: job.status,
                request_counts: job.request_counts,
                output: None,
                errors: None,
            };
        }

        let now = Utc::now();
        if job.is_expired(now) {
            info!(job_id = %job.id, tenant = %job.tenant_id, "Job expired before it could run");
            return self
                .settle(job, worker_id, Settlement::Expired, StoredArtifacts::default(), started)
                .await;
        }
        if job.status == JobStatus::Cancelling {
            return self
                .settle(job, worker_id, Settlement::Cancelled, StoredArtifacts::default(), started)
                .await;
        }

        advance(&mut job, JobStatus::InProgress, now);
        job.request_counts = RequestCounts::default();
        self.write_status(StatusUpdate::snapshot(&job)).await;
        self.publish(JobEvent::new(&job, JobEventKind::Assigned { worker_id }))
            .await;
        info!(
            job_id = %job.id,
            tenant = %job.tenant_id,
            worker_id = %worker_id,
            "Processing job"
        );

        let cancel = shutdown.child_token();
        let watcher = CancellationToken::new();
        self.watch_for_cancel(job.id, cancel.clone(), watcher.clone());
        let _stop_watcher = watcher.drop_guard();

        let ran = self.run_lines(&mut job, &cancel, counters).await;

        let (settlement, stored) = match ran {
            Err(failure) => (Settlement::Failed(failure), StoredArtifacts::default()),
            Ok(artifacts) if cancel.is_cancelled() => {
                advance(&mut job, JobStatus::Cancelling, Utc::now());
                self.write_status(StatusUpdate::snapshot(&job)).await;
                let stored = match artifacts.finish().await {
                    Ok(stored) => stored,
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "Failed to store partial results");
                        StoredArtifacts::default()
                    }
                };
                (Settlement::Cancelled, stored)
            }
            Ok(artifacts) if job.request_counts.total == 0 => {
                artifacts.abort();
                (
                    Settlement::Failed(JobFailure::EmptyInput),
                    StoredArtifacts::default(),
                )
            }
            Ok(artifacts) => {
                advance(&mut job, JobStatus::Finalizing, Utc::now());
                self.write_status(StatusUpdate::snapshot(&job)).await;
                match artifacts.finish().await {
                    Ok(stored) => (Settlement::Completed, stored),
                    Err(e) => (
                        Settlement::Failed(JobFailure::Output(e)),
                        StoredArtifacts::default(),
                    ),
                }
            }
        };

        self.settle(job, worker_id, settlement, stored, started).await
    }

    /// Stream the input through the line executors and into the artifacts.
    async fn run_lines(
        &self,
        job: &mut Job,
        cancel: &CancellationToken,
        counters: &LineCounters,
    ) -> std::result::Result<Artifacts, JobFailure> {
        let (reader, metadata) = self
            .clients
            .files
            .retrieve(&job.input_location)
            .await
            .map_err(JobFailure::Input)?;
        debug!(job_id = %job.id, size = metadata.size, "Opened input file");

        let mut parser = LineParser::new(job);
        let prepared = LinesStream::new(BufReader::new(reader).lines())
            .take_until(cancel.cancelled())
            .filter_map(|line| {
                future::ready(match line {
                    Ok(raw) if raw.trim().is_empty() => None,
                    Ok(raw) => {
                        counters.add_pending();
                        Some(Ok(parser.prepare(&raw)))
                    }
                    Err(e) => Some(Err(e)),
                })
            });

        let executor = &self.lines;
        let results = prepared
            .map(move |prepared| async move {
                match prepared {
                    Ok(Prepared::Run(line)) => Ok(executor.execute(line, cancel).await),
                    Ok(Prepared::Rejected(result)) => Ok(result),
                    Err(e) => Err(e),
                }
            })
            .buffered(self.settings.max_job_concurrency.max(1));
        tokio::pin!(results);

        let mut artifacts = Artifacts::new(&self.clients.files, job, self.settings.max_output_bytes);
        let mut since_progress = 0;
        while let Some(next) = results.next().await {
            let result = match next {
                Ok(result) => result,
                Err(e) => {
                    artifacts.abort();
                    return Err(JobFailure::Input(e.into()));
                }
            };
            if let Err(e) = self.record_result(&mut artifacts, &result, counters).await {
                artifacts.abort();
                return Err(JobFailure::Output(e));
            }

            since_progress += 1;
            if since_progress >= self.settings.progress_interval {
                since_progress = 0;
                job.request_counts = counters.snapshot();
                self.write_status(StatusUpdate::snapshot(job)).await;
            }
        }

        job.request_counts = counters.snapshot();
        Ok(artifacts)
    }

    async fn record_result(
        &self,
        artifacts: &mut Artifacts,
        result: &LineResult,
        counters: &LineCounters,
    ) -> Result<()> {
        artifacts.record(result).await?;
        counters.record(result.is_success());
        match &result.outcome {
            LineOutcome::Succeeded(_) => {}
            LineOutcome::Failed(err) => {
                self.metrics.record_model_error(&result.model);
                debug!(
                    request_id = %result.request_id,
                    attempts = result.attempts,
                    category = %err.category,
                    "Line failed"
                );
            }
            LineOutcome::Cancelled => {
                debug!(request_id = %result.request_id, "Line cancelled");
            }
        }
        Ok(())
    }

    /// Write the terminal status, publish the event and record metrics.
    async fn settle(
        &self,
        mut job: Job,
        worker_id: WorkerId,
        settlement: Settlement,
        stored: StoredArtifacts,
        started: Instant,
    ) -> JobReport {
        let now = Utc::now();
        let (status, event, result, reason) = match &settlement {
            Settlement::Completed => (
                JobStatus::Completed,
                JobEventKind::Completed,
                JobResultLabel::Success,
                ReasonLabel::None,
            ),
            Settlement::Cancelled => (
                JobStatus::Cancelled,
                JobEventKind::Cancelled,
                JobResultLabel::Failed,
                ReasonLabel::Cancelled,
            ),
            Settlement::Expired => (
                JobStatus::Expired,
                JobEventKind::Expired,
                JobResultLabel::Failed,
                ReasonLabel::Expired,
            ),
            Settlement::Failed(failure) => (
                JobStatus::Failed,
                JobEventKind::Failed {
                    reason: failure.to_string(),
                },
                JobResultLabel::Failed,
                failure.reason(),
            ),
        };

        if status == JobStatus::Cancelled {
            advance(&mut job, JobStatus::Cancelling, now);
        }
        advance(&mut job, status, now);

        // Lines that never resolved count as failed.
        let counts = &mut job.request_counts;
        counts.failed = counts.total.saturating_sub(counts.completed);

        let mut update = StatusUpdate::snapshot(&job);
        update.output_location = stored.output.as_ref().map(|m| m.location.clone());
        update.error_location = stored.errors.as_ref().map(|m| m.location.clone());
        if let Settlement::Failed(failure) = &settlement {
            update
                .errors
                .push(JobError::new(failure.code(), failure.to_string()));
        }
        self.write_status(update).await;
        self.release_from_repository(job.id).await;
        self.publish(JobEvent::new(&job, event)).await;

        self.metrics.record_job_processed(result, reason);
        self.metrics.record_processing_duration(
            &job.tenant_id,
            SizeBucket::from_lines(job.request_counts.total),
            started.elapsed(),
        );

        let counts = job.request_counts;
        match &settlement {
            Settlement::Failed(failure) => warn!(
                job_id = %job.id,
                tenant = %job.tenant_id,
                error = %failure,
                total = counts.total,
                completed = counts.completed,
                failed = counts.failed,
                "Job failed"
            ),
            _ => info!(
                job_id = %job.id,
                tenant = %job.tenant_id,
                status = %job.status,
                total = counts.total,
                completed = counts.completed,
                failed = counts.failed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Job finished"
            ),
        }

        JobReport {
            job_id: job.id,
            worker_id,
            status: job.status,
            request_counts: counts,
            output: stored.output,
            errors: stored.errors,
        }
    }

    /// Poll the status store's cancel flag until it is set, `cancel`
    /// fires, or `stop` fires.
    fn watch_for_cancel(&self, job_id: JobId, cancel: CancellationToken, stop: CancellationToken) {
        let status = Arc::clone(&self.clients.status);
        let interval = self.settings.cancel_poll_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                match status.cancel_requested(job_id).await {
                    Ok(true) => {
                        info!(job_id = %job_id, "Cancellation requested");
                        cancel.cancel();
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Failed to check cancellation flag")
                    }
                }
            }
        });
    }

    async fn write_status(&self, update: StatusUpdate) {
        let (job_id, status) = (update.job_id, update.status);
        if let Err(e) = self.clients.status.update_status(update).await {
            warn!(job_id = %job_id, status = %status, error = %e, "Failed to write job status");
        }
    }

    async fn release_from_repository(&self, job_id: JobId) {
        if let Err(e) = self.clients.repository.finish(job_id).await {
            warn!(job_id = %job_id, error = %e, "Failed to release finished job from repository");
        }
    }

    async fn publish(&self, event: JobEvent) {
        let job_id = event.job_id;
        if let Err(e) = self.clients.events.publish(event).await {
            warn!(job_id = %job_id, error = %e, "Failed to publish job event");
        }
    }
}
