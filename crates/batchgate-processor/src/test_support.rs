//! Scripted collaborators shared by the processor tests.

use crate::ProcessorClients;
use async_trait::async_trait;
use batchgate_core::inference::{InferenceClient, InferenceRequest, InferenceResponse};
use batchgate_core::metrics::{JobResultLabel, MetricsSink, ReasonLabel, SizeBucket};
use batchgate_core::{BackendFailure, InferenceError, Job, RequestLine};
use batchgate_store::{
    BroadcastEventChannel, MemoryFileStore, MemoryJobRepository, MemoryQueue, MemoryStatusStore,
};
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ENDPOINT: &str = "/v1/chat/completions";

type Outcome = Result<InferenceResponse, InferenceError>;

pub fn failure(status: u16) -> Outcome {
    Err(BackendFailure::Status {
        status,
        message: format!("backend returned {status}"),
        retry_after: None,
    }
    .into())
}

pub fn line(ordinal: u64, request_id: &str) -> RequestLine {
    let raw = format!(r#"{{"custom_id":"{request_id}","body":{{"model":"test-model"}}}}"#);
    RequestLine::parse(ordinal, &raw, ENDPOINT, "test-model").unwrap()
}

/// JSONL input with one request per id.
pub fn jsonl(ids: &[&str]) -> String {
    ids.iter()
        .map(|id| {
            format!(
                r#"{{"custom_id":"{id}","method":"POST","url":"{ENDPOINT}","body":{{"model":"test-model","messages":[]}}}}"#
            ) + "\n"
        })
        .collect()
}

/// Inference backend that answers from per-request scripts.
///
/// Requests without a script (or whose script ran out) succeed with a
/// body echoing the request id.
#[derive(Default)]
pub struct ScriptedInference {
    scripts: Mutex<HashMap<String, VecDeque<Outcome>>>,
    delays: Mutex<HashMap<String, Duration>>,
    panics: Mutex<HashSet<String>>,
    calls: Mutex<HashMap<String, u32>>,
    default_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedInference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, request_id: &str, outcomes: impl IntoIterator<Item = Outcome>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(request_id.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub fn delay(&self, request_id: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(request_id.to_string(), delay);
    }

    pub fn delay_all(&self, delay: Duration) {
        *self.default_delay.lock().unwrap() = delay;
    }

    pub fn panic_on(&self, request_id: &str) {
        self.panics.lock().unwrap().insert(request_id.to_string());
    }

    pub fn calls(&self, request_id: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(request_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    /// Most requests ever in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceClient for ScriptedInference {
    async fn generate(&self, request: &InferenceRequest) -> Outcome {
        let id = request.request_id.clone();
        *self.calls.lock().unwrap().entry(id.clone()).or_default() += 1;
        if self.panics.lock().unwrap().contains(&id) {
            panic!("scripted panic for {id}");
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = self
            .delays
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .unwrap_or_else(|| *self.default_delay.lock().unwrap());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&id)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| {
            Ok(InferenceResponse {
                body: Bytes::from(format!(r#"{{"echo":"{id}"}}"#)),
                request_id: id,
                status_code: 200,
            })
        })
    }
}

/// Metrics sink that keeps what it was told.
#[derive(Default)]
pub struct RecordingMetrics {
    pub processed: Mutex<Vec<(JobResultLabel, ReasonLabel)>>,
    pub durations: Mutex<Vec<(String, SizeBucket)>>,
    pub queue_waits: Mutex<Vec<String>>,
    pub model_errors: Mutex<Vec<String>>,
    pub total_workers: AtomicUsize,
    pub active_workers: AtomicI64,
}

impl RecordingMetrics {
    pub fn processed(&self) -> Vec<(JobResultLabel, ReasonLabel)> {
        self.processed.lock().unwrap().clone()
    }
}

impl MetricsSink for RecordingMetrics {
    fn record_job_processed(&self, result: JobResultLabel, reason: ReasonLabel) {
        self.processed.lock().unwrap().push((result, reason));
    }

    fn record_processing_duration(&self, tenant: &str, size: SizeBucket, _elapsed: Duration) {
        self.durations
            .lock()
            .unwrap()
            .push((tenant.to_string(), size));
    }

    fn record_queue_wait(&self, tenant: &str, _waited: Duration) {
        self.queue_waits.lock().unwrap().push(tenant.to_string());
    }

    fn set_total_workers(&self, total: usize) {
        self.total_workers.store(total, Ordering::SeqCst);
    }

    fn inc_active_workers(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn dec_active_workers(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn record_model_error(&self, model: &str) {
        self.model_errors.lock().unwrap().push(model.to_string());
    }
}

/// In-memory collaborators wired together.
pub struct Harness {
    pub queue: Arc<MemoryQueue>,
    pub status: Arc<MemoryStatusStore>,
    pub events: Arc<BroadcastEventChannel>,
    pub files: Arc<MemoryFileStore>,
    pub repository: Arc<MemoryJobRepository>,
    pub inference: Arc<ScriptedInference>,
    pub metrics: Arc<RecordingMetrics>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(MemoryQueue::new()),
            status: Arc::new(MemoryStatusStore::new()),
            events: Arc::new(BroadcastEventChannel::new(256)),
            files: Arc::new(MemoryFileStore::new()),
            repository: Arc::new(MemoryJobRepository::new()),
            inference: Arc::new(ScriptedInference::new()),
            metrics: Arc::new(RecordingMetrics::default()),
        }
    }

    pub fn clients(&self) -> ProcessorClients {
        ProcessorClients {
            queue: self.queue.clone(),
            status: self.status.clone(),
            events: self.events.clone(),
            inference: self.inference.clone(),
            files: self.files.clone(),
            repository: self.repository.clone(),
        }
    }

    /// A job whose input file holds one request per id.
    pub fn job_with_lines(&self, ids: &[&str]) -> Job {
        let job = Job::new("tenant-a", ENDPOINT, "").with_model("test-model");
        let input = format!("{}/input.jsonl", job.id);
        self.files.insert(input.clone(), jsonl(ids));
        Job {
            input_location: input,
            ..job
        }
    }
}
