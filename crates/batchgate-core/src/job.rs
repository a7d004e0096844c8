//! Batch job types and the job status machine.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Error, JobId, Result, WorkerId};

/// Status of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[display("validating")]
    Validating,
    #[display("in_progress")]
    InProgress,
    #[display("finalizing")]
    Finalizing,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
    #[display("expired")]
    Expired,
    #[display("cancelling")]
    Cancelling,
    #[display("cancelled")]
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Expired | JobStatus::Cancelled
        )
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Validating => 0,
            JobStatus::InProgress => 1,
            JobStatus::Finalizing => 2,
            JobStatus::Cancelling => 3,
            _ => 4,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    ///
    /// Terminal states have no successors. `cancelling` may only be
    /// followed by `cancelled`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (current, _) if current.is_terminal() => false,
            (JobStatus::Cancelling, next) => next == JobStatus::Cancelled,
            (_, JobStatus::Cancelling) => true,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

/// The request counts for a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounts {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Per-transition timestamps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTimestamps {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_progress_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalizing_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelling_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl JobTimestamps {
    fn mark(&mut self, status: JobStatus, at: DateTime<Utc>) {
        let slot = match status {
            JobStatus::Validating => return,
            JobStatus::InProgress => &mut self.in_progress_at,
            JobStatus::Finalizing => &mut self.finalizing_at,
            JobStatus::Completed => &mut self.completed_at,
            JobStatus::Failed => &mut self.failed_at,
            JobStatus::Expired => &mut self.expired_at,
            JobStatus::Cancelling => &mut self.cancelling_at,
            JobStatus::Cancelled => &mut self.cancelled_at,
        };
        *slot = Some(at);
    }
}

/// A job-level error, recorded when a batch fails as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            line: None,
        }
    }
}

/// A batch job: one input file of requests, processed into an output file
/// and optionally an error file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: String,
    /// Default model for lines that do not name one.
    #[serde(default)]
    pub model: String,
    /// Endpoint every request in the batch targets, e.g. `/v1/chat/completions`.
    pub endpoint: String,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    pub input_location: String,
    pub output_location: String,
    pub error_location: String,
    #[serde(default = "default_status")]
    pub status: JobStatus,
    #[serde(default)]
    pub request_counts: RequestCounts,
    #[serde(default)]
    pub timestamps: JobTimestamps,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_status() -> JobStatus {
    JobStatus::Validating
}

impl Job {
    /// Create a job in `validating` state with artifact locations derived
    /// from its id.
    pub fn new(
        tenant_id: impl Into<String>,
        endpoint: impl Into<String>,
        input_location: impl Into<String>,
    ) -> Self {
        let id = JobId::new();
        Self {
            id,
            tenant_id: tenant_id.into(),
            model: String::new(),
            endpoint: endpoint.into(),
            priority: 0,
            input_location: input_location.into(),
            output_location: format!("{id}/output.jsonl"),
            error_location: format!("{id}/errors.jsonl"),
            status: JobStatus::Validating,
            request_counts: RequestCounts::default(),
            timestamps: JobTimestamps::default(),
            created_at: Utc::now(),
            expires_at: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Move the job to `next`, stamping the transition time.
    pub fn transition(&mut self, next: JobStatus, at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.timestamps.mark(next, at);
        Ok(())
    }
}

/// A status write for one job. Last write wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub job_id: JobId,
    pub status: JobStatus,
    pub request_counts: RequestCounts,
    pub timestamps: JobTimestamps,
    /// Set once the output artifact has been stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_location: Option<String>,
    /// Set once the error artifact has been stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_location: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<JobError>,
}

impl StatusUpdate {
    /// Snapshot of the job's current status and counts.
    pub fn snapshot(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            request_counts: job.request_counts,
            timestamps: job.timestamps.clone(),
            output_location: None,
            error_location: None,
            errors: Vec::new(),
        }
    }
}

/// Lifecycle transitions published on the event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventKind {
    Assigned { worker_id: WorkerId },
    Completed,
    Failed { reason: String },
    Cancelled,
    Expired,
}

/// A structured job lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub tenant_id: String,
    pub status: JobStatus,
    pub request_counts: RequestCounts,
    #[serde(flatten)]
    pub kind: JobEventKind,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job: &Job, kind: JobEventKind) -> Self {
        Self {
            job_id: job.id,
            tenant_id: job.tenant_id.clone(),
            status: job.status,
            request_counts: job.request_counts,
            kind,
            at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobStatus; 8] = [
        JobStatus::Validating,
        JobStatus::InProgress,
        JobStatus::Finalizing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Expired,
        JobStatus::Cancelling,
        JobStatus::Cancelled,
    ];

    #[test]
    fn test_terminal_states_have_no_successors() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_no_status_is_revisited() {
        for status in ALL {
            assert!(!status.can_transition_to(status), "{status}");
        }
    }

    #[test]
    fn test_forward_transitions() {
        assert!(JobStatus::Validating.can_transition_to(JobStatus::InProgress));
        assert!(JobStatus::Validating.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Validating.can_transition_to(JobStatus::Expired));
        assert!(JobStatus::InProgress.can_transition_to(JobStatus::Finalizing));
        assert!(JobStatus::Finalizing.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Finalizing.can_transition_to(JobStatus::InProgress));
    }

    #[test]
    fn test_cancelling_only_leads_to_cancelled() {
        assert!(JobStatus::InProgress.can_transition_to(JobStatus::Cancelling));
        assert!(JobStatus::Cancelling.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Cancelling.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Cancelling.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn test_transition_stamps_time() {
        let mut job = Job::new("tenant-a", "/v1/chat/completions", "in.jsonl");
        let now = Utc::now();
        job.transition(JobStatus::InProgress, now).unwrap();
        assert_eq!(job.timestamps.in_progress_at, Some(now));

        let err = job.transition(JobStatus::Validating, now).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(job.status, JobStatus::InProgress);
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let job = Job::new("t", "/v1/embeddings", "in.jsonl");
        assert!(!job.is_expired(now));
        let job = job.with_expiry(now - chrono::Duration::seconds(1));
        assert!(job.is_expired(now));
    }

    #[test]
    fn test_job_deserializes_with_defaults() {
        let json = serde_json::json!({
            "id": JobId::new().to_string(),
            "tenant_id": "tenant-a",
            "endpoint": "/v1/chat/completions",
            "input_location": "uploads/in.jsonl",
            "output_location": "out.jsonl",
            "error_location": "err.jsonl",
            "created_at": "2026-01-01T00:00:00Z"
        });
        let job: Job = serde_json::from_value(json).unwrap();
        assert_eq!(job.status, JobStatus::Validating);
        assert_eq!(job.priority, 0);
        assert_eq!(job.request_counts, RequestCounts::default());
    }

    #[test]
    fn test_event_serializes_kind_inline() {
        let job = Job::new("tenant-a", "/v1/chat/completions", "in.jsonl");
        let event = JobEvent::new(
            &job,
            JobEventKind::Assigned {
                worker_id: WorkerId(2),
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "assigned");
        assert_eq!(value["worker_id"], 2);
        assert_eq!(value["status"], "validating");
    }
}
