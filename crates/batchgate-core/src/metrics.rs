//! Metrics sink abstraction.
//!
//! Components receive an `Arc<dyn MetricsSink>` instead of touching a
//! process-wide registry.

use derive_more::Display;
use std::time::Duration;

/// Outcome label for processed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum JobResultLabel {
    #[display("success")]
    Success,
    #[display("failed")]
    Failed,
}

/// Reason label for processed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ReasonLabel {
    #[display("none")]
    None,
    /// Bad input, validation failures.
    #[display("user_error")]
    UserError,
    /// Storage or backend failures, panics.
    #[display("system_error")]
    SystemError,
    #[display("cancelled")]
    Cancelled,
    #[display("expired")]
    Expired,
    #[display("unknown")]
    Unknown,
}

/// Job size bucket by line count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SizeBucket {
    #[display("100")]
    Under100,
    #[display("1000")]
    Under1000,
    #[display("10000")]
    Under10000,
    #[display("30000")]
    Under30000,
    #[display("large")]
    Large,
}

impl SizeBucket {
    pub fn from_lines(total: u64) -> Self {
        match total {
            0..100 => SizeBucket::Under100,
            100..1_000 => SizeBucket::Under1000,
            1_000..10_000 => SizeBucket::Under10000,
            10_000..30_000 => SizeBucket::Under30000,
            _ => SizeBucket::Large,
        }
    }
}

/// Receiver of processor metrics.
pub trait MetricsSink: Send + Sync {
    fn record_job_processed(&self, result: JobResultLabel, reason: ReasonLabel);

    fn record_processing_duration(&self, tenant: &str, size: SizeBucket, elapsed: Duration);

    fn record_queue_wait(&self, tenant: &str, waited: Duration);

    fn set_total_workers(&self, total: usize);

    fn inc_active_workers(&self);

    fn dec_active_workers(&self);

    /// One failed line for `model`.
    fn record_model_error(&self, model: &str);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_job_processed(&self, _result: JobResultLabel, _reason: ReasonLabel) {}
    fn record_processing_duration(&self, _tenant: &str, _size: SizeBucket, _elapsed: Duration) {}
    fn record_queue_wait(&self, _tenant: &str, _waited: Duration) {}
    fn set_total_workers(&self, _total: usize) {}
    fn inc_active_workers(&self) {}
    fn dec_active_workers(&self) {}
    fn record_model_error(&self, _model: &str) {}
}
