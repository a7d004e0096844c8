//! Prometheus metrics for the batch processor.

use batchgate_config::{BucketConfig, MetricsConfig};
use batchgate_core::metrics::{JobResultLabel, MetricsSink, ReasonLabel, SizeBucket};
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

/// Content type of the text exposition format.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Processor metrics backed by a Prometheus registry.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Arc<Registry>,
    jobs_processed: IntCounterVec,
    processing_duration: HistogramVec,
    queue_wait: HistogramVec,
    total_workers: IntGauge,
    active_workers: IntGauge,
    model_errors: IntCounterVec,
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> prometheus::Result<C> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn buckets(config: &BucketConfig) -> prometheus::Result<Vec<f64>> {
    prometheus::exponential_buckets(config.start, config.factor, config.count)
}

impl PrometheusMetrics {
    pub fn new(config: &MetricsConfig) -> prometheus::Result<Self> {
        let registry = Registry::new();

        let jobs_processed = register(
            &registry,
            IntCounterVec::new(
                Opts::new("jobs_processed_total", "Batch jobs processed, by result and reason"),
                &["result", "reason"],
            )?,
        )?;
        let processing_duration = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "job_processing_duration_seconds",
                    "Time from pickup to terminal status",
                )
                .buckets(buckets(&config.process_time_buckets)?),
                &["tenant", "size_bucket"],
            )?,
        )?;
        let queue_wait = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "job_queue_wait_duration_seconds",
                    "Time from job creation to pickup",
                )
                .buckets(buckets(&config.queue_time_buckets)?),
                &["tenant"],
            )?,
        )?;
        let total_workers = register(
            &registry,
            IntGauge::new("total_workers", "Configured worker slots")?,
        )?;
        let active_workers = register(
            &registry,
            IntGauge::new("active_workers", "Worker slots running a job")?,
        )?;
        let model_errors = register(
            &registry,
            IntCounterVec::new(
                Opts::new("job_errors_by_model_total", "Failed request lines, by model"),
                &["model"],
            )?,
        )?;

        Ok(Self {
            registry: Arc::new(registry),
            jobs_processed,
            processing_duration,
            queue_wait,
            total_workers,
            active_workers,
            model_errors,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode every metric in the text exposition format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_job_processed(&self, result: JobResultLabel, reason: ReasonLabel) {
        let (result, reason) = (result.to_string(), reason.to_string());
        self.jobs_processed
            .with_label_values(&[result.as_str(), reason.as_str()])
            .inc();
    }

    fn record_processing_duration(&self, tenant: &str, size: SizeBucket, elapsed: Duration) {
        let size = size.to_string();
        self.processing_duration
            .with_label_values(&[tenant, size.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    fn record_queue_wait(&self, tenant: &str, waited: Duration) {
        self.queue_wait
            .with_label_values(&[tenant])
            .observe(waited.as_secs_f64());
    }

    fn set_total_workers(&self, total: usize) {
        self.total_workers.set(total as i64);
    }

    fn inc_active_workers(&self) {
        self.active_workers.inc();
    }

    fn dec_active_workers(&self) {
        self.active_workers.dec();
    }

    fn record_model_error(&self, model: &str) {
        self.model_errors.with_label_values(&[model]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> PrometheusMetrics {
        PrometheusMetrics::new(&MetricsConfig::default()).unwrap()
    }

    #[test]
    fn test_counters_and_gauges() {
        let metrics = metrics();
        metrics.record_job_processed(JobResultLabel::Success, ReasonLabel::None);
        metrics.record_job_processed(JobResultLabel::Success, ReasonLabel::None);
        metrics.record_job_processed(JobResultLabel::Failed, ReasonLabel::Expired);
        metrics.set_total_workers(4);
        metrics.inc_active_workers();
        metrics.inc_active_workers();
        metrics.dec_active_workers();
        metrics.record_model_error("llama");

        assert_eq!(
            metrics
                .jobs_processed
                .with_label_values(&["success", "none"])
                .get(),
            2
        );
        assert_eq!(
            metrics
                .jobs_processed
                .with_label_values(&["failed", "expired"])
                .get(),
            1
        );
        assert_eq!(metrics.total_workers.get(), 4);
        assert_eq!(metrics.active_workers.get(), 1);
        assert_eq!(metrics.model_errors.with_label_values(&["llama"]).get(), 1);
    }

    #[test]
    fn test_histograms_use_configured_buckets() {
        let metrics = metrics();
        metrics.record_processing_duration("acme", SizeBucket::Under100, Duration::from_secs(3));
        metrics.record_queue_wait("acme", Duration::from_millis(250));

        let histogram = metrics
            .processing_duration
            .with_label_values(&["acme", "100"]);
        assert_eq!(histogram.get_sample_count(), 1);
        assert_eq!(histogram.get_sample_sum(), 3.0);
        assert_eq!(
            metrics
                .queue_wait
                .with_label_values(&["acme"])
                .get_sample_count(),
            1
        );
    }

    #[test]
    fn test_render_exposition() {
        let metrics = metrics();
        metrics.record_job_processed(JobResultLabel::Failed, ReasonLabel::UserError);
        metrics.set_total_workers(2);

        let text = metrics.render().unwrap();
        assert!(text.contains("jobs_processed_total"));
        assert!(text.contains("reason=\"user_error\""));
        assert!(text.contains("total_workers 2"));
    }

    #[test]
    fn test_invalid_buckets_rejected() {
        let mut config = MetricsConfig::default();
        config.queue_time_buckets.factor = 1.0;
        assert!(PrometheusMetrics::new(&config).is_err());
    }
}
