//! Processor configuration parsing.
//!
//! ```kdl
//! processor {
//!     num-workers 4
//!     max-job-concurrency 10
//!     poll-interval "5s"
//!     task-wait-time "1s"
//! }
//! retry {
//!     max-attempts 5
//!     initial-backoff "500ms"
//! }
//! inference {
//!     base-url "http://localhost:8000"
//! }
//! ```

use crate::duration::parse_duration;
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Full processor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub inference: InferenceConfig,
    pub storage: StorageConfig,
    pub metrics: MetricsConfig,
}

/// Scheduling and concurrency settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker pool capacity: jobs running at once.
    pub num_workers: usize,
    /// Lines of one job running at once.
    pub max_job_concurrency: usize,
    /// Cadence of the polling loop.
    pub poll_interval: Duration,
    /// Bounded wait of one dequeue call; shorter than `poll_interval`.
    pub task_wait_time: Duration,
    /// Cadence of moving new jobs from the repository into the queue.
    pub refresh_interval: Duration,
    pub refresh_batch_size: usize,
    /// Publish progress every this many line results.
    pub progress_interval: u64,
    pub cancel_poll_interval: Duration,
    pub error_backoff_initial: Duration,
    pub error_backoff_max: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            max_job_concurrency: 10,
            poll_interval: Duration::from_secs(5),
            task_wait_time: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(30),
            refresh_batch_size: 100,
            progress_interval: 100,
            cancel_poll_interval: Duration::from_secs(5),
            error_backoff_initial: Duration::from_secs(1),
            error_backoff_max: Duration::from_secs(30),
        }
    }
}

/// Per-line retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Inference backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub base_url: Option<String>,
    pub request_timeout: Duration,
    /// Environment variable holding the bearer token.
    pub api_key_env: Option<String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout: Duration::from_secs(60),
            api_key_env: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub files_root: PathBuf,
    pub spool_dir: PathBuf,
    pub max_output_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            files_root: PathBuf::from("/var/lib/batchgate/files"),
            spool_dir: PathBuf::from("/var/lib/batchgate/spool"),
            max_output_bytes: 200 * 1024 * 1024,
        }
    }
}

/// Exponential histogram buckets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub start: f64,
    pub factor: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub addr: String,
    pub process_time_buckets: BucketConfig,
    pub queue_time_buckets: BucketConfig,
    /// PEM certificate chain; the listener serves TLS when this and
    /// `ssl_key_file` are both set.
    pub ssl_cert_file: Option<PathBuf>,
    pub ssl_key_file: Option<PathBuf>,
}

impl MetricsConfig {
    /// Certificate and key paths, when TLS is configured.
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        match (&self.ssl_cert_file, &self.ssl_key_file) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:9090".to_string(),
            process_time_buckets: BucketConfig {
                start: 0.1,
                factor: 2.0,
                count: 15,
            },
            queue_time_buckets: BucketConfig {
                start: 0.1,
                factor: 2.0,
                count: 10,
            },
            ssl_cert_file: None,
            ssl_key_file: None,
        }
    }
}

impl ProcessorConfig {
    /// Check cross-field constraints.
    pub fn validate(&self) -> ConfigResult<()> {
        let s = &self.scheduler;
        if s.num_workers == 0 {
            return Err(ConfigError::invalid("num-workers", "must be at least 1"));
        }
        if s.max_job_concurrency == 0 {
            return Err(ConfigError::invalid(
                "max-job-concurrency",
                "must be at least 1",
            ));
        }
        if s.task_wait_time >= s.poll_interval {
            return Err(ConfigError::invalid(
                "task-wait-time",
                "must be shorter than poll-interval",
            ));
        }
        if s.refresh_batch_size == 0 {
            return Err(ConfigError::invalid(
                "refresh-batch-size",
                "must be at least 1",
            ));
        }
        if s.progress_interval == 0 {
            return Err(ConfigError::invalid("progress-interval", "must be at least 1"));
        }
        if s.error_backoff_initial > s.error_backoff_max {
            return Err(ConfigError::invalid(
                "error-backoff-initial",
                "must not exceed error-backoff-max",
            ));
        }

        let r = &self.retry;
        if r.max_attempts == 0 {
            return Err(ConfigError::invalid("max-attempts", "must be at least 1"));
        }
        if r.multiplier < 1.0 {
            return Err(ConfigError::invalid("multiplier", "must be at least 1.0"));
        }
        if r.initial_backoff > r.max_backoff {
            return Err(ConfigError::invalid(
                "initial-backoff",
                "must not exceed max-backoff",
            ));
        }

        validate_buckets("process-time-buckets", &self.metrics.process_time_buckets)?;
        validate_buckets("queue-time-buckets", &self.metrics.queue_time_buckets)?;
        validate_tls(&self.metrics)?;
        Ok(())
    }
}

fn validate_tls(metrics: &MetricsConfig) -> ConfigResult<()> {
    let files = [
        ("ssl-cert-file", &metrics.ssl_cert_file),
        ("ssl-key-file", &metrics.ssl_key_file),
    ];
    match files {
        [(_, None), (_, None)] => Ok(()),
        [(_, Some(_)), (_, Some(_))] => {
            for (field, path) in files {
                if let Some(path) = path.as_deref().filter(|p| !p.is_file()) {
                    return Err(ConfigError::invalid(
                        field,
                        format!("{} does not exist", path.display()),
                    ));
                }
            }
            Ok(())
        }
        _ => Err(ConfigError::invalid(
            "ssl-cert-file",
            "ssl-cert-file and ssl-key-file must be set together",
        )),
    }
}

fn validate_buckets(field: &str, buckets: &BucketConfig) -> ConfigResult<()> {
    if buckets.start <= 0.0 || buckets.factor <= 1.0 || buckets.count == 0 {
        return Err(ConfigError::invalid(
            field,
            "requires start > 0, factor > 1 and count >= 1",
        ));
    }
    Ok(())
}

/// Read and parse a configuration file.
pub fn load_processor_config(path: impl AsRef<Path>) -> ConfigResult<ProcessorConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_processor_config(&text)
}

/// Parse processor configuration from KDL text.
pub fn parse_processor_config(kdl: &str) -> ConfigResult<ProcessorConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = ProcessorConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "processor" => parse_scheduler(node, &mut config.scheduler)?,
            "retry" => parse_retry(node, &mut config.retry)?,
            "inference" => parse_inference(node, &mut config.inference)?,
            "storage" => parse_storage(node, &mut config.storage)?,
            "metrics" => parse_metrics(node, &mut config.metrics)?,
            _ => {} // Ignore unknown nodes
        }
    }

    config.validate()?;
    Ok(config)
}

fn parse_scheduler(node: &KdlNode, cfg: &mut SchedulerConfig) -> ConfigResult<()> {
    for child in children(node) {
        let field = child.name().value();
        match field {
            "num-workers" => cfg.num_workers = get_usize(child, field)?,
            "max-job-concurrency" => cfg.max_job_concurrency = get_usize(child, field)?,
            "poll-interval" => cfg.poll_interval = get_duration(child, field)?,
            "task-wait-time" => cfg.task_wait_time = get_duration(child, field)?,
            "refresh-interval" => cfg.refresh_interval = get_duration(child, field)?,
            "refresh-batch-size" => cfg.refresh_batch_size = get_usize(child, field)?,
            "progress-interval" => cfg.progress_interval = get_usize(child, field)? as u64,
            "cancel-poll-interval" => cfg.cancel_poll_interval = get_duration(child, field)?,
            "error-backoff-initial" => cfg.error_backoff_initial = get_duration(child, field)?,
            "error-backoff-max" => cfg.error_backoff_max = get_duration(child, field)?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_retry(node: &KdlNode, cfg: &mut RetryConfig) -> ConfigResult<()> {
    for child in children(node) {
        let field = child.name().value();
        match field {
            "max-attempts" => {
                cfg.max_attempts = u32::try_from(get_usize(child, field)?)
                    .map_err(|_| ConfigError::invalid(field, "out of range"))?;
            }
            "initial-backoff" => cfg.initial_backoff = get_duration(child, field)?,
            "max-backoff" => cfg.max_backoff = get_duration(child, field)?,
            "multiplier" => cfg.multiplier = get_f64(child, field)?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_inference(node: &KdlNode, cfg: &mut InferenceConfig) -> ConfigResult<()> {
    for child in children(node) {
        let field = child.name().value();
        match field {
            "base-url" => cfg.base_url = Some(get_string(child, field)?),
            "request-timeout" => cfg.request_timeout = get_duration(child, field)?,
            "api-key-env" => cfg.api_key_env = Some(get_string(child, field)?),
            _ => {}
        }
    }
    Ok(())
}

fn parse_storage(node: &KdlNode, cfg: &mut StorageConfig) -> ConfigResult<()> {
    for child in children(node) {
        let field = child.name().value();
        match field {
            "files-root" => cfg.files_root = PathBuf::from(get_string(child, field)?),
            "spool-dir" => cfg.spool_dir = PathBuf::from(get_string(child, field)?),
            "max-output-bytes" => cfg.max_output_bytes = get_usize(child, field)? as u64,
            _ => {}
        }
    }
    Ok(())
}

fn parse_metrics(node: &KdlNode, cfg: &mut MetricsConfig) -> ConfigResult<()> {
    for child in children(node) {
        let field = child.name().value();
        match field {
            "addr" => cfg.addr = get_string(child, field)?,
            "ssl-cert-file" => {
                cfg.ssl_cert_file = Some(PathBuf::from(get_string(child, field)?))
            }
            "ssl-key-file" => {
                cfg.ssl_key_file = Some(PathBuf::from(get_string(child, field)?))
            }
            "process-time-buckets" => {
                cfg.process_time_buckets = parse_buckets(child, cfg.process_time_buckets)?
            }
            "queue-time-buckets" => {
                cfg.queue_time_buckets = parse_buckets(child, cfg.queue_time_buckets)?
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_buckets(node: &KdlNode, defaults: BucketConfig) -> ConfigResult<BucketConfig> {
    let field = node.name().value();
    let mut buckets = defaults;
    if let Some(value) = node.get("start") {
        buckets.start =
            as_f64(value).ok_or_else(|| ConfigError::invalid(field, "start must be a number"))?;
    }
    if let Some(value) = node.get("factor") {
        buckets.factor =
            as_f64(value).ok_or_else(|| ConfigError::invalid(field, "factor must be a number"))?;
    }
    if let Some(value) = node.get("count") {
        buckets.count = value
            .as_integer()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| ConfigError::invalid(field, "count must be a non-negative integer"))?;
    }
    Ok(buckets)
}

// Helper functions for extracting values from KDL nodes

fn children(node: &KdlNode) -> &[KdlNode] {
    node.children().map(|doc| doc.nodes()).unwrap_or(&[])
}

fn get_first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn get_string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    let value = get_first_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    value
        .as_string()
        .map(|s| s.to_string())
        .ok_or_else(|| ConfigError::invalid(field, "expected a string"))
}

fn get_usize(node: &KdlNode, field: &str) -> ConfigResult<usize> {
    let value = get_first_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    value
        .as_integer()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| ConfigError::invalid(field, "expected a non-negative integer"))
}

fn get_f64(node: &KdlNode, field: &str) -> ConfigResult<f64> {
    let value = get_first_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    as_f64(value).ok_or_else(|| ConfigError::invalid(field, "expected a number"))
}

fn get_duration(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    let raw = get_string(node, field)?;
    parse_duration(&raw).map_err(|message| ConfigError::invalid(field, message))
}

fn as_f64(value: &KdlValue) -> Option<f64> {
    value
        .as_float()
        .or_else(|| value.as_integer().map(|n| n as f64))
}
