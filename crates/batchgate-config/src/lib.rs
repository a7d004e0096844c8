//! KDL configuration parsing for the batchgate processor.
//!
//! This crate handles parsing of:
//! - Processor scheduling settings (workers, concurrency, cadences)
//! - Retry policy
//! - Inference backend, storage and metrics settings

pub mod duration;
pub mod error;
pub mod processor;

pub use error::{ConfigError, ConfigResult};
pub use processor::{
    BucketConfig, InferenceConfig, MetricsConfig, ProcessorConfig, RetryConfig, SchedulerConfig,
    StorageConfig, load_processor_config, parse_processor_config,
};
