//! Core domain types and traits for the batchgate batch processor.
//!
//! This crate contains:
//! - Job identifiers, the job status machine and request counts
//! - Request lines and line results, plus their artifact encodings
//! - The inference error taxonomy and its classifier
//! - Collaborator traits (queue, status store, events, files, repository)
//! - The metrics sink abstraction

pub mod clients;
pub mod error;
pub mod id;
pub mod inference;
pub mod job;
pub mod metrics;
pub mod request;

pub use error::{Error, Result};
pub use id::{JobId, WorkerId};
pub use inference::{BackendFailure, ErrorCategory, InferenceError, classify};
pub use job::{
    Job, JobError, JobEvent, JobEventKind, JobStatus, JobTimestamps, RequestCounts, StatusUpdate,
};
pub use request::{LineOutcome, LineRejection, LineResult, RequestLine};
