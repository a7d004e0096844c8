//! Inference backend trait and the error classifier.
//!
//! Backends report failures as [`BackendFailure`] values; [`classify`]
//! maps each one to an [`ErrorCategory`] that drives the retry policy.

use async_trait::async_trait;
use bytes::Bytes;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Retry category of a failed inference attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    #[display("rate_limit")]
    RateLimit,
    #[display("server_error")]
    ServerError,
    #[display("invalid_request")]
    InvalidRequest,
    #[display("auth_error")]
    AuthError,
    #[display("unknown")]
    Unknown,
}

impl ErrorCategory {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCategory::RateLimit | ErrorCategory::ServerError)
    }

    /// Error code written to the batch error file.
    pub fn error_code(self) -> &'static str {
        match self {
            ErrorCategory::RateLimit => "rate_limit_exceeded",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::InvalidRequest => "invalid_request",
            ErrorCategory::AuthError => "authentication_error",
            ErrorCategory::Unknown => "unknown_error",
        }
    }
}

/// A raw failure observed while talking to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendFailure {
    /// The backend answered with a non-success HTTP status.
    Status {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },
    /// No response within the request deadline.
    Timeout(String),
    /// The connection could not be established.
    Connect(String),
    /// The connection dropped mid-request.
    ConnectionReset(String),
    /// The request could not be built or encoded locally.
    Request(String),
    Other(String),
}

impl BackendFailure {
    fn message(&self) -> &str {
        match self {
            BackendFailure::Status { message, .. } => message,
            BackendFailure::Timeout(m)
            | BackendFailure::Connect(m)
            | BackendFailure::ConnectionReset(m)
            | BackendFailure::Request(m)
            | BackendFailure::Other(m) => m,
        }
    }
}

/// Map a raw failure to its retry category.
///
/// Unrecognized failures are `Unknown` and are never retried.
pub fn classify(failure: &BackendFailure) -> ErrorCategory {
    match failure {
        BackendFailure::Status { status, .. } => match *status {
            429 => ErrorCategory::RateLimit,
            408 | 500..=599 => ErrorCategory::ServerError,
            401 | 403 => ErrorCategory::AuthError,
            400 | 404 | 405 | 409 | 413 | 415 | 422 => ErrorCategory::InvalidRequest,
            _ => ErrorCategory::Unknown,
        },
        BackendFailure::Timeout(_)
        | BackendFailure::Connect(_)
        | BackendFailure::ConnectionReset(_) => ErrorCategory::ServerError,
        BackendFailure::Request(_) => ErrorCategory::InvalidRequest,
        BackendFailure::Other(_) => ErrorCategory::Unknown,
    }
}

/// A classified inference failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{category}: {message}")]
pub struct InferenceError {
    pub category: ErrorCategory,
    pub message: String,
    /// HTTP status of the failed attempt, when there was one.
    pub status: Option<u16>,
    /// Backend hint for the earliest sensible retry.
    pub retry_after: Option<Duration>,
}

impl InferenceError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

impl From<BackendFailure> for InferenceError {
    fn from(failure: BackendFailure) -> Self {
        let category = classify(&failure);
        let message = failure.message().to_string();
        match failure {
            BackendFailure::Status {
                status,
                retry_after,
                ..
            } => Self {
                category,
                message,
                status: Some(status),
                retry_after,
            },
            _ => Self::new(category, message),
        }
    }
}

/// One request sent to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Caller-supplied id, echoed back in the response.
    pub request_id: String,
    pub model: String,
    /// Endpoint path, e.g. `/v1/chat/completions`.
    pub url: String,
    /// Open-ended request parameters (the JSON body).
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// A successful backend response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceResponse {
    pub request_id: String,
    pub status_code: u16,
    /// Raw response payload.
    pub body: Bytes,
}

/// Trait for inference backends.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Execute one request. Every failure comes back classified.
    async fn generate(
        &self,
        request: &InferenceRequest,
    ) -> std::result::Result<InferenceResponse, InferenceError>;
}
