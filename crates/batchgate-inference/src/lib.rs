//! Inference backends for batchgate.
//!
//! Provides client implementations that run single batch lines:
//! - OpenAI-compatible HTTP (vLLM, TGI, hosted gateways)

pub mod http;

pub use batchgate_core::inference::{
    BackendFailure, InferenceClient, InferenceError, InferenceRequest, InferenceResponse,
};
pub use http::HttpInferenceClient;
