//! OpenAI-compatible HTTP inference backend.

use async_trait::async_trait;
use batchgate_config::InferenceConfig;
use batchgate_core::inference::*;
use batchgate_core::{Error, Result};
use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

const MAX_ERROR_MESSAGE: usize = 512;

/// Inference client that POSTs each request body to `base_url + url`.
#[derive(Debug, Clone)]
pub struct HttpInferenceClient {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpInferenceClient {
    pub fn new(base_url: Url, timeout: Duration, api_key: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    /// Build a client from the `inference` config section.
    ///
    /// The bearer token, when configured, is read from the named environment
    /// variable; a configured but unset variable is an error.
    pub fn from_config(config: &InferenceConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| Error::InvalidInput("inference base-url is not configured".into()))?;
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::InvalidInput(format!("inference base-url {base_url}: {e}")))?;

        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                Error::InvalidInput(format!("environment variable {var} is not set"))
            })?),
            None => None,
        };

        Self::new(base_url, config.request_timeout, api_key)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> std::result::Result<Url, BackendFailure> {
        join_endpoint(&self.base_url, path)
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn generate(
        &self,
        request: &InferenceRequest,
    ) -> std::result::Result<InferenceResponse, InferenceError> {
        let endpoint = self.endpoint(&request.url)?;

        let mut body = request.params.clone();
        body.entry("model")
            .or_insert_with(|| Value::String(request.model.clone()));

        let mut builder = self.http.post(endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header(AUTHORIZATION, format!("Bearer {key}"));
        }

        let response = builder.send().await.map_err(transport_failure)?;
        let status = response.status();
        let retry_after = retry_after_hint(status, response.headers().get(RETRY_AFTER));
        let payload = response.bytes().await.map_err(transport_failure)?;

        debug!(
            request_id = %request.request_id,
            status = status.as_u16(),
            bytes = payload.len(),
            "Inference response"
        );

        if !status.is_success() {
            return Err(BackendFailure::Status {
                status: status.as_u16(),
                message: error_message(status, &payload),
                retry_after,
            }
            .into());
        }

        Ok(InferenceResponse {
            request_id: request.request_id.clone(),
            status_code: status.as_u16(),
            body: payload,
        })
    }
}

/// Append an endpoint path to the base URL, keeping any base path prefix.
fn join_endpoint(base: &Url, path: &str) -> std::result::Result<Url, BackendFailure> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|e| BackendFailure::Request(format!("invalid url {joined}: {e}")))
}

fn transport_failure(err: reqwest::Error) -> BackendFailure {
    let message = err.to_string();
    if err.is_builder() {
        BackendFailure::Request(message)
    } else if err.is_timeout() {
        BackendFailure::Timeout(message)
    } else if err.is_connect() {
        BackendFailure::Connect(message)
    } else if err.is_request() || err.is_body() || err.is_decode() {
        BackendFailure::ConnectionReset(message)
    } else {
        BackendFailure::Other(message)
    }
}

/// `Retry-After` is only honoured on 429 and 503, and only in delta-seconds form.
fn retry_after_hint(
    status: StatusCode,
    header: Option<&reqwest::header::HeaderValue>,
) -> Option<Duration> {
    if status != StatusCode::TOO_MANY_REQUESTS && status != StatusCode::SERVICE_UNAVAILABLE {
        return None;
    }
    parse_retry_after(header?.to_str().ok()?)
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Pull a readable message out of an error body.
fn error_message(status: StatusCode, body: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<Value>(body) {
        let message = json
            .pointer("/error/message")
            .or_else(|| json.get("message"))
            .or_else(|| json.get("detail"))
            .or_else(|| json.get("error"))
            .and_then(Value::as_str);
        if let Some(message) = message {
            return truncate(message);
        }
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        status.to_string()
    } else {
        truncate(text)
    }
}

fn truncate(message: &str) -> String {
    message.chars().take(MAX_ERROR_MESSAGE).collect()
}
