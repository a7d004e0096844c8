//! Request lines and line results.
//!
//! Input files are JSONL in the OpenAI batch format, one request per line:
//!
//! ```text
//! {"custom_id": "req-1", "method": "POST", "url": "/v1/chat/completions", "body": {...}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::inference::{ErrorCategory, InferenceError, InferenceRequest, InferenceResponse};

/// One inference request within a job's input.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestLine {
    /// `custom_id` from the input; unique within the job.
    pub request_id: String,
    /// Position in the input, starting at 0.
    pub ordinal: u64,
    pub method: String,
    pub url: String,
    pub model: String,
    pub body: Map<String, Value>,
}

/// Why an input line could not become a [`RequestLine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRejection {
    /// The `custom_id`, if one could be read.
    pub request_id: Option<String>,
    pub message: String,
}

#[derive(Deserialize)]
struct RawLine {
    custom_id: Option<String>,
    method: Option<String>,
    url: Option<String>,
    #[serde(default)]
    body: Map<String, Value>,
}

impl RequestLine {
    /// Parse one input line.
    ///
    /// `url` defaults to the job endpoint and `model` to the body's `model`
    /// field, then to the job's default model.
    pub fn parse(
        ordinal: u64,
        raw: &str,
        endpoint: &str,
        default_model: &str,
    ) -> Result<Self, LineRejection> {
        let line: RawLine = serde_json::from_str(raw).map_err(|e| LineRejection {
            request_id: None,
            message: format!("line {} is not a valid request: {}", ordinal + 1, e),
        })?;

        let request_id = match line.custom_id {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Err(LineRejection {
                    request_id: None,
                    message: format!("line {} is missing custom_id", ordinal + 1),
                });
            }
        };

        let method = line.method.unwrap_or_else(|| "POST".to_string());
        if !method.eq_ignore_ascii_case("POST") {
            return Err(LineRejection {
                request_id: Some(request_id),
                message: format!("unsupported method: {method}"),
            });
        }

        let url = line.url.unwrap_or_else(|| endpoint.to_string());
        if url != endpoint {
            return Err(LineRejection {
                request_id: Some(request_id),
                message: format!("url {url} does not match batch endpoint {endpoint}"),
            });
        }

        let model = line
            .body
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| default_model.to_string());

        Ok(Self {
            request_id,
            ordinal,
            method: "POST".to_string(),
            url,
            model,
            body: line.body,
        })
    }

    pub fn to_inference_request(&self) -> InferenceRequest {
        InferenceRequest {
            request_id: self.request_id.clone(),
            model: self.model.clone(),
            url: self.url.clone(),
            params: self.body.clone(),
        }
    }
}

/// Terminal outcome of one line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    Succeeded(InferenceResponse),
    Failed(InferenceError),
    /// Stopped by cancellation before a terminal backend answer.
    Cancelled,
}

/// Result of executing one request line.
#[derive(Debug, Clone, PartialEq)]
pub struct LineResult {
    pub request_id: String,
    pub ordinal: u64,
    pub model: String,
    /// Backend attempts consumed; 0 when the line never reached the backend.
    pub attempts: u32,
    pub outcome: LineOutcome,
}

impl LineResult {
    /// A line rejected before any backend call.
    pub fn rejected(ordinal: u64, rejection: LineRejection, model: &str) -> Self {
        Self {
            request_id: rejection
                .request_id
                .unwrap_or_else(|| format!("line-{}", ordinal + 1)),
            ordinal,
            model: model.to_string(),
            attempts: 0,
            outcome: LineOutcome::Failed(InferenceError::new(
                ErrorCategory::InvalidRequest,
                rejection.message,
            )),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, LineOutcome::Succeeded(_))
    }

    /// Encode the result as one JSONL record, without the trailing newline.
    pub fn to_record(&self) -> serde_json::Result<Vec<u8>> {
        let id = format!("batch_req_{}", Uuid::now_v7().simple());
        let record = match &self.outcome {
            LineOutcome::Succeeded(response) => OutputRecord {
                id,
                custom_id: &self.request_id,
                response: Some(ResponseRecord {
                    status_code: response.status_code,
                    request_id: &response.request_id,
                    body: decode_body(&response.body),
                }),
                error: None,
            },
            LineOutcome::Failed(err) => OutputRecord {
                id,
                custom_id: &self.request_id,
                response: None,
                error: Some(ErrorRecord {
                    code: err.category.error_code(),
                    message: &err.message,
                }),
            },
            LineOutcome::Cancelled => OutputRecord {
                id,
                custom_id: &self.request_id,
                response: None,
                error: Some(ErrorRecord {
                    code: "batch_cancelled",
                    message: "request not completed before the batch was cancelled",
                }),
            },
        };
        serde_json::to_vec(&record)
    }
}

fn decode_body(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

#[derive(Serialize)]
struct OutputRecord<'a> {
    id: String,
    custom_id: &'a str,
    response: Option<ResponseRecord<'a>>,
    error: Option<ErrorRecord<'a>>,
}

#[derive(Serialize)]
struct ResponseRecord<'a> {
    status_code: u16,
    request_id: &'a str,
    body: Value,
}

#[derive(Serialize)]
struct ErrorRecord<'a> {
    code: &'a str,
    message: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const ENDPOINT: &str = "/v1/chat/completions";

    #[test]
    fn test_parse_full_line() {
        let raw = r#"{"custom_id":"req-1","method":"POST","url":"/v1/chat/completions","body":{"model":"llama","messages":[]}}"#;
        let line = RequestLine::parse(0, raw, ENDPOINT, "default").unwrap();
        assert_eq!(line.request_id, "req-1");
        assert_eq!(line.model, "llama");
        assert_eq!(line.url, ENDPOINT);
        assert!(line.body.contains_key("messages"));
    }

    #[test]
    fn test_parse_defaults_url_and_model() {
        let raw = r#"{"custom_id":"req-2","body":{"messages":[]}}"#;
        let line = RequestLine::parse(4, raw, ENDPOINT, "default-model").unwrap();
        assert_eq!(line.ordinal, 4);
        assert_eq!(line.url, ENDPOINT);
        assert_eq!(line.model, "default-model");
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        let err = RequestLine::parse(2, "{not json", ENDPOINT, "m").unwrap_err();
        assert!(err.request_id.is_none());
        assert!(err.message.contains("line 3"));

        let err = RequestLine::parse(0, r#"{"body":{}}"#, ENDPOINT, "m").unwrap_err();
        assert!(err.message.contains("custom_id"));

        let raw = r#"{"custom_id":"x","url":"/v1/embeddings","body":{}}"#;
        let err = RequestLine::parse(0, raw, ENDPOINT, "m").unwrap_err();
        assert_eq!(err.request_id.as_deref(), Some("x"));
    }

    #[test]
    fn test_rejected_result_is_invalid_request_without_attempts() {
        let result = LineResult::rejected(
            6,
            LineRejection {
                request_id: None,
                message: "bad".to_string(),
            },
            "m",
        );
        assert_eq!(result.request_id, "line-7");
        assert_eq!(result.attempts, 0);
        match result.outcome {
            LineOutcome::Failed(err) => assert_eq!(err.category, ErrorCategory::InvalidRequest),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_success_record_embeds_json_body() {
        let result = LineResult {
            request_id: "req-1".to_string(),
            ordinal: 0,
            model: "m".to_string(),
            attempts: 1,
            outcome: LineOutcome::Succeeded(InferenceResponse {
                request_id: "req-1".to_string(),
                status_code: 200,
                body: Bytes::from_static(br#"{"choices":[]}"#),
            }),
        };
        let value: Value = serde_json::from_slice(&result.to_record().unwrap()).unwrap();
        assert_eq!(value["custom_id"], "req-1");
        assert_eq!(value["response"]["status_code"], 200);
        assert!(value["response"]["body"]["choices"].is_array());
        assert!(value["error"].is_null());
        assert!(value["id"].as_str().unwrap().starts_with("batch_req_"));
    }

    #[test]
    fn test_error_record_uses_category_code() {
        let result = LineResult {
            request_id: "req-9".to_string(),
            ordinal: 8,
            model: "m".to_string(),
            attempts: 1,
            outcome: LineOutcome::Failed(InferenceError::new(
                ErrorCategory::AuthError,
                "bad key",
            )),
        };
        let value: Value = serde_json::from_slice(&result.to_record().unwrap()).unwrap();
        assert!(value["response"].is_null());
        assert_eq!(value["error"]["code"], "authentication_error");
        assert_eq!(value["error"]["message"], "bad key");
    }
}
