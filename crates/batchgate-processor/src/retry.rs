//! Per-line execution with classified retries.

use batchgate_config::RetryConfig;
use batchgate_core::inference::InferenceClient;
use batchgate_core::{LineOutcome, LineResult, RequestLine};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exponential backoff for retryable line failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per line, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.multiplier,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Delay after the `failed`-th failed attempt (1-based).
    ///
    /// A backend `hint` can lengthen the delay but never past `max_backoff`.
    pub fn backoff(&self, failed: u32, hint: Option<Duration>) -> Duration {
        let exponent = failed.saturating_sub(1).min(64) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let computed = Duration::try_from_secs_f64(secs).unwrap_or(self.max_backoff);
        computed
            .max(hint.unwrap_or_default())
            .min(self.max_backoff)
    }
}

/// Runs one request line against the inference backend.
#[derive(Clone)]
pub struct LineExecutor {
    client: Arc<dyn InferenceClient>,
    policy: RetryPolicy,
}

impl LineExecutor {
    pub fn new(client: Arc<dyn InferenceClient>, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// Execute a line, retrying retryable failures with backoff.
    ///
    /// An attempt already sent to the backend is allowed to finish. Once
    /// `cancel` fires no further attempt starts, and a pending backoff is
    /// cut short.
    pub async fn execute(&self, line: RequestLine, cancel: &CancellationToken) -> LineResult {
        let request = line.to_inference_request();
        let mut attempts = 0;

        let outcome = loop {
            if cancel.is_cancelled() {
                break LineOutcome::Cancelled;
            }
            attempts += 1;
            let err = match self.client.generate(&request).await {
                Ok(response) => break LineOutcome::Succeeded(response),
                Err(err) => err,
            };

            if !err.is_retryable() || attempts >= self.policy.max_attempts {
                debug!(
                    request_id = %line.request_id,
                    attempts,
                    category = %err.category,
                    error = %err.message,
                    "Request failed"
                );
                break LineOutcome::Failed(err);
            }

            let delay = self.policy.backoff(attempts, err.retry_after);
            debug!(
                request_id = %line.request_id,
                attempt = attempts,
                category = %err.category,
                delay_ms = delay.as_millis() as u64,
                "Retrying request"
            );
            tokio::select! {
                _ = cancel.cancelled() => break LineOutcome::Cancelled,
                _ = sleep(delay) => {}
            }
        };

        LineResult {
            request_id: line.request_id,
            ordinal: line.ordinal,
            model: line.model,
            attempts,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedInference, failure, line};
    use batchgate_core::{BackendFailure, ErrorCategory};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = policy(10);
        assert_eq!(policy.backoff(1, None), Duration::from_millis(100));
        assert_eq!(policy.backoff(2, None), Duration::from_millis(200));
        assert_eq!(policy.backoff(3, None), Duration::from_millis(400));
        assert_eq!(policy.backoff(10, None), Duration::from_secs(2));
        assert_eq!(policy.backoff(u32::MAX, None), Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_honors_hint_within_cap() {
        let policy = policy(10);
        assert_eq!(
            policy.backoff(1, Some(Duration::from_secs(1))),
            Duration::from_secs(1)
        );
        assert_eq!(
            policy.backoff(1, Some(Duration::from_secs(60))),
            Duration::from_secs(2)
        );
        // A hint shorter than the computed delay does not shorten it.
        assert_eq!(
            policy.backoff(3, Some(Duration::from_millis(10))),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn test_policy_from_config_needs_one_attempt() {
        let config = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert_eq!(RetryPolicy::from(&config).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_try() {
        let client = Arc::new(ScriptedInference::new());
        let executor = LineExecutor::new(client.clone(), policy(3));

        let result = executor.execute(line(0, "a"), &CancellationToken::new()).await;
        assert!(result.is_success());
        assert_eq!(result.attempts, 1);
        assert_eq!(client.calls("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_twice_then_succeeds() {
        let client = Arc::new(ScriptedInference::new());
        client.script("a", [failure(429), failure(429)]);
        let executor = LineExecutor::new(client.clone(), policy(5));

        let result = executor.execute(line(0, "a"), &CancellationToken::new()).await;
        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let client = Arc::new(ScriptedInference::new());
        client.script("a", [failure(503), failure(503), failure(503), failure(503)]);
        let executor = LineExecutor::new(client.clone(), policy(3));

        let result = executor.execute(line(0, "a"), &CancellationToken::new()).await;
        assert_eq!(result.attempts, 3);
        assert_eq!(client.calls("a"), 3);
        match result.outcome {
            LineOutcome::Failed(err) => assert_eq!(err.category, ErrorCategory::ServerError),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        for status in [401, 400, 418] {
            let client = Arc::new(ScriptedInference::new());
            client.script("a", [failure(status)]);
            let executor = LineExecutor::new(client.clone(), policy(5));

            let result = executor.execute(line(0, "a"), &CancellationToken::new()).await;
            assert_eq!(result.attempts, 1, "status {status}");
            assert!(!result.is_success());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_failure_is_retried() {
        let client = Arc::new(ScriptedInference::new());
        client.script("a", [Err(BackendFailure::Connect("refused".to_string()).into())]);
        let executor = LineExecutor::new(client.clone(), policy(3));

        let result = executor.execute(line(0, "a"), &CancellationToken::new()).await;
        assert!(result.is_success());
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_returns_promptly() {
        let client = Arc::new(ScriptedInference::new());
        client.script("a", [failure(503), failure(503)]);
        let executor = LineExecutor::new(
            client.clone(),
            RetryPolicy {
                initial_backoff: Duration::from_secs(600),
                max_backoff: Duration::from_secs(600),
                ..policy(5)
            },
        );
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { executor.execute(line(0, "a"), &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        let started = tokio::time::Instant::now();
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(result.outcome, LineOutcome::Cancelled);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let client = Arc::new(ScriptedInference::new());
        let executor = LineExecutor::new(client.clone(), policy(3));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = executor.execute(line(0, "a"), &cancel).await;
        assert_eq!(result.outcome, LineOutcome::Cancelled);
        assert_eq!(result.attempts, 0);
        assert_eq!(client.calls("a"), 0);
    }
}
