use super::{CircuitBreaker, FetchError, RetryPolicy};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Wraps a single upstream operation with a per-call timeout, retry with
/// exponential backoff and jitter, and a shared circuit breaker.
pub struct ResilientClient {
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    call_timeout: Duration,
}

impl ResilientClient {
    pub fn new(retry: RetryPolicy, breaker: CircuitBreaker, call_timeout: Duration) -> Self {
        Self {
            retry,
            breaker,
            call_timeout,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Invoke `op`, retrying transient failures up to the policy's attempt
    /// budget. A breaker that is (or becomes) open short-circuits without
    /// consuming a retry attempt. Rejected responses return immediately.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, FetchError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut last_error = FetchError::Transient("no attempt made".to_string());

        for attempt in 1..=self.retry.max_attempts() {
            if let Some(delay) = self.retry.jittered_delay(attempt) {
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying upstream call after backoff"
                );
                sleep(delay).await;
            }

            self.breaker.try_acquire()?;

            let outcome = match timeout(self.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Transient(format!(
                    "upstream call timed out after {:?}",
                    self.call_timeout
                ))),
            };

            match outcome {
                Ok(value) => {
                    self.breaker.on_success();
                    return Ok(value);
                }
                Err(err @ FetchError::Rejected(_)) => {
                    // Upstream answered; the breaker sees a live service.
                    self.breaker.on_success();
                    return Err(err);
                }
                Err(FetchError::Unavailable) => return Err(FetchError::Unavailable),
                Err(err) => {
                    self.breaker.on_failure();
                    tracing::warn!(attempt, error = %err, "transient upstream failure");
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }
}
