pub mod breaker;
pub mod client;
pub mod retry;

pub use breaker::{CircuitBreaker, CircuitState};
pub use client::ResilientClient;
pub use retry::RetryPolicy;

use thiserror::Error;

/// Upstream failure taxonomy. Cloneable so every request coalesced onto one
/// in-flight fetch can observe the same failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Network error, timeout or 5xx. Retryable.
    #[error("transient upstream failure: {0}")]
    Transient(String),
    /// Well-formed error response (4xx, garbled payload). Not retryable.
    #[error("upstream rejected request: {0}")]
    Rejected(String),
    /// Circuit breaker is open; no network call was attempted.
    #[error("upstream unavailable (circuit open)")]
    Unavailable,
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}
