use super::FetchError;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_started: Option<Instant>,
}

/// Circuit breaker shared per upstream endpoint. State is process-local;
/// independent breakers per process only delay convergence on an outage.
///
/// The lock is held for state transitions only, never across I/O.
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_started: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Decide whether a call may go out right now. While Open, calls fail
    /// fast with `Unavailable` and the open timer is left untouched. Once
    /// the reset timeout has elapsed the breaker moves to HalfOpen and
    /// admits a single probe; further calls are rejected until the probe
    /// reports back. A probe whose caller vanished without reporting stops
    /// blocking after another reset timeout and a new probe is admitted.
    pub fn try_acquire(&self) -> Result<(), FetchError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let timed_out = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if timed_out {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_started = Some(Instant::now());
                    Ok(())
                } else {
                    Err(FetchError::Unavailable)
                }
            }
            CircuitState::HalfOpen => {
                let stale = inner
                    .probe_started
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if stale {
                    inner.probe_started = Some(Instant::now());
                    Ok(())
                } else {
                    Err(FetchError::Unavailable)
                }
            }
        }
    }

    /// Record a response from a reachable upstream. A well-formed error
    /// response counts here too: the service answered, so the failure streak
    /// is broken.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CircuitState::HalfOpen {
            tracing::info!("circuit breaker probe succeeded, closing circuit");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_started = None;
    }

    /// Record a transient failure (network error, timeout, 5xx).
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::HalfOpen => {
                tracing::warn!("circuit breaker probe failed, reopening circuit");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_started = None;
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker opening"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            // Failures reported by calls admitted before the circuit opened
            // must not re-arm the timer.
            CircuitState::Open => {}
        }
    }
}
