use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum CounterError {
    #[error("counter store unreachable: {0}")]
    Unreachable(String),
}

/// Shared counter store behind the fixed-window limiter. The in-process
/// implementation below is per-instance; a deployment serving from several
/// processes swaps in a networked implementation of this trait so all
/// instances see the same counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `key` within the window starting at
    /// `window_start` and return the new count. A stored counter from an
    /// older window is lazily reset on first access.
    async fn incr(&self, key: &str, window_start: DateTime<Utc>) -> Result<u64, CounterError>;
}

#[derive(Default)]
pub struct MemoryCounterStore {
    windows: RwLock<HashMap<String, (DateTime<Utc>, u64)>>,
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, key: &str, window_start: DateTime<Utc>) -> Result<u64, CounterError> {
        let mut windows = self.windows.write().await;
        let entry = windows.entry(key.to_string()).or_insert((window_start, 0));
        if entry.0 != window_start {
            *entry = (window_start, 0);
        }
        entry.1 += 1;
        Ok(entry.1)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WindowLimit {
    pub limit: u64,
    pub window_secs: i64,
}

impl WindowLimit {
    pub fn per_minute(limit: u64) -> Self {
        Self {
            limit,
            window_secs: 60,
        }
    }

    pub fn per_hour(limit: u64) -> Self {
        Self {
            limit,
            window_secs: 3600,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    /// Permits left in the tightest window, for X-RateLimit-Remaining.
    pub remaining: u64,
    /// When the tightest window rolls over, for X-RateLimit-Reset.
    pub reset_at: DateTime<Utc>,
}

/// Fixed-window rate limiter. A request must pass every configured window;
/// windows are clock-aligned and reset lazily on first access after the
/// boundary. A store failure fails open: rejecting traffic because the
/// counter store is down would turn a cache outage into a full outage.
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    limits: Vec<WindowLimit>,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>, limits: Vec<WindowLimit>) -> Self {
        Self { store, limits }
    }

    pub async fn check(&self, identity: &str) -> RateDecision {
        self.check_at(identity, Utc::now()).await
    }

    async fn check_at(&self, identity: &str, now: DateTime<Utc>) -> RateDecision {
        let mut allowed = true;
        let mut remaining = u64::MAX;
        let mut reset_at = now;

        for limit in &self.limits {
            let window_start = align_to_window(now, limit.window_secs);
            let key = format!("{}:{}s", identity, limit.window_secs);

            let count = match self.store.incr(&key, window_start).await {
                Ok(count) => count,
                Err(err) => {
                    tracing::warn!(error = %err, "counter store unavailable, failing open");
                    continue;
                }
            };

            if count > limit.limit {
                allowed = false;
            }
            let left = limit.limit.saturating_sub(count);
            if left < remaining {
                remaining = left;
                reset_at = window_start + Duration::seconds(limit.window_secs);
            }
        }

        if remaining == u64::MAX {
            remaining = 0;
        }
        RateDecision {
            allowed,
            remaining,
            reset_at,
        }
    }
}

fn align_to_window(now: DateTime<Utc>, window_secs: i64) -> DateTime<Utc> {
    let aligned = now.timestamp() - now.timestamp().rem_euclid(window_secs);
    Utc.timestamp_opt(aligned, 0).single().unwrap_or(now)
}
