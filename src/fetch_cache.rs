use crate::cache::CacheStore;
use crate::resilience::FetchError;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

type FetchResult = Result<Value, FetchError>;

/// Fetch-through cache: callers ask for a key and get either the cached
/// payload or the result of a single upstream fetch. Concurrent misses on
/// the same key coalesce onto one in-flight fetch; late arrivals observe
/// the leader's result, success or failure alike. The fetch itself runs on
/// a spawned task, so a caller that disconnects mid-flight cannot strand
/// the registry entry the others are waiting on.
///
/// A cache store failure is never surfaced: reads degrade to a miss and
/// writes are dropped with a warning, so the system stays correct (if
/// slower) with the store entirely unavailable.
pub struct FetchCache {
    store: Arc<dyn CacheStore>,
    in_flight: Arc<Mutex<HashMap<String, broadcast::Sender<FetchResult>>>>,
}

impl FetchCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn get_or_fetch<F, Fut>(&self, key: &str, ttl: Duration, fetch: F) -> FetchResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        match self.store.get(key).await {
            Ok(Some(payload)) => match serde_json::from_str(&payload) {
                Ok(value) => {
                    tracing::debug!(key, "cache hit");
                    return Ok(value);
                }
                Err(err) => {
                    tracing::warn!(key, error = %err, "corrupt cache payload, refetching");
                }
            },
            Ok(None) => tracing::debug!(key, "cache miss"),
            Err(err) => {
                tracing::warn!(key, error = %err, "cache store unavailable, bypassing");
            }
        }

        // Join an in-flight fetch for this key, or become its leader. The
        // registry lock is dropped before any I/O.
        let mut rx = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(key) {
                Some(tx) => tx.subscribe(),
                None => {
                    let (tx, rx) = broadcast::channel(1);
                    in_flight.insert(key.to_string(), tx);
                    self.spawn_fetch(key.to_string(), ttl, fetch());
                    rx
                }
            }
        };

        match rx.recv().await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Transient(
                "in-flight fetch abandoned".to_string(),
            )),
        }
    }

    /// Run the leader fetch detached from the request that started it. The
    /// task owns the cache write and the registry cleanup, so they happen
    /// even when every waiter has gone away.
    fn spawn_fetch<Fut>(&self, key: String, ttl: Duration, fut: Fut)
    where
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        let store = self.store.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            let result = fut.await;

            if let Ok(value) = &result {
                if let Err(err) = store.set(&key, value.to_string(), ttl).await {
                    tracing::warn!(key, error = %err, "cache write failed, serving uncached");
                }
            }

            // Deregister before broadcasting so a waiter that misses the send
            // window starts a fresh fetch instead of hanging.
            let tx = in_flight.lock().await.remove(&key);
            if let Some(tx) = tx {
                let _ = tx.send(result);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, MemoryCache};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fetch_cache() -> Arc<FetchCache> {
        Arc::new(FetchCache::new(Arc::new(MemoryCache::default())))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_trigger_exactly_one_fetch() {
        let cache = fetch_cache();
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("k", Duration::from_secs(60), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!({"aqi": 3}))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!({"aqi": 3}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesced_waiters_observe_the_leader_failure() {
        let cache = fetch_cache();
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("k", Duration::from_secs(60), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(FetchError::Transient("boom".to_string()))
                    })
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(result, Err(FetchError::Transient("boom".to_string())));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hit_skips_the_fetch() {
        let cache = fetch_cache();
        let calls = Arc::new(AtomicU32::new(0));

        let first = cache
            .get_or_fetch("k", Duration::from_secs(60), || async {
                Ok(json!({"aqi": 2}))
            })
            .await
            .unwrap();
        assert_eq!(first, json!({"aqi": 2}));

        let calls_in = calls.clone();
        let second = cache
            .get_or_fetch("k", Duration::from_secs(60), || async move {
                calls_in.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"aqi": 9}))
            })
            .await
            .unwrap();

        assert_eq!(second, json!({"aqi": 2}));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_not_cached() {
        let cache = fetch_cache();

        let first = cache
            .get_or_fetch("k", Duration::from_secs(60), || async {
                Err(FetchError::Transient("boom".to_string()))
            })
            .await;
        assert!(first.is_err());

        let second = cache
            .get_or_fetch("k", Duration::from_secs(60), || async {
                Ok(json!({"aqi": 4}))
            })
            .await
            .unwrap();
        assert_eq!(second, json!({"aqi": 4}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_refetches() {
        let cache = fetch_cache();

        cache
            .get_or_fetch("k", Duration::from_secs(60), || async {
                Ok(json!({"aqi": 1}))
            })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let refreshed = cache
            .get_or_fetch("k", Duration::from_secs(60), || async move {
                calls_in.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"aqi": 5}))
            })
            .await
            .unwrap();

        assert_eq!(refreshed, json!({"aqi": 5}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_leader_does_not_wedge_the_key() {
        let cache = fetch_cache();

        let leader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch("k", Duration::from_secs(60), || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!({"aqi": 3}))
                    })
                    .await
            })
        };
        // Let the leader register its fetch, then drop it mid-flight the way
        // a client disconnect drops a handler.
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        leader.abort();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            cache.get_or_fetch("k", Duration::from_secs(60), || async move {
                calls_in.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"aqi": 9}))
            }),
        )
        .await
        .expect("fetch must complete after the leader disconnects")
        .unwrap();

        // The detached fetch finished on the aborted leader's behalf
        assert_eq!(result, json!({"aqi": 3}));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unreachable("down".to_string()))
        }
        async fn set(&self, _: &str, _: String, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unreachable("down".to_string()))
        }
        async fn invalidate(&self, _: &str) -> Result<(), CacheError> {
            Err(CacheError::Unreachable("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_broken_store_degrades_to_fetch() {
        let cache = FetchCache::new(Arc::new(BrokenStore));

        let result = cache
            .get_or_fetch("k", Duration::from_secs(60), || async {
                Ok(json!({"aqi": 2}))
            })
            .await
            .unwrap();

        assert_eq!(result, json!({"aqi": 2}));
    }
}
