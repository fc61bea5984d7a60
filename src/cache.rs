use async_trait::async_trait;
use moka::future::Cache;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache store unreachable: {0}")]
    Unreachable(String),
}

/// Key/value store with per-entry TTL. Implementations may be in-process or
/// networked; callers treat any error as a miss and never depend on
/// read-modify-write atomicity.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
    async fn invalidate(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Clone)]
struct Entry {
    payload: String,
    expires_at: Instant,
}

/// In-process store backed by moka. Expiry is enforced at read time against
/// the entry's own deadline; moka's capacity bound only handles physical
/// eviction, so a read after the TTL is a miss even if the entry is still
/// resident.
pub struct MemoryCache {
    entries: Cache<String, Entry>,
}

impl MemoryCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            entries: Cache::builder().max_capacity(max_capacity).build(),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self.entries.get(key).await {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.payload)),
            Some(_) => {
                self.entries.invalidate(key).await;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let entry = Entry {
            payload: value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.entries.invalidate(key).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = MemoryCache::default();
        cache
            .set("k", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_overwrites_unconditionally() {
        let cache = MemoryCache::default();
        cache
            .set("k", "old".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .set("k", "new".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("new".to_string()));
    }

    #[tokio::test]
    async fn test_invalidate_removes_entry() {
        let cache = MemoryCache::default();
        cache
            .set("k", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        cache.invalidate("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
