//! In-memory cache implementation backed by moka.

use crate::error::{ApiError, Result};
use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache as MokaCache;
use std::time::{Duration, Instant};

use super::Cache;

/// Default TTL for cache entries when none is specified (24 hours).
const DEFAULT_TTL: Duration = Duration::from_secs(86_400);

/// Cache entry that stores the value with an optional custom TTL.
#[derive(Clone)]
struct CacheEntry {
    value: Vec<u8>,
    custom_ttl: Option<Duration>,
}

/// Expiry implementation that supports per-entry TTL.
struct CacheExpiry {
    default_ttl: Duration,
}

impl Expiry<String, CacheEntry> for CacheExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.custom_ttl.unwrap_or(self.default_ttl))
    }

    fn expire_after_read(
        &self,
        _key: &String,
        _value: &CacheEntry,
        _read_at: Instant,
        duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        // TTL behavior, not TTI: reads don't extend the deadline.
        duration_until_expiry
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.custom_ttl.unwrap_or(self.default_ttl))
    }
}

/// In-memory cache suitable for high-concurrency workloads.
///
/// Uses moka's TinyLFU eviction combined with per-entry TTL expiration.
/// Prefix invalidation is backed by moka's invalidation closures, which the
/// builder enables up front.
#[derive(Clone)]
pub struct InMemoryCache {
    inner: MokaCache<String, CacheEntry>,
}

impl InMemoryCache {
    /// Create a new cache with the specified maximum number of entries.
    #[must_use]
    pub fn new(max_entries: u64) -> Self {
        Self::with_ttl(max_entries, DEFAULT_TTL)
    }

    /// Create a cache with a custom default TTL.
    #[must_use]
    pub fn with_ttl(max_entries: u64, default_ttl: Duration) -> Self {
        let expiry = CacheExpiry { default_ttl };
        let cache = MokaCache::builder()
            .max_capacity(max_entries)
            .expire_after(expiry)
            .support_invalidation_closures()
            .build();

        Self { inner: cache }
    }

    /// Run pending maintenance tasks (eviction, expiration).
    pub async fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks().await;
    }

    /// Current number of entries in the cache.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.get(key).await.map(|entry| entry.value))
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let entry = CacheEntry {
            value,
            custom_ttl: ttl,
        };
        self.inner.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.remove(key).await;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let prefix = prefix.to_string();
        self.inner
            .invalidate_entries_if(move |key, _| key.starts_with(&prefix))
            .map_err(|e| ApiError::internal(format!("Cache invalidation failed: {e}")))?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.inner.invalidate_all();
        self.inner.run_pending_tasks().await;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheExt;

    #[tokio::test]
    async fn get_set() {
        let cache = InMemoryCache::new(100);
        cache.set("key1", &"value1", None).await.unwrap();

        let value: Option<String> = cache.get("key1").await.unwrap();
        assert_eq!(value, Some("value1".to_string()));
    }

    #[tokio::test]
    async fn ttl_expiration() {
        let cache = InMemoryCache::with_ttl(100, Duration::from_millis(50));
        cache
            .set("key1", &"value1", Some(Duration::from_millis(10)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.run_pending_tasks().await;

        let value: Option<String> = cache.get("key1").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn delete() {
        let cache = InMemoryCache::new(100);
        cache.set("key1", &"value1", None).await.unwrap();
        cache.delete("key1").await.unwrap();

        let value: Option<String> = cache.get("key1").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn delete_prefix_drops_family_only() {
        let cache = InMemoryCache::new(100);
        cache
            .set("affiliate:stats:u1:all", &1u32, None)
            .await
            .unwrap();
        cache
            .set("affiliate:stats:u1:month", &2u32, None)
            .await
            .unwrap();
        cache
            .set("affiliate:stats:u2:all", &3u32, None)
            .await
            .unwrap();

        cache.delete_prefix("affiliate:stats:u1:").await.unwrap();
        cache.run_pending_tasks().await;

        assert_eq!(
            cache.get::<u32>("affiliate:stats:u1:all").await.unwrap(),
            None
        );
        assert_eq!(
            cache.get::<u32>("affiliate:stats:u1:month").await.unwrap(),
            None
        );
        assert_eq!(
            cache.get::<u32>("affiliate:stats:u2:all").await.unwrap(),
            Some(3)
        );
    }

    #[tokio::test]
    async fn clear() {
        let cache = InMemoryCache::new(100);
        cache.set("key1", &"value1", None).await.unwrap();
        cache.set("key2", &"value2", None).await.unwrap();
        cache.clear().await.unwrap();

        assert_eq!(cache.get::<String>("key1").await.unwrap(), None);
        assert_eq!(cache.get::<String>("key2").await.unwrap(), None);
    }
}
