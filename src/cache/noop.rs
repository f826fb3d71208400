//! No-op cache for deployments that run without a cache layer.

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

use super::Cache;

/// Cache implementation that stores nothing.
///
/// Every read misses and every write succeeds. Useful for tests asserting
/// cache-independent behavior and for wiring services before a real cache
/// is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

impl NoopCache {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Cache for NoopCache {
    async fn get_bytes(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn set_bytes(&self, _key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_prefix(&self, _prefix: &str) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
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
    async fn always_misses() {
        let cache = NoopCache::new();
        cache.set("key", &"value", None).await.unwrap();
        assert_eq!(cache.get::<String>("key").await.unwrap(), None);
    }
}
