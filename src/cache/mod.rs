//! Cache layer for memoized read aggregates.
//!
//! Services cache expensive aggregates (affiliate stats, analytics ranges)
//! and invalidate them wholesale on writes. Cached values are never patched
//! in place.

mod in_memory;
mod noop;

pub use in_memory::InMemoryCache;
pub use noop::NoopCache;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Common TTL tiers for cached aggregates.
pub mod ttl {
    use std::time::Duration;

    /// 5 minutes.
    pub const SHORT: Duration = Duration::from_secs(300);
    /// 30 minutes.
    pub const MEDIUM: Duration = Duration::from_secs(1800);
    /// 24 hours.
    pub const LONG: Duration = Duration::from_secs(86_400);
}

/// Cache trait for key-value storage with optional TTL.
///
/// This trait uses type-erased serialization to be object-safe. Use the
/// [`CacheExt`] helpers `get` and `set` which handle serialization.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Get a value from the cache as JSON bytes.
    ///
    /// Returns `Ok(None)` if the key doesn't exist or has expired.
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a value in the cache with optional TTL.
    ///
    /// If `ttl` is `None` the backend's default TTL applies.
    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Delete a single key.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Invalidate every key starting with `prefix`.
    ///
    /// Write paths use this to drop whole families of memoized aggregates
    /// (e.g. `affiliate:stats:<user>:`) in one call.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// Clear all values from the cache.
    async fn clear(&self) -> Result<()>;

    /// Check if the cache backend is healthy.
    fn is_healthy(&self) -> bool;
}

/// Helper trait for type-safe cache operations.
///
/// Implementations use the object-safe `get_bytes`/`set_bytes` internally.
pub trait CacheExt: Cache {
    /// Get a value from the cache.
    async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        if let Some(bytes) = self.get_bytes(key).await? {
            serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| crate::error::ApiError::internal(format!("Failed to deserialize: {e}")))
        } else {
            Ok(None)
        }
    }

    /// Set a value in the cache.
    async fn set<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()>
    where
        T: serde::Serialize + Send + Sync,
    {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| crate::error::ApiError::internal(format!("Failed to serialize: {e}")))?;
        self.set_bytes(key, bytes, ttl).await
    }
}

// Blanket implementation - all Cache implementations get CacheExt for free.
impl<T: Cache> CacheExt for T {}
