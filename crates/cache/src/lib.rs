//! Current-chunk cache for Folio.
//!
//! This crate provides:
//! - The [`CacheBackend`] trait with Redis and in-memory backends
//! - [`ChunkCache`], which turns every backend failure into a miss and
//!   validates cached chunks against durable version ranges

pub mod backends;
pub mod cache;
pub mod error;
pub mod traits;

pub use backends::{memory::MemoryCacheBackend, redis::RedisCacheBackend};
pub use cache::{CachedChanges, ChunkCache, DEFAULT_TTL};
pub use error::{CacheError, CacheResult};
pub use traits::{CacheBackend, CacheMetadata, RawCacheEntry};

use folio_core::config::CacheConfig;
use std::sync::Arc;
use std::time::Duration;

/// Create a chunk cache from configuration; `None` when disabled.
pub async fn from_config(config: &CacheConfig) -> CacheResult<Option<ChunkCache>> {
    config.validate().map_err(CacheError::Config)?;

    match config {
        CacheConfig::Redis { url, ttl_secs } => {
            let backend = RedisCacheBackend::connect(url).await?;
            tracing::info!(ttl_secs = ttl_secs, "Using Redis chunk cache");
            Ok(Some(ChunkCache::new(
                Arc::new(backend),
                Duration::from_secs(*ttl_secs),
            )))
        }
        CacheConfig::Memory { ttl_secs } => {
            tracing::info!(ttl_secs = ttl_secs, "Using in-memory chunk cache");
            Ok(Some(ChunkCache::new(
                Arc::new(MemoryCacheBackend::new()),
                Duration::from_secs(*ttl_secs),
            )))
        }
        CacheConfig::Disabled => {
            tracing::info!("Chunk cache disabled");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn from_config_memory_and_disabled() {
        let cache = from_config(&CacheConfig::Memory { ttl_secs: 30 }).await.unwrap();
        assert_eq!(cache.unwrap().backend_name(), "memory");
        assert!(from_config(&CacheConfig::Disabled).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn from_config_rejects_zero_ttl() {
        assert!(matches!(
            from_config(&CacheConfig::Memory { ttl_secs: 0 }).await,
            Err(CacheError::Config(_))
        ));
    }
}
