//! Cache error types.
//!
//! These never reach callers of [`crate::ChunkCache`]; every failure is
//! downgraded to a miss there.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid chunk: {0}")]
    Core(#[from] folio_core::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;
