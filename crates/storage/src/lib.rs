//! Object storage abstraction and stores for Folio.
//!
//! This crate provides:
//! - The [`ObjectStore`] trait with filesystem and in-memory backends
//! - A content-addressed [`BlobStore`] with a batching reader
//! - The [`HistoryStore`] holding serialized chunk histories

pub mod backends;
pub mod blob;
pub mod error;
pub mod history;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, memory::MemoryBackend};
pub use blob::{BatchBlobStore, BlobStore};
pub use error::{StorageError, StorageResult};
pub use history::HistoryStore;
pub use traits::ObjectStore;

use folio_core::config::StorageConfig;
use std::sync::Arc;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            tracing::info!(path = %path.display(), "Using filesystem object storage");
            Ok(Arc::new(backend))
        }
        StorageConfig::Memory => {
            tracing::warn!("Using in-memory object storage; data is lost on exit");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[tokio::test]
    async fn from_config_filesystem_ok() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            path: temp.path().join("store"),
        };

        let store = from_config(&config).await.unwrap();
        store
            .put("hello.txt", Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert!(store.exists("hello.txt").await.unwrap());
        assert_eq!(store.backend_name(), "filesystem");
    }

    #[tokio::test]
    async fn from_config_memory_ok() {
        let store = from_config(&StorageConfig::Memory).await.unwrap();
        assert_eq!(store.backend_name(), "memory");
        store.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn from_config_rejects_empty_path() {
        let config = StorageConfig::Filesystem {
            path: PathBuf::new(),
        };
        match from_config(&config).await {
            Ok(_) => panic!("expected error"),
            Err(StorageError::Config(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
