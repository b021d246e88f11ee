//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Object storage configuration for blobs and serialized histories.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// Process-local storage. Contents are lost on exit.
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Filesystem { path } if path.as_os_str().is_empty() => {
                Err("filesystem storage requires a non-empty 'path'".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Relational chunk metadata backend (numeric project ids).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelationalConfig {
    /// SQLite database (development and tests).
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
    /// PostgreSQL database.
    Postgres {
        /// Primary connection URL.
        url: String,
        /// Optional read replica, used for read-only lookups.
        #[serde(default)]
        replica_url: Option<String>,
        /// Maximum connections in each pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(300000) // 5 minutes
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
        }
    }
}

/// Document-store chunk metadata backend (ObjectId project ids).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentConfig {
    /// MongoDB connection string. Transactions need a replica set.
    pub uri: String,
    /// Database name.
    #[serde(default = "default_document_database")]
    pub database: String,
}

fn default_document_database() -> String {
    "folio".to_string()
}

/// Chunk metadata configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Backend for numeric project ids.
    #[serde(default)]
    pub relational: RelationalConfig,
    /// Backend for ObjectId project ids. Projects of that shape are rejected
    /// when this is unset.
    #[serde(default)]
    pub document: Option<DocumentConfig>,
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match &self.relational {
            RelationalConfig::Postgres { url, .. } if url.is_empty() => {
                return Err("postgres config requires a non-empty 'url'".to_string());
            }
            RelationalConfig::Postgres {
                max_connections: 0, ..
            } => {
                return Err("postgres max_connections must be at least 1".to_string());
            }
            _ => {}
        }
        if let Some(document) = &self.document {
            if document.uri.is_empty() {
                return Err("document store config requires a non-empty 'uri'".to_string());
            }
            if document.database.is_empty() {
                return Err("document store config requires a non-empty 'database'".to_string());
            }
        }
        Ok(())
    }
}

/// Current-chunk cache configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheConfig {
    /// Redis, shared between processes.
    Redis {
        /// Connection URL.
        url: String,
        /// Entry lifetime in seconds.
        #[serde(default = "default_cache_ttl_secs")]
        ttl_secs: u64,
    },
    /// Process-local cache.
    Memory {
        /// Entry lifetime in seconds.
        #[serde(default = "default_cache_ttl_secs")]
        ttl_secs: u64,
    },
    /// No cache; every read goes to durable storage.
    #[default]
    Disabled,
}

fn default_cache_ttl_secs() -> u64 {
    300 // 5 minutes
}

impl CacheConfig {
    /// Validate cache configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            CacheConfig::Redis { url, .. } if url.is_empty() => {
                Err("redis cache requires a non-empty 'url'".to_string())
            }
            CacheConfig::Redis { ttl_secs: 0, .. } | CacheConfig::Memory { ttl_secs: 0 } => {
                Err("cache ttl_secs must be at least 1".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// History upload configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Concurrent object-storage requests per chunk upload or load.
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
}

fn default_upload_concurrency() -> usize {
    10
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            upload_concurrency: default_upload_concurrency(),
        }
    }
}

/// Garbage collection configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcConfig {
    /// Tombstones pulled (and object keys deleted) per batch.
    #[serde(default = "default_max_delete_keys")]
    pub max_delete_keys: usize,
    /// Minimum tombstone age in seconds before it is reclaimed.
    #[serde(default = "default_gc_min_age_secs")]
    pub min_age_secs: u64,
    /// Time limit for one sweep, in seconds.
    #[serde(default = "default_gc_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum batches per sweep (default: unlimited).
    #[serde(default)]
    pub max_batches: Option<u32>,
    /// Concurrent object-storage deletes within a batch.
    #[serde(default = "default_gc_delete_concurrency")]
    pub delete_concurrency: usize,
}

fn default_max_delete_keys() -> usize {
    1000
}

fn default_gc_min_age_secs() -> u64 {
    86400 // 1 day
}

fn default_gc_timeout_secs() -> u64 {
    3000 // 50 minutes
}

fn default_gc_delete_concurrency() -> usize {
    10
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            max_delete_keys: default_max_delete_keys(),
            min_age_secs: default_gc_min_age_secs(),
            timeout_secs: default_gc_timeout_secs(),
            max_batches: None,
            delete_concurrency: default_gc_delete_concurrency(),
        }
    }
}

impl GcConfig {
    /// Validate GC configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_delete_keys == 0 {
            return Err("gc.max_delete_keys must be at least 1".to_string());
        }
        if self.delete_concurrency == 0 {
            return Err("gc.delete_concurrency must be at least 1".to_string());
        }
        if self.min_age_secs > i64::MAX as u64 {
            return Err(format!(
                "gc.min_age_secs {} exceeds maximum value {}",
                self.min_age_secs,
                i64::MAX
            ));
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub gc: GcConfig,
}

impl AppConfig {
    /// Create a test configuration rooted in `dir`.
    ///
    /// **For testing only.** Uses filesystem storage, SQLite metadata and the
    /// in-memory cache.
    pub fn for_testing(dir: &std::path::Path) -> Self {
        Self {
            storage: StorageConfig::Filesystem {
                path: dir.join("storage"),
            },
            metadata: MetadataConfig {
                relational: RelationalConfig::Sqlite {
                    path: dir.join("metadata.db"),
                },
                document: None,
            },
            cache: CacheConfig::Memory {
                ttl_secs: default_cache_ttl_secs(),
            },
            history: HistoryConfig::default(),
            gc: GcConfig::default(),
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        self.metadata.validate()?;
        self.cache.validate()?;
        self.gc.validate()?;
        if self.history.upload_concurrency == 0 {
            return Err("history.upload_concurrency must be at least 1".to_string());
        }
        Ok(())
    }
}
