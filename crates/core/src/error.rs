//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid project id: {0}")]
    InvalidProjectId(String),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("missing blob content for hash {0}")]
    MissingBlob(String),

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
