//! Core domain types for the Folio history chunk store.
//!
//! This crate defines the data model shared by every other crate:
//! - Project ids and their backend classification
//! - Histories, snapshots, changes and content-addressed files
//! - Chunks and chunk ids
//! - Configuration and Prometheus metrics

pub mod chunk;
pub mod config;
pub mod error;
pub mod hash;
pub mod history;
pub mod metrics;
pub mod project;

pub use chunk::{Chunk, ChunkId};
pub use error::{Error, Result};
pub use hash::ContentHash;
pub use history::{Change, File, History, Operation, Snapshot};
pub use project::{BackendKind, ProjectId};
