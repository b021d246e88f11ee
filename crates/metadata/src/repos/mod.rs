//! Repository traits for chunk metadata.

pub mod chunks;
pub mod old_chunks;
pub mod projects;

pub use chunks::ChunkRepo;
pub use old_chunks::OldChunkRepo;
pub use projects::ProjectRecordRepo;
