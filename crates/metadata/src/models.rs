//! Chunk metadata records shared by every backend.

use crate::error::{MetadataError, MetadataResult};
use folio_core::{Chunk, ChunkId, ProjectId};
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Chunk lifecycle state.
///
/// Transitions are one-way: `Pending -> Active -> Deleted`, or
/// `Pending -> Deleted` when garbage collection claims an abandoned upload.
/// Garbage collection only ever touches `Pending` and `Deleted`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    /// History is being uploaded; not visible to readers.
    Pending,
    /// Part of the project's current history.
    Active,
    /// Superseded or removed; awaiting physical deletion.
    Deleted,
}

impl ChunkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkState::Pending => "pending",
            ChunkState::Active => "active",
            ChunkState::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> MetadataResult<Self> {
        match s {
            "pending" => Ok(ChunkState::Pending),
            "active" => Ok(ChunkState::Active),
            "deleted" => Ok(ChunkState::Deleted),
            other => Err(MetadataError::Internal(format!("unknown chunk state {other:?}"))),
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: ChunkState) -> bool {
        matches!(
            (self, next),
            (ChunkState::Pending, ChunkState::Active)
                | (ChunkState::Pending, ChunkState::Deleted)
                | (ChunkState::Active, ChunkState::Deleted)
        )
    }

    /// Whether garbage collection may reclaim a chunk in this state.
    pub fn is_collectable(&self) -> bool {
        !matches!(self, ChunkState::Active)
    }
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Version range and end time of a chunk, without its id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkRange {
    pub start_version: i64,
    pub end_version: i64,
    pub end_timestamp: Option<OffsetDateTime>,
}

impl ChunkRange {
    pub fn of(chunk: &Chunk) -> Self {
        Self {
            start_version: chunk.start_version(),
            end_version: chunk.end_version(),
            end_timestamp: chunk.end_timestamp(),
        }
    }
}

/// Metadata of an active chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub start_version: i64,
    pub end_version: i64,
    pub end_timestamp: Option<OffsetDateTime>,
}

impl ChunkRecord {
    pub fn range(&self) -> ChunkRange {
        ChunkRange {
            start_version: self.start_version,
            end_version: self.end_version,
            end_timestamp: self.end_timestamp,
        }
    }
}

/// A chunk awaiting physical deletion: soft-deleted, or pending and
/// abandoned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OldChunk {
    pub project_id: ProjectId,
    pub chunk_id: ChunkId,
    pub state: ChunkState,
    pub start_version: i64,
    pub end_version: i64,
    /// Deletion time, or creation time for an abandoned pending chunk.
    pub deleted_at: OffsetDateTime,
}

/// Per-project high-water marks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProjectRecord {
    pub current_end_version: Option<i64>,
    pub current_end_timestamp: Option<OffsetDateTime>,
    /// Earliest change not yet backed up.
    pub pending_change_at: Option<OffsetDateTime>,
}

/// Extra bookkeeping supplied when confirming a chunk.
#[derive(Clone, Debug, Default)]
pub struct ConfirmOptions {
    /// The chunk covering `start_version - 1`, which must still be active
    /// and end exactly there.
    pub old_chunk_id: Option<ChunkId>,
    /// Timestamp of the earliest change in this write; merged into
    /// `pending_change_at`.
    pub earliest_change_timestamp: Option<OffsetDateTime>,
}

/// A replacement keeps the replaced chunk's start version and covers at
/// least its versions.
pub(crate) fn check_replacement(
    project_id: &ProjectId,
    old_chunk_id: &ChunkId,
    old_start_version: i64,
    old_end_version: i64,
    range: &ChunkRange,
) -> MetadataResult<()> {
    if old_start_version != range.start_version {
        return Err(MetadataError::conflict(
            project_id,
            format!(
                "chunk {old_chunk_id} starts at {old_start_version}, replacement starts at {}",
                range.start_version
            ),
        ));
    }
    if range.end_version < old_end_version {
        return Err(MetadataError::conflict(
            project_id,
            format!(
                "chunk {old_chunk_id} ends at {old_end_version}, replacement ends at {}",
                range.end_version
            ),
        ));
    }
    Ok(())
}

/// Relational chunk ids are sequence numbers. Anything else cannot exist in
/// a relational table.
pub(crate) fn numeric_chunk_id(chunk_id: &ChunkId) -> MetadataResult<i64> {
    chunk_id
        .as_str()
        .parse()
        .map_err(|_| MetadataError::NotFound(format!("chunk {chunk_id}")))
}

pub(crate) fn to_millis(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_millis(ms: i64) -> MetadataResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .map_err(|e| MetadataError::Internal(format!("timestamp {ms} out of range: {e}")))
}

/// Current time at the millisecond precision all backends store.
pub(crate) fn now_millis() -> OffsetDateTime {
    folio_core::history::truncate_to_millis(OffsetDateTime::now_utc())
}
