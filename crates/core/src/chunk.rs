//! Chunks: a history anchored at a start version.

use crate::history::{Change, History};
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Backend-assigned chunk identifier.
///
/// Decimal in the relational backend, an ObjectId hex string in the document
/// store. Callers treat it as opaque.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for ChunkId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

/// A contiguous range of project history.
///
/// The range is inclusive: a chunk starting at version `s` with `n` changes
/// covers `[s, s + n]`. An empty chunk covers just its start version.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    history: History,
    start_version: i64,
}

impl Chunk {
    pub fn new(history: History, start_version: i64) -> Self {
        Self {
            history,
            start_version,
        }
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut History {
        &mut self.history
    }

    pub fn into_history(self) -> History {
        self.history
    }

    pub fn start_version(&self) -> i64 {
        self.start_version
    }

    pub fn end_version(&self) -> i64 {
        self.start_version + self.history.count_changes()
    }

    /// Timestamp of the last change, if the chunk has any.
    pub fn end_timestamp(&self) -> Option<OffsetDateTime> {
        self.history.changes().last().map(Change::timestamp)
    }

    pub fn push_changes(&mut self, changes: impl IntoIterator<Item = Change>) {
        self.history.push_changes(changes);
    }

    /// Serialized form, used for divergence checks.
    pub fn to_raw(&self) -> crate::Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_raw(raw: serde_json::Value) -> crate::Result<Self> {
        let chunk: Chunk = serde_json::from_value(raw)?;
        if chunk.start_version < 0 {
            return Err(crate::Error::InvalidChunk(format!(
                "negative start version {}",
                chunk.start_version
            )));
        }
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{File, Operation, Snapshot};
    use time::macros::datetime;

    fn change(ts: OffsetDateTime) -> Change {
        Change::new(
            vec![Operation::AddFile {
                pathname: "a.tex".to_string(),
                file: File::from_string("a"),
            }],
            ts,
            vec![],
        )
    }

    #[test]
    fn test_empty_chunk_covers_start_only() {
        let chunk = Chunk::new(History::default(), 0);
        assert_eq!(chunk.start_version(), 0);
        assert_eq!(chunk.end_version(), 0);
        assert!(chunk.end_timestamp().is_none());
    }

    #[test]
    fn test_end_version_and_timestamp() {
        let mut chunk = Chunk::new(History::new(Snapshot::new(), vec![]), 1);
        chunk.push_changes([
            change(datetime!(2024-03-01 10:00 UTC)),
            change(datetime!(2024-03-01 11:00 UTC)),
            change(datetime!(2024-03-01 12:00 UTC)),
            change(datetime!(2024-03-01 13:00 UTC)),
        ]);
        assert_eq!(chunk.end_version(), 5);
        assert_eq!(chunk.end_timestamp(), Some(datetime!(2024-03-01 13:00 UTC)));
    }

    #[test]
    fn test_from_raw_rejects_negative_start() {
        let raw = serde_json::json!({
            "history": { "snapshot": { "files": {} }, "changes": [] },
            "startVersion": -1
        });
        assert!(matches!(
            Chunk::from_raw(raw),
            Err(crate::Error::InvalidChunk(_))
        ));
    }
}
