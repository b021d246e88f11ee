//! History domain model: snapshots, changes and the files they reference.
//!
//! Every type here serializes to its stored ("raw") JSON form. File content
//! is never part of that form; it lives in the blob store and is attached
//! after loading with [`History::load_files`].

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use time::OffsetDateTime;

/// A file in a snapshot or an `addFile` operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    hash: ContentHash,
    byte_length: u64,
    string_length: u64,
    #[serde(skip)]
    content: Option<String>,
}

impl File {
    /// Create a file holding its content until it is stored.
    pub fn from_string(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            hash: ContentHash::compute(content.as_bytes()),
            byte_length: content.len() as u64,
            string_length: content.chars().count() as u64,
            content: Some(content),
        }
    }

    /// Create a lazy file that only knows its hash.
    pub fn from_hash(hash: ContentHash, byte_length: u64, string_length: u64) -> Self {
        Self {
            hash,
            byte_length,
            string_length,
            content: None,
        }
    }

    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn byte_length(&self) -> u64 {
        self.byte_length
    }

    pub fn string_length(&self) -> u64 {
        self.string_length
    }

    /// File content, if loaded.
    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn is_loaded(&self) -> bool {
        self.content.is_some()
    }

    fn load(&mut self, blobs: &HashMap<ContentHash, String>) -> crate::Result<()> {
        if self.content.is_some() {
            return Ok(());
        }
        let content = blobs
            .get(&self.hash)
            .ok_or_else(|| crate::Error::MissingBlob(self.hash.to_hex()))?;
        self.content = Some(content.clone());
        Ok(())
    }
}

/// A single edit within a change.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Operation {
    AddFile {
        pathname: String,
        file: File,
    },
    /// Text edit in the editor's OT format, carried opaquely.
    EditFile {
        pathname: String,
        text_operation: Vec<serde_json::Value>,
    },
    /// Rename a file; an empty `new_pathname` removes it.
    MoveFile {
        pathname: String,
        new_pathname: String,
    },
}

impl Operation {
    fn file(&self) -> Option<&File> {
        match self {
            Operation::AddFile { file, .. } => Some(file),
            _ => None,
        }
    }

    fn file_mut(&mut self) -> Option<&mut File> {
        match self {
            Operation::AddFile { file, .. } => Some(file),
            _ => None,
        }
    }
}

/// One version transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Change {
    operations: Vec<Operation>,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    #[serde(default)]
    authors: Vec<i64>,
}

impl Change {
    /// Create a change. The timestamp is truncated to millisecond precision,
    /// which is what every backend stores.
    pub fn new(operations: Vec<Operation>, timestamp: OffsetDateTime, authors: Vec<i64>) -> Self {
        Self {
            operations,
            timestamp: truncate_to_millis(timestamp),
            authors,
        }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    pub fn authors(&self) -> &[i64] {
        &self.authors
    }
}

/// Full project state at a version.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    files: BTreeMap<String, File>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files(files: BTreeMap<String, File>) -> Self {
        Self { files }
    }

    pub fn files(&self) -> &BTreeMap<String, File> {
        &self.files
    }

    pub fn file(&self, pathname: &str) -> Option<&File> {
        self.files.get(pathname)
    }

    pub fn add_file(&mut self, pathname: impl Into<String>, file: File) {
        self.files.insert(pathname.into(), file);
    }
}

/// A snapshot plus the ordered changes applied on top of it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct History {
    snapshot: Snapshot,
    #[serde(default)]
    changes: Vec<Change>,
}

impl History {
    pub fn new(snapshot: Snapshot, changes: Vec<Change>) -> Self {
        Self { snapshot, changes }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn count_changes(&self) -> i64 {
        self.changes.len() as i64
    }

    pub fn push_changes(&mut self, changes: impl IntoIterator<Item = Change>) {
        self.changes.extend(changes);
    }

    fn files(&self) -> impl Iterator<Item = &File> {
        self.snapshot
            .files
            .values()
            .chain(self.changes.iter().flat_map(|c| c.operations.iter().filter_map(Operation::file)))
    }

    fn files_mut(&mut self) -> impl Iterator<Item = &mut File> {
        self.snapshot.files.values_mut().chain(
            self.changes
                .iter_mut()
                .flat_map(|c| c.operations.iter_mut().filter_map(Operation::file_mut)),
        )
    }

    /// Hashes of every blob this history references.
    pub fn find_blob_hashes(&self) -> BTreeSet<ContentHash> {
        self.files().map(File::hash).collect()
    }

    /// Attach content to every unloaded file.
    ///
    /// Fails with [`crate::Error::MissingBlob`] if a referenced hash is absent
    /// from `blobs`.
    pub fn load_files(&mut self, blobs: &HashMap<ContentHash, String>) -> crate::Result<()> {
        for file in self.files_mut() {
            file.load(blobs)?;
        }
        Ok(())
    }

    /// Distinct blobs carried in memory that must be written before this
    /// history is stored.
    pub fn blobs_to_store(&self) -> Vec<(ContentHash, &str)> {
        let mut seen = BTreeSet::new();
        self.files()
            .filter_map(|f| f.content().map(|c| (f.hash(), c)))
            .filter(|(hash, _)| seen.insert(*hash))
            .collect()
    }

    /// Serialized form stored in the history object store.
    pub fn to_raw(&self) -> crate::Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_raw(raw: serde_json::Value) -> crate::Result<Self> {
        Ok(serde_json::from_value(raw)?)
    }
}

/// Drop sub-millisecond precision from a timestamp.
pub fn truncate_to_millis(ts: OffsetDateTime) -> OffsetDateTime {
    let millis = ts.millisecond();
    ts.replace_millisecond(millis).unwrap_or(ts)
}
