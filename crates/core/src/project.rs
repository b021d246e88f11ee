//! Project identifiers and backend classification.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which metadata backend owns a project.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Numeric project ids, stored in PostgreSQL or SQLite.
    Relational,
    /// 24-character hex project ids, stored in MongoDB.
    Document,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Relational => "relational",
            BackendKind::Document => "document",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated project identifier.
///
/// The shape of the id decides where the project's chunks live; see
/// [`ProjectId::backend_kind`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId {
    value: String,
    kind: BackendKind,
}

impl ProjectId {
    /// Parse and classify a project id.
    ///
    /// A positive decimal integer that fits in an `i64` is relational. A
    /// 24-character lowercase hex string is a document-store id. The numeric
    /// check runs first.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let kind = classify(s).ok_or_else(|| {
            crate::Error::InvalidProjectId(format!("{s:?} is neither numeric nor an ObjectId"))
        })?;
        Ok(Self {
            value: s.to_string(),
            kind,
        })
    }

    /// Build a relational project id from a sequence value.
    pub fn from_sequence(id: i64) -> crate::Result<Self> {
        if id <= 0 {
            return Err(crate::Error::InvalidProjectId(format!(
                "sequence value {id} is not positive"
            )));
        }
        Ok(Self {
            value: id.to_string(),
            kind: BackendKind::Relational,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    /// The numeric value of a relational id.
    pub fn as_i64(&self) -> crate::Result<i64> {
        match self.kind {
            BackendKind::Relational => self
                .value
                .parse()
                .map_err(|e| crate::Error::InvalidProjectId(format!("{}: {e}", self.value))),
            BackendKind::Document => Err(crate::Error::InvalidProjectId(format!(
                "{} is not a relational project id",
                self.value
            ))),
        }
    }
}

fn classify(s: &str) -> Option<BackendKind> {
    if !s.is_empty()
        && s.bytes().all(|b| b.is_ascii_digit())
        && matches!(s.parse::<i64>(), Ok(n) if n > 0)
    {
        return Some(BackendKind::Relational);
    }
    if s.len() == 24 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Some(BackendKind::Document);
    }
    None
}

impl TryFrom<String> for ProjectId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<ProjectId> for String {
    fn from(id: ProjectId) -> Self {
        id.value
    }
}

impl std::str::FromStr for ProjectId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Debug for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProjectId({}, {})", self.value, self.kind)
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_is_relational() {
        let id = ProjectId::parse("12345").unwrap();
        assert_eq!(id.backend_kind(), BackendKind::Relational);
        assert_eq!(id.as_i64().unwrap(), 12345);
    }

    #[test]
    fn test_object_id_is_document() {
        let id = ProjectId::parse("5f1a2b3c4d5e6f7a8b9c0d1e").unwrap();
        assert_eq!(id.backend_kind(), BackendKind::Document);
        assert!(id.as_i64().is_err());
    }

    #[test]
    fn test_all_digit_object_id_checked_numeric_first() {
        // Fits in i64, so the numeric rule wins even though it is also valid hex.
        let short = ProjectId::parse("123456789012345678").unwrap();
        assert_eq!(short.backend_kind(), BackendKind::Relational);

        // 24 digits overflow i64 and fall through to the ObjectId rule.
        let long = ProjectId::parse("123456789012345678901234").unwrap();
        assert_eq!(long.backend_kind(), BackendKind::Document);
    }

    #[test]
    fn test_invalid_shapes_rejected() {
        for bad in [
            "",
            "0",
            "-4",
            "12a",
            "5F1A2B3C4D5E6F7A8B9C0D1E",
            "5f1a2b3c4d5e6f7a8b9c0d1",
            "project",
        ] {
            assert!(
                matches!(ProjectId::parse(bad), Err(crate::Error::InvalidProjectId(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_from_sequence() {
        assert_eq!(ProjectId::from_sequence(7).unwrap().as_str(), "7");
        assert!(ProjectId::from_sequence(0).is_err());
    }
}
