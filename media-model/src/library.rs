use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::error::{ModelError, Result};
use crate::ids::LibraryId;

/// The kind of content a library holds. Determines which file extensions
/// the walker considers and which enrichers apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum LibraryKind {
    Music,
    Movie,
    Episode,
    Mixed,
}

impl std::fmt::Display for LibraryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LibraryKind::Music => "music",
            LibraryKind::Movie => "movie",
            LibraryKind::Episode => "episode",
            LibraryKind::Mixed => "mixed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MediaLibrary {
    pub id: LibraryId,
    pub root_path: PathBuf,
    pub kind: LibraryKind,
    pub created_at: DateTime<Utc>,
}

impl MediaLibrary {
    /// Construct a new library, validating that `root_path` exists on disk.
    pub fn new(root_path: PathBuf, kind: LibraryKind) -> Result<Self> {
        if !root_path.exists() {
            return Err(ModelError::InvalidArgument(format!(
                "library root {} does not exist",
                root_path.display()
            )));
        }
        Ok(Self {
            id: LibraryId::new(),
            root_path,
            kind,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_root() {
        let err = MediaLibrary::new(PathBuf::from("/does/not/exist/anywhere"), LibraryKind::Movie)
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidArgument(_)));
    }

    #[test]
    fn accepts_existing_root() {
        let dir = tempfile::tempdir().unwrap();
        let lib = MediaLibrary::new(dir.path().to_path_buf(), LibraryKind::Mixed).unwrap();
        assert_eq!(lib.kind, LibraryKind::Mixed);
    }
}
