//! Filesystem entry types.

use std::path::{Path, PathBuf};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// A directory entry produced by traversal or supplied by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Absolute path of the entry.
    pub full_path: PathBuf,
    /// Final path component.
    pub file_name: CompactString,
    /// Whether the entry is a directory.
    pub is_directory: bool,
}

impl FileEntry {
    /// Create an entry, deriving the name from the path.
    pub fn new(full_path: impl Into<PathBuf>, is_directory: bool) -> Self {
        let full_path = full_path.into();
        let file_name = file_name_of(&full_path);
        Self {
            full_path,
            file_name,
            is_directory,
        }
    }

    /// Create a file entry.
    pub fn file(full_path: impl Into<PathBuf>) -> Self {
        Self::new(full_path, false)
    }

    /// Create a directory entry.
    pub fn directory(full_path: impl Into<PathBuf>) -> Self {
        Self::new(full_path, true)
    }

    /// Lowercased extension without the dot, if any.
    pub fn extension(&self) -> Option<String> {
        self.full_path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    }
}

/// Final component of a path as a compact string.
pub fn file_name_of(path: &Path) -> CompactString {
    path.file_name()
        .map(|n| CompactString::from(n.to_string_lossy()))
        .unwrap_or_else(|| CompactString::from(path.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_name_from_path() {
        let entry = FileEntry::file("/data/photos/IMG_001.JPG");
        assert_eq!(entry.file_name, "IMG_001.JPG");
        assert_eq!(entry.extension().as_deref(), Some("jpg"));
        assert!(!entry.is_directory);

        let dir = FileEntry::directory("/data/photos");
        assert_eq!(dir.file_name, "photos");
        assert!(dir.extension().is_none());
    }

    #[test]
    fn test_entry_serializes_camel_case() {
        let json = serde_json::to_value(FileEntry::file("/a/b.txt")).unwrap();
        assert_eq!(json["fileName"], "b.txt");
        assert_eq!(json["isDirectory"], false);
        assert!(json.get("fullPath").is_some());
    }
}
