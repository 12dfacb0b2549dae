//! File system event types shared across the pipeline.
//!
//! `RawFileEvent` is what the watcher adapter hands us; `FileEvent` is the
//! normalized, process-attributed form that the store and analyzer consume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Kind of file system event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// File was created
    Created,
    /// File content was modified
    Modified,
    /// File was deleted
    Deleted,
    /// File was renamed or moved
    Moved,
    /// File was renamed in place with only the suffix changing
    ExtensionChanged,
}

impl EventKind {
    /// Whether this event changes file content worth measuring.
    pub fn is_content_change(self) -> bool {
        matches!(self, EventKind::Created | EventKind::Modified)
    }

    /// Stable string form used in the database and alert payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Modified => "modified",
            EventKind::Deleted => "deleted",
            EventKind::Moved => "moved",
            EventKind::ExtensionChanged => "extension_changed",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(EventKind::Created),
            "modified" => Ok(EventKind::Modified),
            "deleted" => Ok(EventKind::Deleted),
            "moved" => Ok(EventKind::Moved),
            "extension_changed" => Ok(EventKind::ExtensionChanged),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// Raw event as produced by the watcher adapter, before normalization.
///
/// Every field except `kind` and `path` is best-effort; the intake layer
/// fills the gaps (timestamps, process attribution) and drops events that
/// match the exclusion rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFileEvent {
    pub kind: EventKind,
    pub path: PathBuf,
    #[serde(default)]
    pub dest_path: Option<PathBuf>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub process_name: Option<String>,
    #[serde(default)]
    pub process_exe: Option<PathBuf>,
    #[serde(default)]
    pub size_before: Option<u64>,
    #[serde(default)]
    pub size_after: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Identity of a running process, as resolved by the attribution adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub name: String,
    pub exe: Option<PathBuf>,
}

/// Entropy measurement attached to a content-changing event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntropyReading {
    /// Baseline entropy before this change, if one was on record.
    pub before: Option<f64>,
    /// Entropy measured after the change.
    pub after: f64,
    /// `after - before`, or 0.0 when no baseline existed.
    pub delta: f64,
}

/// Normalized, attributed file system event. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEvent {
    /// Store rowid; 0 until persisted.
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    /// Absolute source path.
    pub path: PathBuf,
    /// Destination path, present for Moved and ExtensionChanged.
    pub dest_path: Option<PathBuf>,
    pub size_before: Option<u64>,
    pub size_after: Option<u64>,
    pub pid: u32,
    pub process_name: String,
    pub process_exe: Option<PathBuf>,
    pub entropy: Option<EntropyReading>,
}

impl FileEvent {
    /// Path whose content the event leaves behind (destination for renames).
    pub fn effective_path(&self) -> &Path {
        match self.kind {
            EventKind::Moved | EventKind::ExtensionChanged => {
                self.dest_path.as_deref().unwrap_or(&self.path)
            }
            _ => &self.path,
        }
    }

    /// Parent directory of the effective path.
    pub fn parent_dir(&self) -> Option<&Path> {
        self.effective_path().parent()
    }

    /// Lowercased suffix (with dot) of the effective path, if any.
    pub fn suffix(&self) -> Option<String> {
        self.effective_path()
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, path: &str, dest: Option<&str>) -> FileEvent {
        FileEvent {
            id: 0,
            timestamp: Utc::now(),
            kind,
            path: PathBuf::from(path),
            dest_path: dest.map(PathBuf::from),
            size_before: None,
            size_after: None,
            pid: 100,
            process_name: "test".to_string(),
            process_exe: None,
            entropy: None,
        }
    }

    #[test]
    fn test_effective_path_for_rename() {
        let ev = event(
            EventKind::Moved,
            "/home/u/doc.txt",
            Some("/home/u/doc.txt.locked"),
        );
        assert_eq!(ev.effective_path(), Path::new("/home/u/doc.txt.locked"));
        assert_eq!(ev.suffix().as_deref(), Some(".locked"));
    }

    #[test]
    fn test_effective_path_plain() {
        let ev = event(EventKind::Modified, "/home/u/doc.txt", None);
        assert_eq!(ev.effective_path(), Path::new("/home/u/doc.txt"));
        assert_eq!(ev.parent_dir(), Some(Path::new("/home/u")));
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            EventKind::Created,
            EventKind::Modified,
            EventKind::Deleted,
            EventKind::Moved,
            EventKind::ExtensionChanged,
        ] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("touched".parse::<EventKind>().is_err());
    }
}
