//! Per-process sliding event window
//!
//! Each tracked process owns one `ProcessWindow`: the events it produced
//! within the last W seconds, ordered by timestamp. Pruning and the
//! duplicate-event filter both key off event timestamps rather than wall
//! clock, so replaying a recorded sequence yields identical analysis.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;

use crate::event::{EventKind, FileEvent};

/// Duplicate events for the same (kind, path) inside this span collapse
/// into the later one.
const DEDUP_MILLIS: i64 = 250;

/// Sliding aggregation of one process's recent file activity.
#[derive(Debug)]
pub struct ProcessWindow {
    pid: u32,
    process_name: String,
    process_exe: Option<PathBuf>,
    events: VecDeque<FileEvent>,
    /// Set when the window last became empty; used for garbage collection.
    emptied_at: Option<DateTime<Utc>>,
}

/// Serializable summary of a window, embedded in incident reports and the
/// dashboard snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct WindowSummary {
    pub pid: u32,
    pub process_name: String,
    pub event_count: usize,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub events_by_kind: BTreeMap<String, usize>,
    pub directories: Vec<PathBuf>,
}

impl ProcessWindow {
    pub fn new(pid: u32, process_name: String, process_exe: Option<PathBuf>) -> Self {
        Self {
            pid,
            process_name,
            process_exe,
            events: VecDeque::new(),
            emptied_at: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    pub fn process_exe(&self) -> Option<&PathBuf> {
        self.process_exe.as_ref()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        self.events.back().map(|e| e.timestamp)
    }

    /// How long the window has been empty as of `now`, if it is.
    pub fn empty_since(&self) -> Option<DateTime<Utc>> {
        if self.events.is_empty() {
            self.emptied_at
        } else {
            None
        }
    }

    /// Append an event, collapsing a duplicate (same kind, same effective
    /// path) observed within the dedup span - the later event wins.
    pub fn append(&mut self, event: FileEvent) {
        if let Some(exe) = &event.process_exe {
            if self.process_exe.is_none() {
                self.process_exe = Some(exe.clone());
            }
        }

        let cutoff = event.timestamp - Duration::milliseconds(DEDUP_MILLIS);
        let duplicate = self
            .events
            .iter()
            .rposition(|e| {
                e.timestamp >= cutoff
                    && e.kind == event.kind
                    && e.effective_path() == event.effective_path()
            });

        match duplicate {
            Some(idx) => {
                self.events[idx] = event;
            }
            None => self.events.push_back(event),
        }
        self.emptied_at = None;
    }

    /// Drop events older than `window` relative to `now`.
    pub fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - window;
        while let Some(front) = self.events.front() {
            if front.timestamp < cutoff {
                self.events.pop_front();
            } else {
                break;
            }
        }
        if self.events.is_empty() && self.emptied_at.is_none() {
            self.emptied_at = Some(now);
        }
    }

    /// Events currently in the window, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &FileEvent> {
        self.events.iter()
    }

    /// Distinct paths whose content this process changed inside the window
    /// (created, modified, or the destination of a rename).
    pub fn touched_paths(&self) -> Vec<PathBuf> {
        let mut seen = BTreeSet::new();
        for event in &self.events {
            match event.kind {
                EventKind::Created | EventKind::Modified => {
                    seen.insert(event.path.clone());
                }
                EventKind::Moved | EventKind::ExtensionChanged => {
                    if let Some(dest) = &event.dest_path {
                        seen.insert(dest.clone());
                    }
                }
                EventKind::Deleted => {}
            }
        }
        seen.into_iter().collect()
    }

    /// Build the serializable summary used by reports and the dashboard.
    pub fn summary(&self) -> WindowSummary {
        let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
        let mut dirs = BTreeSet::new();
        for event in &self.events {
            *by_kind.entry(event.kind.as_str().to_string()).or_default() += 1;
            if let Some(dir) = event.parent_dir() {
                dirs.insert(dir.to_path_buf());
            }
        }
        WindowSummary {
            pid: self.pid,
            process_name: self.process_name.clone(),
            event_count: self.events.len(),
            first_event_at: self.events.front().map(|e| e.timestamp),
            last_event_at: self.events.back().map(|e| e.timestamp),
            events_by_kind: by_kind,
            directories: dirs.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_at(ts: DateTime<Utc>, kind: EventKind, path: &str) -> FileEvent {
        FileEvent {
            id: 0,
            timestamp: ts,
            kind,
            path: PathBuf::from(path),
            dest_path: None,
            size_before: None,
            size_after: None,
            pid: 42,
            process_name: "proc".to_string(),
            process_exe: None,
            entropy: None,
        }
    }

    #[test]
    fn test_prune_drops_old_events() {
        let now = Utc::now();
        let mut win = ProcessWindow::new(42, "proc".into(), None);

        win.append(event_at(now - Duration::seconds(90), EventKind::Modified, "/a"));
        win.append(event_at(now - Duration::seconds(30), EventKind::Modified, "/b"));
        win.append(event_at(now, EventKind::Modified, "/c"));

        win.prune(now, Duration::seconds(60));
        assert_eq!(win.len(), 2);
        assert_eq!(win.events().next().unwrap().path, PathBuf::from("/b"));
    }

    #[test]
    fn test_dedup_keeps_later_event() {
        let now = Utc::now();
        let mut win = ProcessWindow::new(42, "proc".into(), None);

        let mut first = event_at(now, EventKind::Modified, "/a");
        first.size_after = Some(10);
        win.append(first);

        let mut second = event_at(now + Duration::milliseconds(100), EventKind::Modified, "/a");
        second.size_after = Some(99);
        win.append(second);

        assert_eq!(win.len(), 1);
        assert_eq!(win.events().next().unwrap().size_after, Some(99));
    }

    #[test]
    fn test_no_dedup_outside_span() {
        let now = Utc::now();
        let mut win = ProcessWindow::new(42, "proc".into(), None);

        win.append(event_at(now, EventKind::Modified, "/a"));
        win.append(event_at(now + Duration::milliseconds(400), EventKind::Modified, "/a"));

        assert_eq!(win.len(), 2);
    }

    #[test]
    fn test_no_dedup_across_kinds() {
        let now = Utc::now();
        let mut win = ProcessWindow::new(42, "proc".into(), None);

        win.append(event_at(now, EventKind::Created, "/a"));
        win.append(event_at(now + Duration::milliseconds(50), EventKind::Modified, "/a"));

        assert_eq!(win.len(), 2);
    }

    #[test]
    fn test_touched_paths_include_rename_destinations() {
        let now = Utc::now();
        let mut win = ProcessWindow::new(42, "proc".into(), None);

        win.append(event_at(now, EventKind::Modified, "/docs/a.txt"));
        let mut mv = event_at(now, EventKind::Moved, "/docs/b.txt");
        mv.dest_path = Some(PathBuf::from("/docs/b.txt.locked"));
        win.append(mv);
        win.append(event_at(now, EventKind::Deleted, "/docs/c.txt"));

        let touched = win.touched_paths();
        assert!(touched.contains(&PathBuf::from("/docs/a.txt")));
        assert!(touched.contains(&PathBuf::from("/docs/b.txt.locked")));
        assert!(!touched.contains(&PathBuf::from("/docs/c.txt")));
    }

    #[test]
    fn test_empty_since_set_by_prune() {
        let now = Utc::now();
        let mut win = ProcessWindow::new(42, "proc".into(), None);
        assert!(win.empty_since().is_none());

        win.append(event_at(now - Duration::seconds(120), EventKind::Modified, "/a"));
        win.prune(now, Duration::seconds(60));

        assert_eq!(win.empty_since(), Some(now));
    }

    #[test]
    fn test_summary_counts_kinds() {
        let now = Utc::now();
        let mut win = ProcessWindow::new(42, "proc".into(), None);
        win.append(event_at(now, EventKind::Modified, "/x/a"));
        win.append(event_at(now + Duration::seconds(1), EventKind::Modified, "/x/b"));
        win.append(event_at(now + Duration::seconds(2), EventKind::Deleted, "/y/c"));

        let summary = win.summary();
        assert_eq!(summary.event_count, 3);
        assert_eq!(summary.events_by_kind["modified"], 2);
        assert_eq!(summary.events_by_kind["deleted"], 1);
        assert_eq!(summary.directories.len(), 2);
    }
}
