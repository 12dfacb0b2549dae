//! Event intake and normalization
//!
//! Sits between the watcher adapter and the rest of the pipeline. Raw
//! events get canonical paths, a process identity (PID 0 / "unknown" when
//! attribution fails), Moved-vs-ExtensionChanged classification, a burst
//! debouncer, and an entropy reading for content-changing events. Excluded
//! paths are dropped silently.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::config::Config;
use crate::entropy::EntropyEngine;
use crate::event::{EntropyReading, EventKind, FileEvent, ProcessIdentity, RawFileEvent};
use crate::response::process;

/// Modified events for the same (PID, path) inside this span collapse.
const DEBOUNCE_MILLIS: i64 = 100;

/// Adapter seam: maps a PID to its identity. The default implementation
/// reads /proc; tests substitute a table.
pub trait ProcessResolver: Send + Sync {
    fn resolve(&self, pid: u32) -> Option<ProcessIdentity>;
}

/// /proc-backed resolver.
#[derive(Default)]
pub struct ProcResolver;

impl ProcessResolver for ProcResolver {
    fn resolve(&self, pid: u32) -> Option<ProcessIdentity> {
        process::identity(pid)
    }
}

/// Normalizes and enriches raw watcher events.
pub struct EventIntake {
    config: Config,
    entropy: Arc<EntropyEngine>,
    resolver: Box<dyn ProcessResolver>,
    recent_modified: HashMap<(u32, PathBuf), DateTime<Utc>>,
    debounced: u64,
}

impl EventIntake {
    pub fn new(config: &Config, entropy: Arc<EntropyEngine>) -> Self {
        Self::with_resolver(config, entropy, Box::new(ProcResolver))
    }

    pub fn with_resolver(
        config: &Config,
        entropy: Arc<EntropyEngine>,
        resolver: Box<dyn ProcessResolver>,
    ) -> Self {
        Self {
            config: config.clone(),
            entropy,
            resolver,
            recent_modified: HashMap::new(),
            debounced: 0,
        }
    }

    /// Modified events suppressed by the burst debouncer.
    pub fn debounced(&self) -> u64 {
        self.debounced
    }

    /// Normalize one raw event. `None` means the event was excluded,
    /// filtered, or debounced away.
    pub fn process(&mut self, raw: RawFileEvent) -> Option<FileEvent> {
        let timestamp = raw.timestamp.unwrap_or_else(Utc::now);
        let path = canonicalize_lossy(&raw.path);
        let dest_path = raw.dest_path.as_deref().map(canonicalize_lossy);

        if self.config.is_excluded(&path)
            && dest_path.as_deref().map_or(true, |d| self.config.is_excluded(d))
        {
            trace!(path = %path.display(), "event excluded");
            return None;
        }

        let filter_target = dest_path.as_deref().unwrap_or(&path);
        if !self.config.passes_extension_filter(filter_target) {
            return None;
        }

        let kind = classify(raw.kind, &path, dest_path.as_deref());

        let identity = self.attribute(&raw);

        // Burst debounce: repeated writes to one file inside the span
        // collapse into the first observation.
        if kind == EventKind::Modified {
            let key = (identity.pid, path.clone());
            if let Some(last) = self.recent_modified.get(&key) {
                if timestamp - *last < Duration::milliseconds(DEBOUNCE_MILLIS) {
                    self.debounced += 1;
                    return None;
                }
            }
            self.recent_modified.insert(key, timestamp);
        }

        let mut event = FileEvent {
            id: 0,
            timestamp,
            kind,
            path,
            dest_path,
            size_before: raw.size_before,
            size_after: raw.size_after,
            pid: identity.pid,
            process_name: identity.name,
            process_exe: identity.exe,
            entropy: None,
        };

        if event.size_after.is_none() && kind.is_content_change() {
            event.size_after = std::fs::metadata(event.effective_path())
                .ok()
                .map(|m| m.len());
        }

        self.enrich_entropy(&mut event);
        Some(event)
    }

    /// Resolve who did it, falling back to PID 0 / "unknown".
    fn attribute(&self, raw: &RawFileEvent) -> ProcessIdentity {
        if let Some(pid) = raw.pid {
            if let (Some(name), exe) = (raw.process_name.clone(), raw.process_exe.clone()) {
                return ProcessIdentity {
                    pid,
                    name,
                    exe,
                };
            }
            if let Some(identity) = self.resolver.resolve(pid) {
                return identity;
            }
            return ProcessIdentity {
                pid,
                name: raw.process_name.clone().unwrap_or_else(|| "unknown".to_string()),
                exe: raw.process_exe.clone(),
            };
        }
        ProcessIdentity {
            pid: 0,
            name: "unknown".to_string(),
            exe: None,
        }
    }

    /// Attach entropy for content-changing events and keep the baseline
    /// store current across creates, deletes, and renames. Measurement
    /// failures are expected mid-burst and simply leave the field empty.
    fn enrich_entropy(&self, event: &mut FileEvent) {
        match event.kind {
            EventKind::Created | EventKind::Modified => {
                let path = event.effective_path().to_path_buf();
                let after = match self.entropy.measure(&path) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!(path = %path.display(), "no entropy measurement: {e}");
                        return;
                    }
                };
                let before = self
                    .entropy
                    .baseline(&path)
                    .ok()
                    .flatten()
                    .map(|b| b.entropy);
                let delta = before.map(|b| after - b).unwrap_or(0.0);
                event.entropy = Some(EntropyReading {
                    before,
                    after,
                    delta,
                });
                if let Err(e) = self.entropy.update_baseline(&path, after, event.timestamp) {
                    debug!("baseline update failed: {e}");
                }
            }
            EventKind::Deleted => {
                if let Err(e) = self.entropy.mark_deleted(&event.path, event.timestamp) {
                    debug!("baseline deletion mark failed: {e}");
                }
            }
            EventKind::Moved | EventKind::ExtensionChanged => {
                // Carry the baseline across the rename
                if let Some(dest) = event.dest_path.clone() {
                    if let Ok(Some(b)) = self.entropy.baseline(&event.path) {
                        let _ = self.entropy.update_baseline(&dest, b.entropy, event.timestamp);
                    }
                    let _ = self.entropy.forget(&event.path);
                }
            }
        }
    }
}

/// Reclassify a rename that only swaps the suffix: same directory, same
/// stem, different extension.
fn classify(kind: EventKind, path: &Path, dest: Option<&Path>) -> EventKind {
    if kind != EventKind::Moved {
        return kind;
    }
    let Some(dest) = dest else {
        return kind;
    };
    let same_parent = path.parent() == dest.parent();
    let same_stem = path.file_stem().is_some() && path.file_stem() == dest.file_stem();
    let differing_ext = path.extension() != dest.extension();
    if same_parent && same_stem && differing_ext {
        EventKind::ExtensionChanged
    } else {
        EventKind::Moved
    }
}

/// Resolve symlinks and strip trailing slashes; falls back to lexical
/// cleanup for paths that no longer exist (deletes, rename sources).
fn canonicalize_lossy(path: &Path) -> PathBuf {
    if let Ok(resolved) = std::fs::canonicalize(path) {
        return resolved;
    }
    path.components().collect()
}
