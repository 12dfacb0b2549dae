//! Behavioral indicator detectors
//!
//! Six detectors evaluate one process's sliding window plus the newest
//! event. Each returns a `Detection` with its fixed weight and evidence;
//! the scorer sums the weights of whatever triggered. Detectors are pure
//! over their inputs - no state survives between calls.
//!
//! Primary indicators: mass modification, entropy spikes, extension
//! manipulation, directory traversal. Secondary: suspicious process
//! characteristics, delete-then-create-encrypted patterns.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use super::scoring::Evidence;
use super::window::ProcessWindow;
use crate::event::{EventKind, FileEvent};

pub const WEIGHT_MASS_MODIFICATION: u8 = 25;
pub const WEIGHT_ENTROPY_SPIKE: u8 = 30;
pub const WEIGHT_EXTENSION_MANIPULATION: u8 = 25;
pub const WEIGHT_DIRECTORY_TRAVERSAL: u8 = 10;
pub const WEIGHT_SUSPICIOUS_PROCESS: u8 = 10;
pub const WEIGHT_DELETION_PATTERN: u8 = 20;

/// Extensions ransomware families rename their output to.
const SUSPICIOUS_EXTENSIONS: &[&str] = &[
    ".locked", ".encrypted", ".crypto", ".crypt", ".enc", ".ransom", ".rnsmwr", ".cerber",
    ".locky", ".zepto", ".odin", ".thor", ".aesir", ".zzzzz", ".wallet", ".petya", ".cry",
    ".wncry", ".wcry", ".wanna", ".xtbl", ".onion",
];

/// Path fragments marking throwaway execution locations.
const TEMP_ROOT_MARKERS: &[&str] = &["/tmp/", "/var/tmp/", "/dev/shm/", "/downloads/", "/.cache/"];

/// Executables younger than this are treated as freshly dropped.
const FRESH_EXECUTABLE_SECS: u64 = 60;

/// Default process-name blacklist.
pub const DEFAULT_NAME_BLACKLIST: &str = r"(?i)(ransom|crypt0?r|locker|wannacry|wncry)";

/// Whether a file suffix (lowercased, with dot) is on the known-bad list.
pub fn is_suspicious_suffix(suffix: &str) -> bool {
    SUSPICIOUS_EXTENSIONS.contains(&suffix)
}

/// Output of a single detector run.
#[derive(Debug, Clone)]
pub struct Detection {
    pub indicator: &'static str,
    pub triggered: bool,
    pub weight: u8,
    pub evidence: Option<Evidence>,
}

impl Detection {
    fn quiet(indicator: &'static str, weight: u8) -> Self {
        Self {
            indicator,
            triggered: false,
            weight,
            evidence: None,
        }
    }

    fn hit(indicator: &'static str, weight: u8, evidence: Evidence) -> Self {
        Self {
            indicator,
            triggered: true,
            weight,
            evidence: Some(evidence),
        }
    }
}

/// Thresholds shared by all detectors, derived from `BehaviorConfig` and
/// `EntropyConfig` at analyzer construction.
#[derive(Debug)]
pub struct DetectorParams {
    pub mass_threshold: usize,
    /// The burst sub-window T for mass modification, traversal, deletions.
    pub burst_window: Duration,
    pub entropy_delta_threshold: f64,
    pub entropy_spike_min_files: usize,
    pub extension_min_files: usize,
    pub traversal_min_dirs: usize,
    pub deletion_min_pairs: usize,
    pub name_blacklist: Regex,
}

impl DetectorParams {
    pub fn from_config(behavior: &crate::config::BehaviorConfig, delta_threshold: f64) -> Self {
        Self {
            mass_threshold: behavior.mass_threshold,
            burst_window: Duration::seconds(behavior.mass_window_seconds as i64),
            entropy_delta_threshold: delta_threshold,
            entropy_spike_min_files: behavior.entropy_spike_min_files,
            extension_min_files: behavior.extension_min_files,
            traversal_min_dirs: behavior.traversal_min_dirs,
            deletion_min_pairs: behavior.deletion_min_pairs,
            name_blacklist: Regex::new(DEFAULT_NAME_BLACKLIST).expect("built-in blacklist regex"),
        }
    }
}

/// Run all six detectors. `now` is the newest event's timestamp so that a
/// replayed sequence evaluates identically.
pub fn run_all(
    window: &ProcessWindow,
    newest: &FileEvent,
    params: &DetectorParams,
    now: DateTime<Utc>,
) -> Vec<Detection> {
    vec![
        mass_modification(window, params, now),
        entropy_spike(window, params),
        extension_manipulation(window, params),
        directory_traversal(window, params, now),
        suspicious_process(window, newest, params),
        deletion_pattern(window, params, now),
    ]
}

/// Indicator 1: N distinct paths written inside the burst window.
fn mass_modification(window: &ProcessWindow, params: &DetectorParams, now: DateTime<Utc>) -> Detection {
    let cutoff = now - params.burst_window;
    let mut paths = BTreeSet::new();

    for event in window.events().filter(|e| e.timestamp >= cutoff) {
        match event.kind {
            EventKind::Created | EventKind::Modified => {
                paths.insert(event.path.as_path());
            }
            EventKind::Moved | EventKind::ExtensionChanged => {
                if let Some(dest) = event.dest_path.as_deref() {
                    paths.insert(dest);
                }
            }
            EventKind::Deleted => {}
        }
    }

    if paths.len() >= params.mass_threshold {
        Detection::hit(
            "mass_modification",
            WEIGHT_MASS_MODIFICATION,
            Evidence::Count { count: paths.len() },
        )
    } else {
        Detection::quiet("mass_modification", WEIGHT_MASS_MODIFICATION)
    }
}

/// Indicator 2: K distinct files whose last observation shows an entropy
/// jump of at least theta. The comparison is inclusive: delta == theta
/// counts.
fn entropy_spike(window: &ProcessWindow, params: &DetectorParams) -> Detection {
    let mut last_delta: HashMap<&Path, f64> = HashMap::new();
    for event in window.events() {
        if let Some(reading) = &event.entropy {
            last_delta.insert(event.effective_path(), reading.delta);
        }
    }

    let mut spiked = 0usize;
    let mut max_delta = 0.0f64;
    for delta in last_delta.values() {
        if *delta >= params.entropy_delta_threshold {
            spiked += 1;
            if *delta > max_delta {
                max_delta = *delta;
            }
        }
    }

    if spiked >= params.entropy_spike_min_files {
        Detection::hit(
            "entropy_spike",
            WEIGHT_ENTROPY_SPIKE,
            Evidence::Delta {
                count: spiked,
                max_delta,
            },
        )
    } else {
        Detection::quiet("entropy_spike", WEIGHT_ENTROPY_SPIKE)
    }
}

/// Indicator 3: M renames landing on a known-bad suffix.
fn extension_manipulation(window: &ProcessWindow, params: &DetectorParams) -> Detection {
    let mut offenders = Vec::new();
    for event in window.events() {
        if !matches!(event.kind, EventKind::Moved | EventKind::ExtensionChanged) {
            continue;
        }
        if let Some(suffix) = event.suffix() {
            if is_suspicious_suffix(&suffix) {
                offenders.push(event.effective_path().to_path_buf());
            }
        }
    }

    if offenders.len() >= params.extension_min_files {
        Detection::hit(
            "extension_manipulation",
            WEIGHT_EXTENSION_MANIPULATION,
            Evidence::Paths { paths: offenders },
        )
    } else {
        Detection::quiet("extension_manipulation", WEIGHT_EXTENSION_MANIPULATION)
    }
}

/// Indicator 4: activity spread across D distinct directories inside the
/// burst window.
fn directory_traversal(window: &ProcessWindow, params: &DetectorParams, now: DateTime<Utc>) -> Detection {
    let cutoff = now - params.burst_window;
    let dirs: BTreeSet<&Path> = window
        .events()
        .filter(|e| e.timestamp >= cutoff)
        .filter_map(|e| e.parent_dir())
        .collect();

    if dirs.len() >= params.traversal_min_dirs {
        Detection::hit(
            "directory_traversal",
            WEIGHT_DIRECTORY_TRAVERSAL,
            Evidence::Count { count: dirs.len() },
        )
    } else {
        Detection::quiet("directory_traversal", WEIGHT_DIRECTORY_TRAVERSAL)
    }
}

/// Indicator 5: the responsible executable looks disposable - it runs from
/// a temp/download/cache root, was dropped on disk moments ago, or its name
/// matches the blacklist.
fn suspicious_process(
    window: &ProcessWindow,
    newest: &FileEvent,
    params: &DetectorParams,
) -> Detection {
    if params.name_blacklist.is_match(window.process_name()) {
        return Detection::hit(
            "suspicious_process",
            WEIGHT_SUSPICIOUS_PROCESS,
            Evidence::Paths {
                paths: vec![window.process_name().into()],
            },
        );
    }

    let exe = newest
        .process_exe
        .as_ref()
        .or_else(|| window.process_exe());
    let Some(exe) = exe else {
        return Detection::quiet("suspicious_process", WEIGHT_SUSPICIOUS_PROCESS);
    };

    let exe_str = exe.to_string_lossy().to_lowercase();
    let in_temp_root = TEMP_ROOT_MARKERS.iter().any(|m| exe_str.contains(m));

    let freshly_created = std::fs::metadata(exe)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .map(|age| age.as_secs() < FRESH_EXECUTABLE_SECS)
        .unwrap_or(false);

    if in_temp_root || freshly_created {
        Detection::hit(
            "suspicious_process",
            WEIGHT_SUSPICIOUS_PROCESS,
            Evidence::Paths {
                paths: vec![exe.clone()],
            },
        )
    } else {
        Detection::quiet("suspicious_process", WEIGHT_SUSPICIOUS_PROCESS)
    }
}

/// Indicator 6: P ordered delete-then-create pairs inside the burst window
/// where the new file lands in the deleted file's directory under a
/// known-bad suffix. Moved events contribute a delete of the source and a
/// create of the destination.
fn deletion_pattern(window: &ProcessWindow, params: &DetectorParams, now: DateTime<Utc>) -> Detection {
    let cutoff = now - params.burst_window;

    // (timestamp, parent dir) of deletions, in window order
    let mut deletes: Vec<(DateTime<Utc>, &Path, bool)> = Vec::new();
    // (timestamp, parent dir) of bad-suffix creations
    let mut creates: Vec<(DateTime<Utc>, &Path)> = Vec::new();

    for event in window.events().filter(|e| e.timestamp >= cutoff) {
        match event.kind {
            EventKind::Deleted => {
                if let Some(dir) = event.path.parent() {
                    deletes.push((event.timestamp, dir, false));
                }
            }
            EventKind::Moved | EventKind::ExtensionChanged => {
                if let Some(dir) = event.path.parent() {
                    deletes.push((event.timestamp, dir, false));
                }
                if let (Some(dest), Some(suffix)) = (event.dest_path.as_deref(), event.suffix()) {
                    if is_suspicious_suffix(&suffix) {
                        if let Some(dir) = dest.parent() {
                            creates.push((event.timestamp, dir));
                        }
                    }
                }
            }
            EventKind::Created => {
                if let Some(suffix) = event.suffix() {
                    if is_suspicious_suffix(&suffix) {
                        if let Some(dir) = event.path.parent() {
                            creates.push((event.timestamp, dir));
                        }
                    }
                }
            }
            EventKind::Modified => {}
        }
    }

    // Greedy matching: each delete pairs with at most one later create in
    // the same directory.
    let mut pairs = 0usize;
    for (create_ts, create_dir) in &creates {
        if let Some(slot) = deletes
            .iter_mut()
            .find(|d| !d.2 && d.0 <= *create_ts && d.1 == *create_dir)
        {
            slot.2 = true;
            pairs += 1;
        }
    }

    if pairs >= params.deletion_min_pairs {
        Detection::hit(
            "deletion_pattern",
            WEIGHT_DELETION_PATTERN,
            Evidence::Count { count: pairs },
        )
    } else {
        Detection::quiet("deletion_pattern", WEIGHT_DELETION_PATTERN)
    }
}
