//! Behavioral analysis engine
//!
//! Owns every `ProcessWindow` and turns the event stream into threat
//! records. For each incoming event the analyzer prunes and updates the
//! process's window, runs the six detectors, scores the result, and decides
//! whether a `ThreatRecord` should be emitted. Emitted escalations are
//! non-decreasing per PID, and re-emission at the same escalation is rate
//! limited by a refractory period unless the score jumps.
//!
//! All time arithmetic uses event timestamps, so replaying a recorded
//! sequence through a fresh analyzer reproduces the same records.

pub mod detectors;
pub mod scoring;
pub mod window;

pub use scoring::{ActionRecord, Evidence, ThreatLevel, ThreatRecord};
pub use window::{ProcessWindow, WindowSummary};

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::config::Config;
use crate::event::FileEvent;
use detectors::DetectorParams;

/// Score increase that overrides the refractory period at equal escalation.
const REEMIT_SCORE_STEP: u8 = 10;

/// A threat record plus the context the response engine needs to act on it.
#[derive(Debug, Clone)]
pub struct ThreatNotice {
    pub record: ThreatRecord,
    /// Distinct paths the process wrote inside its current window.
    pub touched_paths: Vec<PathBuf>,
    /// Window snapshot for the incident report.
    pub window: WindowSummary,
}

/// Dashboard-facing per-process status.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessStatus {
    pub pid: u32,
    pub process_name: String,
    pub score: u8,
    pub level: ThreatLevel,
    pub last_event_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct EmissionState {
    escalation: u8,
    score: u8,
    at: DateTime<Utc>,
}

/// Real-time behavioral analyzer. Single-owner: exactly one task drives it.
pub struct BehaviorAnalyzer {
    config: Config,
    params: DetectorParams,
    window_len: Duration,
    refractory: Duration,
    windows: HashMap<u32, ProcessWindow>,
    emitted: HashMap<u32, EmissionState>,
    latest_score: HashMap<u32, (u8, ThreatLevel)>,
}

impl BehaviorAnalyzer {
    pub fn new(config: &Config) -> Self {
        let params = DetectorParams::from_config(&config.behavior, config.entropy.delta_threshold);
        Self {
            config: config.clone(),
            params,
            window_len: Duration::seconds(config.behavior.window_seconds as i64),
            refractory: Duration::seconds(config.behavior.refractory_seconds as i64),
            windows: HashMap::new(),
            emitted: HashMap::new(),
            latest_score: HashMap::new(),
        }
    }

    /// Ingest one normalized event. Returns a notice when the process
    /// crossed an emission threshold.
    pub fn observe(&mut self, event: FileEvent) -> Option<ThreatNotice> {
        let pid = event.pid;
        let now = event.timestamp;

        self.reset_if_recycled(&event);

        // Whitelisted processes are tracked but never scored.
        if self.config.is_whitelisted(&event.process_name) {
            self.latest_score.insert(pid, (0, ThreatLevel::Normal));
            self.windows
                .entry(pid)
                .or_insert_with(|| {
                    ProcessWindow::new(pid, event.process_name.clone(), event.process_exe.clone())
                })
                .append(event);
            return None;
        }

        let window = self.windows.entry(pid).or_insert_with(|| {
            ProcessWindow::new(pid, event.process_name.clone(), event.process_exe.clone())
        });
        window.prune(now, self.window_len);
        window.append(event.clone());

        let detections = detectors::run_all(window, &event, &self.params, now);
        let (score, level, escalation) = scoring::score(&detections);
        self.latest_score.insert(pid, (score, level));

        if escalation == 0 {
            return None;
        }

        if !self.should_emit(pid, escalation, score, now) {
            return None;
        }

        let window = &self.windows[&pid];
        let mut indicators = BTreeMap::new();
        for d in detections.into_iter().filter(|d| d.triggered) {
            if let Some(evidence) = d.evidence {
                indicators.insert(d.indicator.to_string(), evidence);
            }
        }

        let record = ThreatRecord {
            id: 0,
            timestamp: now,
            pid,
            process_name: window.process_name().to_string(),
            process_exe: window.process_exe().cloned(),
            score,
            level,
            escalation,
            indicators,
            actions_taken: Vec::new(),
            incident_report: None,
        };

        self.emitted.insert(
            pid,
            EmissionState {
                escalation,
                score,
                at: now,
            },
        );

        warn!(
            pid,
            process = %record.process_name,
            score,
            escalation,
            "threat threshold crossed"
        );

        Some(ThreatNotice {
            touched_paths: window.touched_paths(),
            window: window.summary(),
            record,
        })
    }

    /// Emission policy: escalate immediately, re-emit at the same level only
    /// after the refractory period or a significant score jump, and never
    /// emit below the level already reported.
    fn should_emit(&self, pid: u32, escalation: u8, score: u8, now: DateTime<Utc>) -> bool {
        match self.emitted.get(&pid) {
            None => true,
            Some(prev) if escalation > prev.escalation => true,
            Some(prev) if escalation < prev.escalation => false,
            Some(prev) => {
                now - prev.at >= self.refractory || score >= prev.score.saturating_add(REEMIT_SCORE_STEP)
            }
        }
    }

    /// Drop all state for a PID that has been recycled by a different
    /// executable, so the newcomer cannot inherit old evidence.
    fn reset_if_recycled(&mut self, event: &FileEvent) {
        let pid = event.pid;
        let stale = self
            .windows
            .get(&pid)
            .map(|w| w.process_name() != event.process_name)
            .unwrap_or(false);
        if stale {
            debug!(pid, "pid recycled by a different process, resetting window");
            self.windows.remove(&pid);
            self.emitted.remove(&pid);
            self.latest_score.remove(&pid);
        }
    }

    /// Per-process status for the dashboard.
    pub fn snapshot(&self) -> Vec<ProcessStatus> {
        let mut statuses: Vec<ProcessStatus> = self
            .windows
            .values()
            .map(|w| {
                let (score, level) = self
                    .latest_score
                    .get(&w.pid())
                    .copied()
                    .unwrap_or((0, ThreatLevel::Normal));
                ProcessStatus {
                    pid: w.pid(),
                    process_name: w.process_name().to_string(),
                    score,
                    level,
                    last_event_at: w.last_event_at(),
                }
            })
            .collect();
        statuses.sort_by_key(|s| s.pid);
        statuses
    }

    /// Drop all state for a process that exited.
    pub fn forget(&mut self, pid: u32) {
        self.windows.remove(&pid);
        self.emitted.remove(&pid);
        self.latest_score.remove(&pid);
    }

    /// Garbage-collect windows that have sat empty for twice the window
    /// length. Called from housekeeping.
    pub fn collect_stale(&mut self, now: DateTime<Utc>) -> usize {
        let horizon = self.window_len * 2;
        let stale: Vec<u32> = self
            .windows
            .iter()
            .filter_map(|(pid, w)| match w.empty_since() {
                Some(t) if now - t >= horizon => Some(*pid),
                _ => None,
            })
            .collect();
        for pid in &stale {
            self.forget(*pid);
        }
        stale.len()
    }

    /// Prune every window against `now` so stale evidence ages out even
    /// when a process goes quiet.
    pub fn prune_all(&mut self, now: DateTime<Utc>) {
        for window in self.windows.values_mut() {
            window.prune(now, self.window_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EntropyReading, EventKind};

    fn analyzer() -> BehaviorAnalyzer {
        BehaviorAnalyzer::new(&Config::default())
    }

    fn event(
        ts: DateTime<Utc>,
        kind: EventKind,
        path: &str,
        pid: u32,
        name: &str,
    ) -> FileEvent {
        FileEvent {
            id: 0,
            timestamp: ts,
            kind,
            path: PathBuf::from(path),
            dest_path: None,
            size_before: None,
            size_after: None,
            pid,
            process_name: name.to_string(),
            process_exe: None,
            entropy: None,
        }
    }

    /// 25 files rewritten to *.encrypted with large entropy jumps in 8 s.
    fn encryption_burst(pid: u32, name: &str, start: DateTime<Utc>) -> Vec<FileEvent> {
        let mut events = Vec::new();
        for i in 0..25 {
            let ts = start + Duration::milliseconds(i * 320);
            let path = format!("/home/u/docs/file{i}.txt");

            let mut modified = event(ts, EventKind::Modified, &path, pid, name);
            modified.entropy = Some(EntropyReading {
                before: Some(4.5),
                after: 8.0,
                delta: 3.5,
            });
            events.push(modified);

            let mut renamed = event(
                ts + Duration::milliseconds(10),
                EventKind::ExtensionChanged,
                &path,
                pid,
                name,
            );
            renamed.dest_path = Some(PathBuf::from(format!("{path}.encrypted")));
            events.push(renamed);
        }
        events
    }

    #[test]
    fn test_encryption_burst_reaches_escalation_four() {
        let mut analyzer = analyzer();
        let start = Utc::now();

        let mut top: Option<ThreatRecord> = None;
        for ev in encryption_burst(4242, "evil", start) {
            if let Some(notice) = analyzer.observe(ev) {
                top = Some(notice.record);
            }
        }

        let record = top.expect("burst must emit");
        assert!(record.score >= 80, "score was {}", record.score);
        assert_eq!(record.escalation, 4);
        assert_eq!(record.level, ThreatLevel::Critical);
        assert!(record.indicators.contains_key("entropy_spike"));
        assert!(record.indicators.contains_key("mass_modification"));
        assert!(record.indicators.contains_key("extension_manipulation"));
    }

    #[test]
    fn test_whitelisted_process_never_scores() {
        let mut config = Config::default();
        config.response.process_whitelist = vec!["7z.exe".to_string()];
        let mut analyzer = BehaviorAnalyzer::new(&config);
        let start = Utc::now();

        // A whitelisted archiver creating 50 high-entropy files
        for i in 0..50 {
            let ts = start + Duration::milliseconds(i * 100);
            let mut ev = event(
                ts,
                EventKind::Created,
                &format!("/home/u/backup/part{i}.7z"),
                900,
                "7z.exe",
            );
            ev.entropy = Some(EntropyReading {
                before: None,
                after: 7.6,
                delta: 0.0,
            });
            assert!(analyzer.observe(ev).is_none());
        }

        let snapshot = analyzer.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].score, 0);
        assert_eq!(snapshot[0].level, ThreatLevel::Normal);
    }

    #[test]
    fn test_emitted_escalations_are_monotonic() {
        let mut analyzer = analyzer();
        let start = Utc::now();

        let mut escalations = Vec::new();
        for ev in encryption_burst(4242, "evil", start) {
            if let Some(notice) = analyzer.observe(ev) {
                escalations.push(notice.record.escalation);
            }
        }

        assert!(!escalations.is_empty());
        assert!(escalations.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_refractory_suppresses_same_level_chatter() {
        let mut analyzer = analyzer();
        let start = Utc::now();

        // Enough renames to hold extension_manipulation (25): escalation 1
        let mut emitted = 0;
        for i in 0..6 {
            let ts = start + Duration::milliseconds(i * 200);
            let mut ev = event(
                ts,
                EventKind::ExtensionChanged,
                &format!("/d/f{i}.txt"),
                7,
                "proc",
            );
            ev.dest_path = Some(PathBuf::from(format!("/d/f{i}.locked")));
            if analyzer.observe(ev).is_some() {
                emitted += 1;
            }
        }
        // One emission when the threshold was crossed; the rest are inside
        // the refractory period at the same escalation and score.
        assert_eq!(emitted, 1);
    }

    #[test]
    fn test_cross_process_isolation() {
        let mut analyzer = analyzer();
        let start = Utc::now();

        let burst_a = encryption_burst(100, "evil-a", start);
        let burst_b = encryption_burst(200, "evil-b", start);

        let mut records_a = Vec::new();
        let mut records_b = Vec::new();
        for (a, b) in burst_a.into_iter().zip(burst_b.into_iter()) {
            if let Some(n) = analyzer.observe(a) {
                records_a.push(n.record);
            }
            if let Some(n) = analyzer.observe(b) {
                records_b.push(n.record);
            }
        }

        assert!(records_a.iter().all(|r| r.pid == 100));
        assert!(records_b.iter().all(|r| r.pid == 200));
        assert_eq!(records_a.last().unwrap().escalation, 4);
        assert_eq!(records_b.last().unwrap().escalation, 4);

        // A third, quiet process stays clean
        let quiet = event(start, EventKind::Modified, "/home/u/notes.md", 300, "vim");
        assert!(analyzer.observe(quiet).is_none());
        let snapshot = analyzer.snapshot();
        let vim = snapshot.iter().find(|s| s.pid == 300).unwrap();
        assert_eq!(vim.score, 0);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let start = Utc::now();
        let burst = encryption_burst(4242, "evil", start);

        let run = |events: &[FileEvent]| -> Vec<(u8, u8)> {
            let mut analyzer = analyzer();
            events
                .iter()
                .filter_map(|e| analyzer.observe(e.clone()))
                .map(|n| (n.record.score, n.record.escalation))
                .collect()
        };

        assert_eq!(run(&burst), run(&burst));
    }

    #[test]
    fn test_pid_reuse_resets_window() {
        let mut analyzer = analyzer();
        let start = Utc::now();

        for i in 0..10 {
            let mut ev = event(
                start + Duration::milliseconds(i * 100),
                EventKind::ExtensionChanged,
                &format!("/d/f{i}.txt"),
                55,
                "alpha",
            );
            ev.dest_path = Some(PathBuf::from(format!("/d/f{i}.locked")));
            analyzer.observe(ev);
        }

        // Same PID, different executable: must not inherit alpha's evidence
        let fresh = event(
            start + Duration::seconds(2),
            EventKind::Modified,
            "/d/new.txt",
            55,
            "beta",
        );
        assert!(analyzer.observe(fresh).is_none());
        let snapshot = analyzer.snapshot();
        let beta = snapshot.iter().find(|s| s.pid == 55).unwrap();
        assert_eq!(beta.process_name, "beta");
        assert_eq!(beta.score, 0);
    }

    #[test]
    fn test_stale_window_collection() {
        let mut analyzer = analyzer();
        let start = Utc::now();

        analyzer.observe(event(start, EventKind::Modified, "/d/a.txt", 9, "proc"));
        assert_eq!(analyzer.snapshot().len(), 1);

        // Window empties at +60s prune, then collects 2W later
        let later = start + Duration::seconds(70);
        analyzer.prune_all(later);
        assert_eq!(analyzer.collect_stale(later), 0);

        let much_later = later + Duration::seconds(121);
        assert_eq!(analyzer.collect_stale(much_later), 1);
        assert!(analyzer.snapshot().is_empty());
    }
}
