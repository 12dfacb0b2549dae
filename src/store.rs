//! Durable persistence for file events and threat records
//!
//! A single SQLite database in WAL mode: one writer connection behind a
//! mutex, short-lived read-only connections for queries so readers never
//! block the writer. Below the free-space floor the store degrades and
//! drops file events; threat records are always written.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::analyzer::{Evidence, ThreatLevel, ThreatRecord};
use crate::event::{EntropyReading, EventKind, FileEvent};
use crate::sys;

/// Free-space floor below which file events are shed.
const MIN_FREE_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage full: {free_mb} MB free is below the floor")]
    StorageFull { free_mb: u64 },
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed row: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Filter for `query_events`. Unset fields match everything.
#[derive(Debug, Clone)]
pub struct EventFilter {
    pub paths: Option<Vec<PathBuf>>,
    pub pid: Option<u32>,
    pub process: Option<String>,
    pub kinds: Option<Vec<EventKind>>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            paths: None,
            pid: None,
            process: None,
            kinds: None,
            since: None,
            until: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// Filter for `query_threats`.
#[derive(Debug, Clone)]
pub struct ThreatFilter {
    pub severity: Option<ThreatLevel>,
    pub since: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub limit: usize,
}

impl Default for ThreatFilter {
    fn default() -> Self {
        Self {
            severity: None,
            since: None,
            pid: None,
            limit: 100,
        }
    }
}

/// Append-only log of file events and threat records.
pub struct EventStore {
    path: PathBuf,
    writer: Mutex<Connection>,
    min_free_bytes: u64,
    degraded: AtomicBool,
    dropped_events: AtomicU64,
}

impl EventStore {
    /// Open (or create) the store at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_floor(path, MIN_FREE_BYTES)
    }

    /// Open with an explicit free-space floor (tests exercise degraded mode
    /// by raising it).
    pub fn open_with_floor(path: &Path, min_free_bytes: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS file_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                kind TEXT NOT NULL,
                path TEXT NOT NULL,
                dest_path TEXT,
                size_before INTEGER,
                size_after INTEGER,
                pid INTEGER NOT NULL,
                process_name TEXT NOT NULL,
                process_exe TEXT,
                entropy_before REAL,
                entropy_after REAL,
                entropy_delta REAL
            );

            CREATE INDEX IF NOT EXISTS idx_events_ts ON file_events(ts);
            CREATE INDEX IF NOT EXISTS idx_events_path ON file_events(path);
            CREATE INDEX IF NOT EXISTS idx_events_pid ON file_events(pid, ts);
            CREATE INDEX IF NOT EXISTS idx_events_kind ON file_events(kind, ts);

            CREATE TABLE IF NOT EXISTS threats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                pid INTEGER NOT NULL,
                process_name TEXT NOT NULL,
                process_exe TEXT,
                score INTEGER NOT NULL,
                level TEXT NOT NULL,
                escalation INTEGER NOT NULL,
                indicators TEXT NOT NULL,
                actions TEXT NOT NULL,
                incident_report TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_threats_ts ON threats(ts);
            CREATE INDEX IF NOT EXISTS idx_threats_pid ON threats(pid, ts);
            CREATE INDEX IF NOT EXISTS idx_threats_level ON threats(level, ts);
            "#,
        )?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(conn),
            min_free_bytes,
            degraded: AtomicBool::new(false),
            dropped_events: AtomicU64::new(0),
        })
    }

    /// Short-lived read-only connection; WAL keeps readers off the
    /// writer's back.
    fn reader(&self) -> Result<Connection> {
        Ok(Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?)
    }

    /// Append a file event. Refuses with `StorageFull` (and counts the
    /// drop) when free space is below the floor.
    pub fn append_event(&self, event: &FileEvent) -> Result<i64> {
        let free = sys::free_space_bytes(&self.path)?;
        if free < self.min_free_bytes {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            if !self.degraded.swap(true, Ordering::Relaxed) {
                warn!(
                    free_mb = free / (1024 * 1024),
                    "event store entering degraded mode, shedding file events"
                );
            }
            return Err(StoreError::StorageFull {
                free_mb: free / (1024 * 1024),
            });
        }
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!("event store recovered from degraded mode");
        }

        let conn = self.writer.lock().expect("store writer lock poisoned");
        conn.execute(
            "INSERT INTO file_events (ts, kind, path, dest_path, size_before, size_after,
                                      pid, process_name, process_exe,
                                      entropy_before, entropy_after, entropy_delta)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                event.timestamp.timestamp_millis(),
                event.kind.as_str(),
                event.path.to_string_lossy(),
                event.dest_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                event.size_before.map(|s| s as i64),
                event.size_after.map(|s| s as i64),
                event.pid,
                event.process_name,
                event.process_exe.as_ref().map(|p| p.to_string_lossy().into_owned()),
                event.entropy.as_ref().and_then(|e| e.before),
                event.entropy.as_ref().map(|e| e.after),
                event.entropy.as_ref().map(|e| e.delta),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Append a threat record. Never shed: threat records must survive
    /// even under disk pressure.
    pub fn append_threat(&self, record: &ThreatRecord) -> Result<i64> {
        let indicators = serde_json::to_string(&record.indicators)
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        let actions = serde_json::to_string(&record.actions_taken)
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        let report = record
            .incident_report
            .as_ref()
            .map(|r| r.to_string());

        let conn = self.writer.lock().expect("store writer lock poisoned");
        conn.execute(
            "INSERT INTO threats (ts, pid, process_name, process_exe, score, level,
                                  escalation, indicators, actions, incident_report)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.timestamp.timestamp_millis(),
                record.pid,
                record.process_name,
                record.process_exe.as_ref().map(|p| p.to_string_lossy().into_owned()),
                record.score,
                record.level.as_str(),
                record.escalation,
                indicators,
                actions,
                report,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Query file events, newest first.
    pub fn query_events(&self, filter: &EventFilter) -> Result<Vec<FileEvent>> {
        let mut sql = String::from(
            "SELECT id, ts, kind, path, dest_path, size_before, size_after,
                    pid, process_name, process_exe,
                    entropy_before, entropy_after, entropy_delta
             FROM file_events WHERE 1=1",
        );
        let mut values: Vec<Value> = Vec::new();

        if let Some(paths) = &filter.paths {
            if !paths.is_empty() {
                let marks = vec!["?"; paths.len()].join(", ");
                sql.push_str(&format!(" AND path IN ({marks})"));
                for p in paths {
                    values.push(Value::Text(p.to_string_lossy().into_owned()));
                }
            }
        }
        if let Some(pid) = filter.pid {
            sql.push_str(" AND pid = ?");
            values.push(Value::Integer(i64::from(pid)));
        }
        if let Some(process) = &filter.process {
            sql.push_str(" AND process_name = ?");
            values.push(Value::Text(process.clone()));
        }
        if let Some(kinds) = &filter.kinds {
            if !kinds.is_empty() {
                let marks = vec!["?"; kinds.len()].join(", ");
                sql.push_str(&format!(" AND kind IN ({marks})"));
                for k in kinds {
                    values.push(Value::Text(k.as_str().to_string()));
                }
            }
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND ts >= ?");
            values.push(Value::Integer(since.timestamp_millis()));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND ts <= ?");
            values.push(Value::Integer(until.timestamp_millis()));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ? OFFSET ?");
        values.push(Value::Integer(filter.limit as i64));
        values.push(Value::Integer(filter.offset as i64));

        let conn = self.reader()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |r| {
                let kind_s: String = r.get(2)?;
                let after: Option<f64> = r.get(11)?;
                Ok(FileEvent {
                    id: r.get(0)?,
                    timestamp: millis_to_utc(r.get(1)?),
                    kind: kind_s.parse().unwrap_or(EventKind::Modified),
                    path: PathBuf::from(r.get::<_, String>(3)?),
                    dest_path: r.get::<_, Option<String>>(4)?.map(PathBuf::from),
                    size_before: r.get::<_, Option<i64>>(5)?.map(|s| s as u64),
                    size_after: r.get::<_, Option<i64>>(6)?.map(|s| s as u64),
                    pid: r.get(7)?,
                    process_name: r.get(8)?,
                    process_exe: r.get::<_, Option<String>>(9)?.map(PathBuf::from),
                    entropy: after.map(|after| EntropyReading {
                        before: r.get(10).ok().flatten(),
                        after,
                        delta: r.get(12).ok().flatten().unwrap_or(0.0),
                    }),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Query threat records, newest first.
    pub fn query_threats(&self, filter: &ThreatFilter) -> Result<Vec<ThreatRecord>> {
        let mut sql = String::from(
            "SELECT id, ts, pid, process_name, process_exe, score, level,
                    escalation, indicators, actions, incident_report
             FROM threats WHERE 1=1",
        );
        let mut values: Vec<Value> = Vec::new();

        if let Some(severity) = filter.severity {
            sql.push_str(" AND level = ?");
            values.push(Value::Text(severity.as_str().to_string()));
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND ts >= ?");
            values.push(Value::Integer(since.timestamp_millis()));
        }
        if let Some(pid) = filter.pid {
            sql.push_str(" AND pid = ?");
            values.push(Value::Integer(i64::from(pid)));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");
        values.push(Value::Integer(filter.limit as i64));

        let conn = self.reader()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |r| {
                let level_s: String = r.get(6)?;
                let indicators_s: String = r.get(8)?;
                let actions_s: String = r.get(9)?;
                let report_s: Option<String> = r.get(10)?;
                Ok(ThreatRecord {
                    id: r.get(0)?,
                    timestamp: millis_to_utc(r.get(1)?),
                    pid: r.get(2)?,
                    process_name: r.get(3)?,
                    process_exe: r.get::<_, Option<String>>(4)?.map(PathBuf::from),
                    score: r.get(5)?,
                    level: level_s.parse().unwrap_or(ThreatLevel::Normal),
                    escalation: r.get(7)?,
                    indicators: serde_json::from_str::<std::collections::BTreeMap<String, Evidence>>(
                        &indicators_s,
                    )
                    .unwrap_or_default(),
                    actions_taken: serde_json::from_str(&actions_s).unwrap_or_default(),
                    incident_report: report_s.and_then(|s| serde_json::from_str(&s).ok()),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Compact the database. Called from housekeeping.
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.writer.lock().expect("store writer lock poisoned");
        conn.execute_batch("VACUUM")?;
        Ok(())
    }

    /// Whether the store is currently shedding file events.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Number of file events shed under disk pressure.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
