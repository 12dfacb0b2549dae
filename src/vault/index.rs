//! Vault index database
//!
//! One row per stored version. The index is authoritative for lookups; the
//! per-snapshot `manifest.json` files exist so a vault can be audited with
//! nothing but a shell.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{BackupEntry, BackupReason, Result, VaultError};

/// Filter for listing backup entries.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub path: Option<PathBuf>,
    pub pid: Option<u32>,
    pub process: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Skip entries recorded for this reason.
    pub exclude_reason: Option<BackupReason>,
    pub limit: Option<usize>,
}

pub(super) struct VaultIndex {
    writer: Mutex<Connection>,
}

impl VaultIndex {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS backups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                original_path TEXT NOT NULL,
                vault_relative TEXT NOT NULL,
                ts INTEGER NOT NULL,
                sha256 TEXT NOT NULL,
                size INTEGER NOT NULL,
                reason TEXT NOT NULL,
                pid INTEGER,
                process_name TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_backups_original ON backups(original_path, ts);
            CREATE INDEX IF NOT EXISTS idx_backups_ts ON backups(ts);
            CREATE INDEX IF NOT EXISTS idx_backups_process ON backups(process_name, ts);
            CREATE INDEX IF NOT EXISTS idx_backups_pid ON backups(pid, ts);
            "#,
        )?;
        Ok(Self {
            writer: Mutex::new(conn),
        })
    }

    pub fn insert(&self, entry: &BackupEntry) -> Result<i64> {
        let conn = self.writer.lock().expect("vault index lock poisoned");
        conn.execute(
            "INSERT INTO backups (original_path, vault_relative, ts, sha256, size,
                                  reason, pid, process_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.original_path.to_string_lossy(),
                entry.vault_relative.to_string_lossy(),
                entry.timestamp.timestamp_millis(),
                entry.sha256,
                entry.size as i64,
                entry.reason.as_str(),
                entry.pid,
                entry.process_name,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get(&self, id: i64) -> Result<Option<BackupEntry>> {
        let conn = self.writer.lock().expect("vault index lock poisoned");
        let entry = conn
            .query_row(
                "SELECT id, original_path, vault_relative, ts, sha256, size, reason, pid, process_name
                 FROM backups WHERE id = ?1",
                params![id],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn list(&self, filter: &ListFilter) -> Result<Vec<BackupEntry>> {
        let mut sql = String::from(
            "SELECT id, original_path, vault_relative, ts, sha256, size, reason, pid, process_name
             FROM backups WHERE 1=1",
        );
        let mut values: Vec<Value> = Vec::new();

        if let Some(path) = &filter.path {
            sql.push_str(" AND original_path = ?");
            values.push(Value::Text(path.to_string_lossy().into_owned()));
        }
        if let Some(pid) = filter.pid {
            sql.push_str(" AND pid = ?");
            values.push(Value::Integer(i64::from(pid)));
        }
        if let Some(process) = &filter.process {
            sql.push_str(" AND process_name = ?");
            values.push(Value::Text(process.clone()));
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND ts >= ?");
            values.push(Value::Integer(since.timestamp_millis()));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND ts <= ?");
            values.push(Value::Integer(until.timestamp_millis()));
        }
        if let Some(reason) = filter.exclude_reason {
            sql.push_str(" AND reason != ?");
            values.push(Value::Text(reason.as_str().to_string()));
        }
        sql.push_str(" ORDER BY ts DESC, id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }

        let conn = self.writer.lock().expect("vault index lock poisoned");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Newest stored version of one original path.
    pub fn newest_for_path(&self, path: &Path) -> Result<Option<BackupEntry>> {
        let conn = self.writer.lock().expect("vault index lock poisoned");
        let entry = conn
            .query_row(
                "SELECT id, original_path, vault_relative, ts, sha256, size, reason, pid, process_name
                 FROM backups WHERE original_path = ?1
                 ORDER BY ts DESC, id DESC LIMIT 1",
                params![path.to_string_lossy()],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Newest entry per original path among rows matching the filter.
    pub fn newest_per_path(&self, filter: &ListFilter) -> Result<Vec<BackupEntry>> {
        let mut all = self.list(filter)?;
        // list() is newest-first; keep the first appearance of each path
        let mut seen = std::collections::HashSet::new();
        all.retain(|e| seen.insert(e.original_path.clone()));
        Ok(all)
    }

    /// Entries strictly older than the cutoff, oldest first.
    pub fn older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<BackupEntry>> {
        let conn = self.writer.lock().expect("vault index lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, original_path, vault_relative, ts, sha256, size, reason, pid, process_name
             FROM backups WHERE ts < ?1 ORDER BY ts ASC",
        )?;
        let rows = stmt
            .query_map(params![cutoff.timestamp_millis()], row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// How many live entries reference a stored vault file.
    pub fn reference_count(&self, vault_relative: &Path) -> Result<u64> {
        let conn = self.writer.lock().expect("vault index lock poisoned");
        let n: i64 = conn.query_row(
            "SELECT COUNT(1) FROM backups WHERE vault_relative = ?1",
            params![vault_relative.to_string_lossy()],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        let conn = self.writer.lock().expect("vault index lock poisoned");
        conn.execute("DELETE FROM backups WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn row_to_entry(r: &rusqlite::Row<'_>) -> rusqlite::Result<BackupEntry> {
    let reason_s: String = r.get(6)?;
    Ok(BackupEntry {
        id: r.get(0)?,
        original_path: PathBuf::from(r.get::<_, String>(1)?),
        vault_relative: PathBuf::from(r.get::<_, String>(2)?),
        timestamp: DateTime::from_timestamp_millis(r.get(3)?).unwrap_or_default(),
        sha256: r.get(4)?,
        size: r.get::<_, i64>(5)? as u64,
        reason: reason_s.parse().unwrap_or(BackupReason::Manual),
        pid: r.get(7)?,
        process_name: r.get(8)?,
    })
}

impl VaultError {
    pub(super) fn not_found(id: i64) -> Self {
        VaultError::NotFound { id }
    }
}
