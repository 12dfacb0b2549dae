//! Shannon entropy measurement and per-path baselines
//!
//! Entropy measures the randomness of data. Normal files (text, documents)
//! sit around 3-5 bits/byte; encrypted output is pinned near 8.0. Ransomware
//! cannot avoid producing high-entropy bytes, so a jump in a file's entropy
//! between observations is the strongest single indicator we have.
//!
//! Measurements read a fixed prefix (default 1024 bytes) rather than whole
//! files. Baselines are kept in a small SQLite database so spikes survive
//! restarts.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

/// Files above this size may be sampled at spread offsets instead of
/// head-only, when `sample_spread` is enabled.
const LARGE_FILE_THRESHOLD: u64 = 10 * 1024 * 1024;
const SPREAD_SAMPLE_COUNT: u64 = 3;

#[derive(Debug, Error)]
pub enum EntropyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("baseline database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, EntropyError>;

/// Calculate Shannon entropy of a byte slice.
///
/// Returns a value between 0.0 (all identical bytes) and 8.0 (uniform
/// distribution over all 256 byte values). Single pass, fixed-size
/// frequency table, no allocations.
#[inline]
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut frequency = [0u64; 256];
    for &byte in data {
        frequency[byte as usize] += 1;
    }

    let len = data.len() as f64;
    let mut entropy = 0.0;

    for &count in &frequency {
        if count > 0 {
            let probability = count as f64 / len;
            entropy -= probability * probability.log2();
        }
    }

    entropy.clamp(0.0, 8.0)
}

/// A stored baseline observation for one path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    pub entropy: f64,
    pub observed_at: DateTime<Utc>,
}

/// Computes file entropy and remembers per-path baselines.
pub struct EntropyEngine {
    prefix_bytes: usize,
    sample_spread: bool,
    conn: Mutex<Connection>,
}

impl EntropyEngine {
    /// Open (or create) the baseline database and build an engine.
    pub fn open(db_path: &Path, prefix_bytes: usize, sample_spread: bool) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS baselines (
                path TEXT PRIMARY KEY,
                entropy REAL NOT NULL,
                observed_at INTEGER NOT NULL,
                deleted_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_baselines_deleted
                ON baselines(deleted_at);
            "#,
        )?;
        Ok(Self {
            prefix_bytes,
            sample_spread,
            conn: Mutex::new(conn),
        })
    }

    /// In-memory engine for tests and ephemeral runs.
    pub fn in_memory(prefix_bytes: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS baselines (
                path TEXT PRIMARY KEY,
                entropy REAL NOT NULL,
                observed_at INTEGER NOT NULL,
                deleted_at INTEGER
            );
            "#,
        )?;
        Ok(Self {
            prefix_bytes,
            sample_spread: false,
            conn: Mutex::new(conn),
        })
    }

    /// Measure the entropy of a file's sampled content.
    ///
    /// Errors (vanished file, permission denied, lock contention) are
    /// returned for the caller to treat as "no measurement" - they are
    /// expected during bursts of file activity and never fatal.
    pub fn measure(&self, path: &Path) -> Result<f64> {
        let mut file = std::fs::File::open(path)?;
        let size = file.metadata()?.len();

        if size == 0 {
            return Ok(0.0);
        }

        if self.sample_spread && size > LARGE_FILE_THRESHOLD {
            return self.measure_spread(&mut file, size);
        }

        let mut buf = vec![0u8; self.prefix_bytes.min(size as usize)];
        file.read_exact(&mut buf)?;
        Ok(shannon_entropy(&buf))
    }

    /// Average entropy over equally spaced samples of a large file.
    fn measure_spread(&self, file: &mut std::fs::File, size: u64) -> Result<f64> {
        let sample = self.prefix_bytes as u64;
        let max_offset = size.saturating_sub(sample);
        let step = max_offset / (SPREAD_SAMPLE_COUNT - 1);

        let mut total = 0.0;
        let mut samples = 0u32;
        let mut buf = vec![0u8; sample as usize];

        for i in 0..SPREAD_SAMPLE_COUNT {
            file.seek(SeekFrom::Start(step * i))?;
            let n = file.read(&mut buf)?;
            if n > 0 {
                total += shannon_entropy(&buf[..n]);
                samples += 1;
            }
        }

        if samples == 0 {
            return Ok(0.0);
        }
        Ok((total / f64::from(samples)).clamp(0.0, 8.0))
    }

    /// Look up the recorded baseline for a path.
    pub fn baseline(&self, path: &Path) -> Result<Option<Baseline>> {
        let conn = self.conn.lock().expect("baseline db lock poisoned");
        let row = conn
            .query_row(
                "SELECT entropy, observed_at FROM baselines WHERE path = ?1",
                params![path.to_string_lossy()],
                |r| {
                    Ok((r.get::<_, f64>(0)?, r.get::<_, i64>(1)?))
                },
            )
            .optional()?;

        Ok(row.map(|(entropy, millis)| Baseline {
            entropy,
            observed_at: DateTime::from_timestamp_millis(millis).unwrap_or_default(),
        }))
    }

    /// Record (or overwrite) the baseline for a path. Clears any pending
    /// deletion mark, so a re-created file starts a fresh lifecycle.
    pub fn update_baseline(
        &self,
        path: &Path,
        entropy: f64,
        observed_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("baseline db lock poisoned");
        conn.execute(
            "INSERT INTO baselines (path, entropy, observed_at, deleted_at)
             VALUES (?1, ?2, ?3, NULL)
             ON CONFLICT(path) DO UPDATE
             SET entropy = excluded.entropy,
                 observed_at = excluded.observed_at,
                 deleted_at = NULL",
            params![
                path.to_string_lossy(),
                entropy,
                observed_at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    /// Drop the baseline for a path immediately.
    pub fn forget(&self, path: &Path) -> Result<()> {
        let conn = self.conn.lock().expect("baseline db lock poisoned");
        conn.execute(
            "DELETE FROM baselines WHERE path = ?1",
            params![path.to_string_lossy()],
        )?;
        Ok(())
    }

    /// Mark a path's backing file as deleted. The baseline survives until
    /// the grace period elapses, in case the delete was part of an
    /// encrypt-and-replace sequence we still want to compare against.
    pub fn mark_deleted(&self, path: &Path, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().expect("baseline db lock poisoned");
        conn.execute(
            "UPDATE baselines SET deleted_at = ?2 WHERE path = ?1 AND deleted_at IS NULL",
            params![path.to_string_lossy(), at.timestamp_millis()],
        )?;
        Ok(())
    }

    /// Remove baselines whose backing files were deleted before `cutoff`.
    /// Returns the number removed. Called from housekeeping.
    pub fn sweep_deleted(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().expect("baseline db lock poisoned");
        let n = conn.execute(
            "DELETE FROM baselines WHERE deleted_at IS NOT NULL AND deleted_at < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::path::PathBuf;

    #[test]
    fn test_entropy_empty() {
        assert_eq!(shannon_entropy(&[]), 0.0);
    }

    #[test]
    fn test_entropy_uniform() {
        // All same byte = 0 entropy
        let data = vec![0u8; 1000];
        assert_eq!(shannon_entropy(&data), 0.0);
    }

    #[test]
    fn test_entropy_two_values() {
        // Equal distribution of two values = 1.0 entropy
        let data: Vec<u8> = (0..1000).map(|i| (i % 2) as u8).collect();
        let entropy = shannon_entropy(&data);
        assert!((entropy - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_entropy_text() {
        let text = b"The quick brown fox jumps over the lazy dog, repeatedly.";
        let entropy = shannon_entropy(text);
        assert!(entropy > 3.0 && entropy < 5.0);
    }

    #[test]
    fn test_entropy_pseudo_random() {
        let data: Vec<u8> = (0..10000u64)
            .map(|i| ((i.wrapping_mul(1103515245).wrapping_add(12345)) % 256) as u8)
            .collect();
        let entropy = shannon_entropy(&data);
        assert!(entropy > 7.5);
        assert!(entropy <= 8.0);
    }

    #[test]
    fn test_measure_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        std::fs::write(&path, b"").unwrap();

        let engine = EntropyEngine::in_memory(1024).unwrap();
        assert_eq!(engine.measure(&path).unwrap(), 0.0);
    }

    #[test]
    fn test_measure_reads_prefix_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.bin");

        // Low-entropy prefix followed by random tail; head-only sampling
        // must see only the zeros.
        let mut content = vec![0u8; 1024];
        content.extend((0..4096u64).map(|i| (i.wrapping_mul(2654435761) % 256) as u8));
        std::fs::write(&path, &content).unwrap();

        let engine = EntropyEngine::in_memory(1024).unwrap();
        assert_eq!(engine.measure(&path).unwrap(), 0.0);
    }

    #[test]
    fn test_measure_missing_file_is_error() {
        let engine = EntropyEngine::in_memory(1024).unwrap();
        assert!(engine.measure(Path::new("/no/such/file")).is_err());
    }

    #[test]
    fn test_baseline_round_trip() {
        let engine = EntropyEngine::in_memory(1024).unwrap();
        let path = PathBuf::from("/home/u/doc.txt");
        let now = Utc::now();

        assert!(engine.baseline(&path).unwrap().is_none());

        engine.update_baseline(&path, 4.5, now).unwrap();
        let b = engine.baseline(&path).unwrap().unwrap();
        assert!((b.entropy - 4.5).abs() < f64::EPSILON);

        engine.update_baseline(&path, 7.9, now).unwrap();
        let b = engine.baseline(&path).unwrap().unwrap();
        assert!((b.entropy - 7.9).abs() < f64::EPSILON);

        engine.forget(&path).unwrap();
        assert!(engine.baseline(&path).unwrap().is_none());
    }

    #[test]
    fn test_deleted_baselines_swept_after_grace() {
        let engine = EntropyEngine::in_memory(1024).unwrap();
        let path = PathBuf::from("/home/u/doc.txt");
        let now = Utc::now();

        engine.update_baseline(&path, 4.5, now).unwrap();
        engine.mark_deleted(&path, now).unwrap();

        // Still present inside the grace period
        engine.sweep_deleted(now - Duration::seconds(60)).unwrap();
        assert!(engine.baseline(&path).unwrap().is_some());

        // Swept once the cutoff passes the deletion time
        let n = engine.sweep_deleted(now + Duration::seconds(1)).unwrap();
        assert_eq!(n, 1);
        assert!(engine.baseline(&path).unwrap().is_none());
    }

    #[test]
    fn test_recreated_file_clears_deletion_mark() {
        let engine = EntropyEngine::in_memory(1024).unwrap();
        let path = PathBuf::from("/home/u/doc.txt");
        let now = Utc::now();

        engine.update_baseline(&path, 4.5, now).unwrap();
        engine.mark_deleted(&path, now).unwrap();
        engine.update_baseline(&path, 5.0, now).unwrap();

        // The re-created file must not be swept
        engine.sweep_deleted(now + Duration::seconds(1)).unwrap();
        assert!(engine.baseline(&path).unwrap().is_some());
    }
}
