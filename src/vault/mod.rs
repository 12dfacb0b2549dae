//! Copy-on-write backup vault
//!
//! Stores point-in-time copies of files in timestamped snapshot
//! directories with flattened filenames, an index database, and one
//! `manifest.json` per snapshot directory:
//!
//! ```text
//! vault/
//! +-- 2025-02-01_14-30-00-0001/
//! |   +-- home_u_Documents_report.docx
//! |   +-- manifest.json
//! +-- 2025-02-01_14-31-15-0002/
//! |   +-- ...
//! +-- index.db
//! ```
//!
//! The vault root is owner-only (0700). Every stored file carries a
//! SHA-256 recorded at snapshot time; restores re-hash and report
//! mismatches rather than refusing, so a corrupted backup is still
//! recoverable content with a warning attached.

mod index;

pub use index::ListFilter;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::sys;
use index::VaultIndex;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("disk pressure: {free_mb} MB free is below the snapshot floor")]
    DiskPressure { free_mb: u64 },
    #[error("backup entry {id} not found")]
    NotFound { id: i64 },
    #[error("source is not a regular file: {0}")]
    NotAFile(PathBuf),
    #[error("vault index error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VaultError>;

/// Why a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupReason {
    /// Routine copy taken when a watched file changed
    PreModification,
    /// Taken by the response engine during escalation
    Emergency,
    /// Operator-requested via the CLI
    Manual,
    /// Periodic housekeeping snapshot
    Scheduled,
}

impl BackupReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupReason::PreModification => "pre_modification",
            BackupReason::Emergency => "emergency",
            BackupReason::Manual => "manual",
            BackupReason::Scheduled => "scheduled",
        }
    }
}

impl std::str::FromStr for BackupReason {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pre_modification" => Ok(BackupReason::PreModification),
            "emergency" => Ok(BackupReason::Emergency),
            "manual" => Ok(BackupReason::Manual),
            "scheduled" => Ok(BackupReason::Scheduled),
            other => Err(format!("unknown backup reason: {other}")),
        }
    }
}

/// One stored version of one original path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEntry {
    pub id: i64,
    pub original_path: PathBuf,
    /// Path of the stored bytes, relative to the vault root.
    pub vault_relative: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub sha256: String,
    pub size: u64,
    pub reason: BackupReason,
    pub pid: Option<u32>,
    pub process_name: Option<String>,
}

/// Outcome of restoring one entry. `success` tracks the write alone;
/// `integrity_ok` reports whether the stored bytes still matched their
/// recorded hash, so callers can surface corruption without losing data.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreResult {
    pub entry_id: i64,
    pub original_path: PathBuf,
    pub success: bool,
    pub integrity_ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Record format inside each snapshot directory's manifest.json.
#[derive(Debug, Serialize, Deserialize)]
struct ManifestRecord {
    original_path: PathBuf,
    vault_relative: PathBuf,
    sha256: String,
    size: u64,
    timestamp: DateTime<Utc>,
    pid: Option<u32>,
    process_name: Option<String>,
    reason: String,
}

/// Streaming SHA-256 of a file.
pub fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Convert an absolute path to a flat filename safe inside a snapshot dir.
///
/// `/home/u/Documents/report.docx` -> `home_u_Documents_report.docx`
pub fn flatten_path(original: &Path) -> String {
    original
        .to_string_lossy()
        .trim_start_matches('/')
        .replace('/', "_")
}

/// Timestamped, integrity-checked backup storage.
pub struct BackupVault {
    root: PathBuf,
    index: VaultIndex,
    /// Vault-wide writer/reader discipline: snapshot and purge take the
    /// write side, list/restore/verify the read side.
    ops: RwLock<()>,
    min_free_bytes: u64,
    uniq: AtomicU64,
}

impl BackupVault {
    /// Open (or create) a vault rooted at `root`.
    pub fn open(root: &Path, min_free_mb: u64) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        restrict_permissions(root, 0o700);

        let index = VaultIndex::open(&root.join("index.db"))?;
        Ok(Self {
            root: root.to_path_buf(),
            index,
            ops: RwLock::new(()),
            min_free_bytes: min_free_mb * 1024 * 1024,
            uniq: AtomicU64::new(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy a file into the vault and record it.
    ///
    /// Refuses under disk pressure. When the newest stored version of the
    /// path already holds identical bytes, the new entry links to the
    /// existing copy instead of storing a duplicate.
    pub fn snapshot(
        &self,
        path: &Path,
        reason: BackupReason,
        pid: Option<u32>,
        process_name: Option<&str>,
    ) -> Result<BackupEntry> {
        let _guard = self.ops.write().expect("vault lock poisoned");

        if !path.is_file() {
            return Err(VaultError::NotAFile(path.to_path_buf()));
        }

        let free = sys::free_space_bytes(&self.root)?;
        if free < self.min_free_bytes {
            warn!(
                free_mb = free / (1024 * 1024),
                path = %path.display(),
                "snapshot refused under disk pressure"
            );
            return Err(VaultError::DiskPressure {
                free_mb: free / (1024 * 1024),
            });
        }

        let now = Utc::now();
        let source_hash = file_sha256(path)?;
        let size = std::fs::metadata(path)?.len();

        // Content dedup: identical bytes already stored for this path
        let vault_relative = match self.index.newest_for_path(path)? {
            Some(prev)
                if prev.sha256 == source_hash && self.root.join(&prev.vault_relative).is_file() =>
            {
                debug!(path = %path.display(), "unchanged content, linking to stored copy");
                prev.vault_relative
            }
            _ => self.store_copy(path, now)?,
        };

        let mut entry = BackupEntry {
            id: 0,
            original_path: path.to_path_buf(),
            vault_relative,
            timestamp: now,
            sha256: source_hash,
            size,
            reason,
            pid,
            process_name: process_name.map(str::to_string),
        };
        entry.id = self.index.insert(&entry)?;

        self.append_manifest(&entry)?;

        info!(
            path = %path.display(),
            entry = entry.id,
            reason = reason.as_str(),
            "backed up"
        );
        Ok(entry)
    }

    /// Copy bytes into a fresh snapshot directory; returns the
    /// vault-relative path of the stored file.
    fn store_copy(&self, path: &Path, now: DateTime<Utc>) -> Result<PathBuf> {
        let seq = self.uniq.fetch_add(1, Ordering::Relaxed);
        let dir_name = format!("{}-{seq:04}", now.format("%Y-%m-%d_%H-%M-%S"));
        let snapshot_dir = self.root.join(&dir_name);
        std::fs::create_dir_all(&snapshot_dir)?;
        restrict_permissions(&snapshot_dir, 0o700);

        let dest = snapshot_dir.join(flatten_path(path));
        std::fs::copy(path, &dest)?;
        restrict_permissions(&dest, 0o600);

        Ok(PathBuf::from(dir_name).join(flatten_path(path)))
    }

    /// Append a record to the snapshot directory's manifest.
    fn append_manifest(&self, entry: &BackupEntry) -> Result<()> {
        let dir = match entry.vault_relative.parent() {
            Some(d) => self.root.join(d),
            None => return Ok(()),
        };
        let manifest_path = dir.join("manifest.json");

        let mut records: Vec<ManifestRecord> = if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)?;
            serde_json::from_str(&content).unwrap_or_default()
        } else {
            Vec::new()
        };

        records.push(ManifestRecord {
            original_path: entry.original_path.clone(),
            vault_relative: entry.vault_relative.clone(),
            sha256: entry.sha256.clone(),
            size: entry.size,
            timestamp: entry.timestamp,
            pid: entry.pid,
            process_name: entry.process_name.clone(),
            reason: entry.reason.as_str().to_string(),
        });

        let content = serde_json::to_string_pretty(&records)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&manifest_path, content)?;
        restrict_permissions(&manifest_path, 0o600);
        Ok(())
    }

    /// List backup entries, newest first.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<BackupEntry>> {
        let _guard = self.ops.read().expect("vault lock poisoned");
        self.index.list(filter)
    }

    /// Look up one entry by id.
    pub fn get(&self, entry_id: i64) -> Result<BackupEntry> {
        let _guard = self.ops.read().expect("vault lock poisoned");
        self.index.get(entry_id)?.ok_or(VaultError::not_found(entry_id))
    }

    /// Restore one entry to its original path.
    pub fn restore(&self, entry_id: i64) -> Result<RestoreResult> {
        let _guard = self.ops.read().expect("vault lock poisoned");
        let entry = self.index.get(entry_id)?.ok_or(VaultError::not_found(entry_id))?;
        Ok(self.restore_entry(&entry))
    }

    /// Restore the newest version per path backed up against a process.
    pub fn restore_by_process(&self, process_name: &str) -> Result<Vec<RestoreResult>> {
        let _guard = self.ops.read().expect("vault lock poisoned");
        let newest = self.index.newest_per_path(&ListFilter {
            process: Some(process_name.to_string()),
            ..Default::default()
        })?;
        Ok(newest.iter().map(|e| self.restore_entry(e)).collect())
    }

    /// Restore the newest version per path among entries since `since`.
    pub fn restore_all_since(&self, since: DateTime<Utc>) -> Result<Vec<RestoreResult>> {
        let _guard = self.ops.read().expect("vault lock poisoned");
        let newest = self.index.newest_per_path(&ListFilter {
            since: Some(since),
            ..Default::default()
        })?;
        Ok(newest.iter().map(|e| self.restore_entry(e)).collect())
    }

    /// Rollback helper: newest good copy per path recorded against one PID
    /// inside `[since, until]`. Emergency copies are excluded - they
    /// preserve the incident's end state for forensics and are not
    /// restoration sources - and the upper bound keeps anything captured
    /// after detection out of the selection.
    pub fn restore_for_pid_window(
        &self,
        pid: u32,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<RestoreResult>> {
        let _guard = self.ops.read().expect("vault lock poisoned");
        let newest = self.index.newest_per_path(&ListFilter {
            pid: Some(pid),
            since: Some(since),
            until: Some(until),
            exclude_reason: Some(BackupReason::Emergency),
            ..Default::default()
        })?;
        Ok(newest.iter().map(|e| self.restore_entry(e)).collect())
    }

    /// Re-hash a stored file against its recorded digest without restoring.
    pub fn verify(&self, entry_id: i64) -> Result<bool> {
        let _guard = self.ops.read().expect("vault lock poisoned");
        let entry = self.index.get(entry_id)?.ok_or(VaultError::not_found(entry_id))?;
        let stored = self.root.join(&entry.vault_relative);
        Ok(file_sha256(&stored)? == entry.sha256)
    }

    fn restore_entry(&self, entry: &BackupEntry) -> RestoreResult {
        let stored = self.root.join(&entry.vault_relative);

        if !stored.is_file() {
            return RestoreResult {
                entry_id: entry.id,
                original_path: entry.original_path.clone(),
                success: false,
                integrity_ok: None,
                error: Some("stored file missing from vault".to_string()),
            };
        }

        // The restore proceeds even on a hash mismatch; corrupted content
        // with a warning beats no content at all.
        let integrity_ok = file_sha256(&stored).ok().map(|h| h == entry.sha256);
        if integrity_ok == Some(false) {
            warn!(
                entry = entry.id,
                path = %entry.original_path.display(),
                "stored bytes no longer match recorded hash"
            );
        }

        let write = || -> std::io::Result<()> {
            if let Some(parent) = entry.original_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&stored, &entry.original_path)?;
            Ok(())
        };

        match write() {
            Ok(()) => {
                info!(
                    entry = entry.id,
                    path = %entry.original_path.display(),
                    integrity_ok = ?integrity_ok,
                    "restored"
                );
                RestoreResult {
                    entry_id: entry.id,
                    original_path: entry.original_path.clone(),
                    success: true,
                    integrity_ok,
                    error: None,
                }
            }
            Err(e) => RestoreResult {
                entry_id: entry.id,
                original_path: entry.original_path.clone(),
                success: false,
                integrity_ok,
                error: Some(e.to_string()),
            },
        }
    }

    /// Purge entries older than `max_age`. An entry survives when it is
    /// still the newest stored version of a path that currently exists
    /// with different content - deleting it would destroy the only way
    /// back.
    pub fn purge_older_than(&self, max_age: Duration) -> Result<usize> {
        self.purge_before(Utc::now() - max_age)
    }

    /// Purge entries recorded strictly before `cutoff`.
    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _guard = self.ops.write().expect("vault lock poisoned");

        let candidates = self.index.older_than(cutoff)?;
        let mut removed = 0usize;
        let mut touched_dirs: HashSet<PathBuf> = HashSet::new();

        for entry in candidates {
            if self.is_last_line_of_defense(&entry)? {
                debug!(
                    entry = entry.id,
                    path = %entry.original_path.display(),
                    "purge skipped: newest version of a changed file"
                );
                continue;
            }

            self.index.delete(entry.id)?;
            removed += 1;

            // Drop the stored bytes once nothing references them
            if self.index.reference_count(&entry.vault_relative)? == 0 {
                let stored = self.root.join(&entry.vault_relative);
                if let Err(e) = std::fs::remove_file(&stored) {
                    debug!(path = %stored.display(), "stored file already gone: {e}");
                }
                if let Some(dir) = stored.parent() {
                    touched_dirs.insert(dir.to_path_buf());
                }
            }
        }

        for dir in touched_dirs {
            remove_dir_if_spent(&dir);
        }

        if removed > 0 {
            info!(removed, "vault retention purge complete");
        }
        Ok(removed)
    }

    /// True when the entry is the newest stored version of a path that
    /// still exists on disk with content differing from the backup.
    fn is_last_line_of_defense(&self, entry: &BackupEntry) -> Result<bool> {
        let newest = match self.index.newest_for_path(&entry.original_path)? {
            Some(n) => n,
            None => return Ok(false),
        };
        if newest.id != entry.id {
            return Ok(false);
        }
        if !entry.original_path.is_file() {
            return Ok(false);
        }
        match file_sha256(&entry.original_path) {
            Ok(current) => Ok(current != entry.sha256),
            // Unreadable original: keep the backup
            Err(_) => Ok(true),
        }
    }
}

/// Best-effort permission tightening; failure is logged and ignored so the
/// vault still works on filesystems without POSIX modes.
fn restrict_permissions(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
            debug!(path = %path.display(), "could not set permissions: {e}");
        }
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
}

/// Remove a snapshot directory that holds nothing but its manifest.
fn remove_dir_if_spent(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let names: Vec<String> = entries
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    if names.is_empty() || names == ["manifest.json"] {
        let _ = std::fs::remove_dir_all(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault_in(dir: &tempfile::TempDir) -> BackupVault {
        BackupVault::open(&dir.path().join("vault"), 0).unwrap()
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault_in(&dir);
        let source = write_file(&dir, "doc.txt", b"original content");

        let entry = vault
            .snapshot(&source, BackupReason::Emergency, Some(7), Some("evil"))
            .unwrap();
        assert_eq!(entry.size, 16);

        // Simulate encryption of the original
        std::fs::write(&source, b"ENCRYPTED!!!").unwrap();

        let result = vault.restore(entry.id).unwrap();
        assert!(result.success);
        assert_eq!(result.integrity_ok, Some(true));
        assert_eq!(std::fs::read(&source).unwrap(), b"original content");

        // Stored hash matches a fresh hash of the restored file
        assert_eq!(file_sha256(&source).unwrap(), entry.sha256);
    }

    #[test]
    fn test_snapshot_dedup_links_unchanged_content() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault_in(&dir);
        let source = write_file(&dir, "doc.txt", b"stable bytes");

        let first = vault
            .snapshot(&source, BackupReason::PreModification, None, None)
            .unwrap();
        let second = vault
            .snapshot(&source, BackupReason::PreModification, None, None)
            .unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(first.vault_relative, second.vault_relative);
        assert_eq!(first.sha256, second.sha256);
    }

    #[test]
    fn test_snapshot_refused_under_disk_pressure() {
        let dir = tempfile::tempdir().unwrap();
        // Floor no filesystem can satisfy
        let vault = BackupVault::open(&dir.path().join("vault"), u64::MAX / (1024 * 1024)).unwrap();
        let source = write_file(&dir, "doc.txt", b"content");

        let err = vault
            .snapshot(&source, BackupReason::Emergency, None, None)
            .unwrap_err();
        assert!(matches!(err, VaultError::DiskPressure { .. }));
    }

    #[test]
    fn test_restore_flags_integrity_mismatch_but_still_writes() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault_in(&dir);
        let source = write_file(&dir, "doc.txt", b"good content");

        let entry = vault
            .snapshot(&source, BackupReason::Emergency, None, None)
            .unwrap();

        // Corrupt the stored copy
        let stored = vault.root().join(&entry.vault_relative);
        std::fs::set_permissions(
            &stored,
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::Permissions::from_mode(0o600)
            },
        )
        .unwrap();
        std::fs::write(&stored, b"tampered bytes").unwrap();

        let result = vault.restore(entry.id).unwrap();
        assert!(result.success);
        assert_eq!(result.integrity_ok, Some(false));
        assert_eq!(std::fs::read(&source).unwrap(), b"tampered bytes");

        assert!(!vault.verify(entry.id).unwrap());
    }

    #[test]
    fn test_restore_by_process_picks_newest_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault_in(&dir);
        let source = write_file(&dir, "doc.txt", b"version one");

        vault
            .snapshot(&source, BackupReason::Emergency, Some(7), Some("evil"))
            .unwrap();
        std::fs::write(&source, b"version two").unwrap();
        vault
            .snapshot(&source, BackupReason::Emergency, Some(7), Some("evil"))
            .unwrap();

        std::fs::write(&source, b"ENCRYPTED").unwrap();

        let results = vault.restore_by_process("evil").unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(std::fs::read(&source).unwrap(), b"version two");
    }

    #[test]
    fn test_purge_respects_last_line_of_defense() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault_in(&dir);

        let changed = write_file(&dir, "changed.txt", b"before");
        let stable = write_file(&dir, "stable.txt", b"same");

        let changed_entry = vault
            .snapshot(&changed, BackupReason::PreModification, None, None)
            .unwrap();
        let stable_entry = vault
            .snapshot(&stable, BackupReason::PreModification, None, None)
            .unwrap();

        // The changed file now differs from its only backup
        std::fs::write(&changed, b"after").unwrap();

        let removed = vault.purge_before(Utc::now() + Duration::seconds(1)).unwrap();
        assert_eq!(removed, 1);

        // The changed file's entry survived; the stable one is gone
        assert!(vault.get(changed_entry.id).is_ok());
        assert!(matches!(
            vault.get(stable_entry.id),
            Err(VaultError::NotFound { .. })
        ));

        // And the survivor is still restorable
        let result = vault.restore(changed_entry.id).unwrap();
        assert!(result.success);
        assert_eq!(std::fs::read(&changed).unwrap(), b"before");
    }

    #[test]
    fn test_purge_keeps_shared_content_referenced_by_live_entries() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault_in(&dir);
        let source = write_file(&dir, "doc.txt", b"stable bytes");

        // Two entries sharing one stored copy; only the first is old
        let first = vault
            .snapshot(&source, BackupReason::PreModification, None, None)
            .unwrap();
        let cutoff = Utc::now() + Duration::seconds(1);
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let second = vault
            .snapshot(&source, BackupReason::PreModification, None, None)
            .unwrap();
        assert_eq!(first.vault_relative, second.vault_relative);

        vault.purge_before(cutoff).unwrap();

        // Second entry still restores from the shared copy
        std::fs::write(&source, b"gone").unwrap();
        let result = vault.restore(second.id).unwrap();
        assert!(result.success);
        assert_eq!(result.integrity_ok, Some(true));
    }

    #[test]
    fn test_list_filters() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault_in(&dir);
        let a = write_file(&dir, "a.txt", b"aaa");
        let b = write_file(&dir, "b.txt", b"bbb");

        vault
            .snapshot(&a, BackupReason::Emergency, Some(1), Some("one"))
            .unwrap();
        vault
            .snapshot(&b, BackupReason::Manual, Some(2), Some("two"))
            .unwrap();

        let all = vault.list(&ListFilter::default()).unwrap();
        assert_eq!(all.len(), 2);

        let by_process = vault
            .list(&ListFilter {
                process: Some("one".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_process.len(), 1);
        assert_eq!(by_process[0].original_path, a);

        let by_path = vault
            .list(&ListFilter {
                path: Some(b.clone()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_path.len(), 1);
        assert_eq!(by_path[0].reason, BackupReason::Manual);
    }

    #[test]
    fn test_flatten_path() {
        assert_eq!(
            flatten_path(Path::new("/home/u/Documents/report.docx")),
            "home_u_Documents_report.docx"
        );
        assert_eq!(flatten_path(Path::new("/etc/passwd")), "etc_passwd");
    }

    #[cfg(unix)]
    #[test]
    fn test_vault_root_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let vault = vault_in(&dir);
        let mode = std::fs::metadata(vault.root()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
