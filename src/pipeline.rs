//! Pipeline wiring
//!
//! Fixed task topology over bounded channels:
//!
//! ```text
//!   watcher adapter -> [intake] -> store
//!                         |     -> vault workers (pre-modification copies)
//!                         v
//!                    [analyzer] -> [response] -> vault / process control
//!                                       ^
//!                  confirmations -------+
//! ```
//!
//! Intake-to-analyzer rides a broadcast ring: under overflow the oldest
//! events drop and the loss is counted. Analyzer-to-response is a bounded
//! mpsc whose sends wait - threat records are never shed. A watch channel
//! carries shutdown; every loop observes it and drains before exiting.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alert::{Alert, AlertBus, AlertType, Severity};
use crate::analyzer::{BehaviorAnalyzer, ProcessStatus};
use crate::config::Config;
use crate::entropy::EntropyEngine;
use crate::event::RawFileEvent;
use crate::intake::EventIntake;
use crate::response::ResponseEngine;
use crate::store::{EventStore, StoreError};
use crate::vault::{BackupReason, BackupVault};

const QUEUE_DEPTH: usize = 4096;
const VAULT_WORKERS: usize = 2;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Operator commands delivered through the dashboard's return channel.
#[derive(Debug, Clone, Copy)]
pub enum ResponseCommand {
    Confirm(u64),
    Deny(u64),
}

#[derive(Debug)]
enum VaultJob {
    Snapshot {
        path: std::path::PathBuf,
        pid: u32,
        process_name: String,
    },
}

/// Running pipeline.
pub struct PipelineHandle {
    pub bus: AlertBus,
    pub commands: mpsc::Sender<ResponseCommand>,
    pub status: watch::Receiver<Vec<ProcessStatus>>,
    pub store: Arc<EventStore>,
    pub vault: Arc<BackupVault>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Signal shutdown and wait for every task to drain, up to the grace
    /// period each.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("pipeline task did not drain within the grace period");
            }
        }
        info!("pipeline stopped");
    }
}

/// Build and start the full pipeline. `raw_rx` is the watcher adapter's
/// output channel.
pub fn spawn(
    config: Config,
    mut raw_rx: mpsc::Receiver<RawFileEvent>,
) -> anyhow::Result<PipelineHandle> {
    let entropy = Arc::new(EntropyEngine::open(
        &config.entropy.baseline_db_path,
        config.entropy.prefix_bytes,
        config.entropy.sample_spread,
    )?);
    let store = Arc::new(EventStore::open(&config.database.path)?);
    let vault = Arc::new(BackupVault::open(
        &config.backup.vault_path,
        config.backup.min_free_mb,
    )?);
    let bus = AlertBus::new();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, _) = broadcast::channel::<crate::event::FileEvent>(QUEUE_DEPTH);
    let (notice_tx, mut notice_rx) = mpsc::channel(QUEUE_DEPTH);
    let (jobs_tx, jobs_rx) = mpsc::channel::<VaultJob>(QUEUE_DEPTH);
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ResponseCommand>(64);
    let (status_tx, status_rx) = watch::channel(Vec::new());

    let mut tasks = Vec::new();

    // Subscribe before the intake task exists so no event can slip past
    let analyzer_events_rx = events_tx.subscribe();

    // Intake task
    {
        let mut intake = EventIntake::new(&config, entropy.clone());
        let store = store.clone();
        let bus = bus.clone();
        let events_tx = events_tx.clone();
        let jobs_tx = jobs_tx.clone();
        let mut shutdown = shutdown_rx.clone();
        let spike_threshold = config.entropy.delta_threshold;

        tasks.push(tokio::spawn(async move {
            let mut was_degraded = false;
            loop {
                let raw = tokio::select! {
                    maybe = raw_rx.recv() => match maybe {
                        Some(raw) => raw,
                        None => break,
                    },
                    _ = shutdown.changed() => {
                        while let Ok(raw) = raw_rx.try_recv() {
                            ingest_one(
                                raw, &mut intake, &store, &bus, &events_tx, &jobs_tx,
                                spike_threshold, &mut was_degraded,
                            );
                        }
                        break;
                    }
                };
                ingest_one(
                    raw, &mut intake, &store, &bus, &events_tx, &jobs_tx,
                    spike_threshold, &mut was_degraded,
                );
            }
            debug!("intake task stopped");
        }));
    }

    // Analyzer task: sole owner of the process windows
    {
        let mut analyzer = BehaviorAnalyzer::new(&config);
        let mut events_rx = analyzer_events_rx;
        let notice_tx = notice_tx.clone();
        let mut shutdown = shutdown_rx.clone();

        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            let mut dropped: u64 = 0;
            loop {
                tokio::select! {
                    result = events_rx.recv() => match result {
                        Ok(event) => {
                            if let Some(notice) = analyzer.observe(event) {
                                // Blocking send: threat records are never shed
                                if notice_tx.send(notice).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            dropped += n;
                            warn!(missed = n, total = dropped, "analyzer lagged, oldest events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        analyzer.prune_all(now);
                        analyzer.collect_stale(now);
                        let _ = status_tx.send(analyzer.snapshot());
                    }
                    _ = shutdown.changed() => {
                        while let Ok(event) = events_rx.try_recv() {
                            if let Some(notice) = analyzer.observe(event) {
                                let _ = notice_tx.send(notice).await;
                            }
                        }
                        break;
                    }
                }
            }
            debug!("analyzer task stopped");
        }));
    }

    // Response task
    {
        let mut engine = ResponseEngine::new(&config, vault.clone(), store.clone(), bus.clone());
        let mut shutdown = shutdown_rx.clone();
        // Keeps the command channel open for the task's lifetime
        let _cmd_keepalive = cmd_tx.clone();

        tasks.push(tokio::spawn(async move {
            let _cmd_keepalive = _cmd_keepalive;
            let mut expiry = tokio::time::interval(Duration::from_millis(250));
            loop {
                tokio::select! {
                    maybe = notice_rx.recv() => match maybe {
                        Some(notice) => engine.handle(notice),
                        None => break,
                    },
                    maybe = cmd_rx.recv() => {
                        if let Some(cmd) = maybe {
                            match cmd {
                                ResponseCommand::Confirm(id) => { engine.confirm(id); }
                                ResponseCommand::Deny(id) => { engine.deny(id); }
                            }
                        }
                    },
                    _ = expiry.tick() => {
                        engine.expire_pending(Utc::now());
                        engine.compact_pending(Utc::now());
                    }
                    _ = shutdown.changed() => {
                        while let Ok(notice) = notice_rx.try_recv() {
                            engine.handle(notice);
                        }
                        break;
                    }
                }
            }
            debug!("response task stopped");
        }));
    }

    // Vault workers: pre-modification copies off the hot path
    let jobs_rx = Arc::new(Mutex::new(jobs_rx));
    for worker in 0..VAULT_WORKERS {
        let jobs_rx = jobs_rx.clone();
        let vault = vault.clone();
        let mut shutdown = shutdown_rx.clone();

        tasks.push(tokio::spawn(async move {
            loop {
                let job = {
                    let mut rx = jobs_rx.lock().await;
                    tokio::select! {
                        job = rx.recv() => job,
                        _ = shutdown.changed() => {
                            while let Ok(job) = rx.try_recv() {
                                run_vault_job(&vault, job);
                            }
                            None
                        }
                    }
                };
                match job {
                    Some(job) => run_vault_job(&vault, job),
                    None => break,
                }
            }
            debug!(worker, "vault worker stopped");
        }));
    }

    // Housekeeping: hourly purge, baseline sweep, vacuum
    {
        let vault = vault.clone();
        let store = store.clone();
        let entropy = entropy.clone();
        let retention = chrono::Duration::hours(config.backup.retention_hours as i64);
        let baseline_grace = chrono::Duration::seconds(config.behavior.window_seconds as i64 * 2);
        let mut shutdown = shutdown_rx.clone();

        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = vault.purge_older_than(retention) {
                            warn!("vault purge failed: {e}");
                        }
                        match entropy.sweep_deleted(Utc::now() - baseline_grace) {
                            Ok(n) if n > 0 => debug!(swept = n, "stale baselines removed"),
                            Ok(_) => {}
                            Err(e) => warn!("baseline sweep failed: {e}"),
                        }
                        if let Err(e) = store.vacuum() {
                            warn!("event store vacuum failed: {e}");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("housekeeping task stopped");
        }));
    }

    Ok(PipelineHandle {
        bus,
        commands: cmd_tx,
        status: status_rx,
        store,
        vault,
        shutdown: shutdown_tx,
        tasks,
    })
}

/// Normalize one raw event, persist it, fan it out, and queue its
/// pre-modification copy.
#[allow(clippy::too_many_arguments)]
fn ingest_one(
    raw: RawFileEvent,
    intake: &mut EventIntake,
    store: &EventStore,
    bus: &AlertBus,
    events_tx: &broadcast::Sender<crate::event::FileEvent>,
    jobs_tx: &mpsc::Sender<VaultJob>,
    spike_threshold: f64,
    was_degraded: &mut bool,
) {
    let Some(mut event) = intake.process(raw) else {
        return;
    };

    match store.append_event(&event) {
        Ok(id) => event.id = id,
        Err(StoreError::StorageFull { free_mb }) => {
            if !*was_degraded {
                bus.publish(Alert::new(
                    AlertType::Event,
                    Severity::Warning,
                    serde_json::json!({
                        "reason": "storage_pressure",
                        "free_mb": free_mb,
                        "detail": "file events are being shed; detection continues",
                    }),
                ));
            }
            *was_degraded = true;
        }
        Err(e) => warn!("event append failed: {e}"),
    }
    if !store.is_degraded() {
        *was_degraded = false;
    }

    // Archive a last-known-good copy. A write whose entropy already spiked
    // is fresh ciphertext, not a good copy, so it is not admitted.
    if event.kind.is_content_change() {
        let looks_encrypted = event
            .entropy
            .map(|r| r.before.is_some() && r.delta >= spike_threshold)
            .unwrap_or(false);
        if !looks_encrypted {
            let job = VaultJob::Snapshot {
                path: event.effective_path().to_path_buf(),
                pid: event.pid,
                process_name: event.process_name.clone(),
            };
            if jobs_tx.try_send(job).is_err() {
                debug!("vault queue full, pre-modification copy skipped");
            }
        }
    }

    // Fan out; a send error only means no analyzer is listening (shutdown)
    let _ = events_tx.send(event);
}

fn run_vault_job(vault: &BackupVault, job: VaultJob) {
    match job {
        VaultJob::Snapshot {
            path,
            pid,
            process_name,
        } => {
            match vault.snapshot(
                &path,
                BackupReason::PreModification,
                Some(pid),
                Some(&process_name),
            ) {
                Ok(_) => {}
                Err(crate::vault::VaultError::NotAFile(_)) => {}
                Err(crate::vault::VaultError::DiskPressure { .. }) => {}
                Err(e) => debug!(path = %path.display(), "pre-modification copy failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::store::ThreatFilter;
    use std::path::PathBuf;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.monitor.exclude_directories = Vec::new();
        config.entropy.baseline_db_path = dir.path().join("baselines.db");
        config.database.path = dir.path().join("events.db");
        config.backup.vault_path = dir.path().join("vault");
        config.backup.min_free_mb = 0;
        config
    }

    fn raw(kind: EventKind, path: &PathBuf, pid: u32, name: &str) -> RawFileEvent {
        RawFileEvent {
            kind,
            path: path.clone(),
            dest_path: None,
            pid: Some(pid),
            process_name: Some(name.to_string()),
            process_exe: Some(PathBuf::from("/tmp/evil")),
            size_before: None,
            size_after: None,
            timestamp: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_end_to_end_encryption_burst() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let (raw_tx, raw_rx) = mpsc::channel(1024);
        let handle = spawn(config, raw_rx).unwrap();

        // The offender is a real process we are allowed to kill
        let mut child = std::process::Command::new("sleep")
            .arg("60")
            .spawn()
            .unwrap();
        let pid = child.id();

        // Phase 1: 25 ordinary text files appear
        let mut files = Vec::new();
        for i in 0..25 {
            let f = dir.path().join(format!("doc{i}.txt"));
            std::fs::write(&f, format!("ordinary document number {i}, plain prose"))
                .unwrap();
            raw_tx
                .send(raw(EventKind::Created, &f, pid, "evil"))
                .await
                .unwrap();
            files.push(f);
        }

        // Let the vault workers archive the originals
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Phase 2: every file is rewritten with ciphertext, and the watcher
        // reports renames onto a ransomware suffix
        for (i, f) in files.iter().enumerate() {
            let noise: Vec<u8> = (0..2048u64)
                .map(|j| ((j * 31 + i as u64 * 7) % 256) as u8)
                .collect();
            std::fs::write(f, noise).unwrap();
            raw_tx
                .send(raw(EventKind::Modified, f, pid, "evil"))
                .await
                .unwrap();

            let mut mv = raw(EventKind::Moved, f, pid, "evil");
            mv.dest_path = Some(PathBuf::from(format!("{}.encrypted", f.display())));
            raw_tx.send(mv).await.unwrap();
        }

        // Wait for the response to land
        let mut terminated_record = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let threats = handle
                .store
                .query_threats(&ThreatFilter::default())
                .unwrap();
            if let Some(t) = threats.iter().find(|t| t.escalation == 4) {
                terminated_record = Some(t.clone());
                break;
            }
        }
        let record = terminated_record.expect("escalation 4 must be reached");
        assert!(record.score >= 80);
        assert!(record.incident_report.is_some());

        // Rollback restored the original prose at the original paths
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut restored = 0;
        for (i, f) in files.iter().enumerate() {
            if let Ok(content) = std::fs::read_to_string(f) {
                if content.contains(&format!("ordinary document number {i}")) {
                    restored += 1;
                }
            }
        }
        assert!(restored >= 23, "only {restored}/25 files restored");

        // The offender is gone (killed, not merely suspended)
        let _ = child.kill();
        let _ = child.wait();

        handle.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_benign_process_stays_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.response.process_whitelist = vec!["7z".to_string()];

        let (raw_tx, raw_rx) = mpsc::channel(1024);
        let handle = spawn(config, raw_rx).unwrap();

        // A whitelisted archiver writing many compressed files
        for i in 0..50 {
            let f = dir.path().join(format!("part{i}.7z"));
            let compressed: Vec<u8> = (0..2048u64)
                .map(|j| ((j * 131 + i as u64 * 17) % 256) as u8)
                .collect();
            std::fs::write(&f, compressed).unwrap();
            raw_tx
                .send(raw(EventKind::Created, &f, 999_999, "7z"))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(700)).await;
        let threats = handle.store.query_threats(&ThreatFilter::default()).unwrap();
        assert!(
            threats.iter().all(|t| t.escalation == 0),
            "whitelisted process must not escalate"
        );

        handle.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_drains_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let (raw_tx, raw_rx) = mpsc::channel(1024);
        let handle = spawn(config, raw_rx).unwrap();

        let f = dir.path().join("doc.txt");
        std::fs::write(&f, b"content").unwrap();
        raw_tx
            .send(raw(EventKind::Created, &f, 1, "writer"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.shutdown().await;
    }
}
