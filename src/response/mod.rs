//! Automated threat response
//!
//! A per-PID escalation state machine driven by incoming threat records:
//!
//! ```text
//!     Level 1 (31-50):  monitor   - verbose logging, info alert
//!     Level 2 (51-70):  warn      - emergency backups, process tree, warning alert
//!     Level 3 (71-85):  quarantine - suspend, critical alert
//!     Level 4 (86-100): terminate  - kill, deny exec, rollback, incident report
//! ```
//!
//! The machine never regresses within a PID's lifetime. In safe mode the
//! destructive steps (suspend, terminate, rollback) are parked as pending
//! actions that a human confirms or denies through the alert bus's return
//! channel; expiry counts as denial and is swept by a timer tick, never by
//! sleeping inside a handler.

pub mod process;

pub use process::{ControlOutcome, ProcessController, ProcessNode};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::alert::{Alert, AlertBus, AlertType, Severity};
use crate::analyzer::{ActionRecord, ThreatNotice, ThreatRecord};
use crate::config::Config;
use crate::store::EventStore;
use crate::vault::{BackupReason, BackupVault, RestoreResult, VaultError};

/// Response posture for one PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseState {
    Idle,
    Monitoring,
    Warned,
    Quarantined,
    Terminated,
}

impl ResponseState {
    pub fn level(self) -> u8 {
        match self {
            ResponseState::Idle => 0,
            ResponseState::Monitoring => 1,
            ResponseState::Warned => 2,
            ResponseState::Quarantined => 3,
            ResponseState::Terminated => 4,
        }
    }

    fn for_level(level: u8) -> Self {
        match level {
            0 => ResponseState::Idle,
            1 => ResponseState::Monitoring,
            2 => ResponseState::Warned,
            3 => ResponseState::Quarantined,
            _ => ResponseState::Terminated,
        }
    }
}

/// Destructive step awaiting confirmation in safe mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposedAction {
    Suspend,
    Terminate,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Pending,
    Confirmed,
    Denied,
    Expired,
}

/// One safe-mode confirmation request.
#[derive(Debug, Clone, Serialize)]
pub struct PendingAction {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub threat_id: i64,
    pub action: ProposedAction,
    pub pid: u32,
    pub process_name: String,
    pub expires_at: DateTime<Utc>,
    pub status: PendingStatus,
    /// Rollback needs the pre-incident cutoff captured at queue time.
    #[serde(skip)]
    rollback_until: Option<DateTime<Utc>>,
}

/// Orchestrates backups, process control, and alerts per threat record.
pub struct ResponseEngine {
    vault: Arc<BackupVault>,
    store: Arc<EventStore>,
    controller: ProcessController,
    bus: AlertBus,
    safe_mode: bool,
    window: Duration,
    confirmation_timeout: Duration,
    states: HashMap<u32, ResponseState>,
    /// Paths already emergency-backed per PID, so L3 does not repeat L2's work.
    backed_up: HashMap<u32, HashSet<PathBuf>>,
    /// PIDs promoted to verbose logging at L1.
    verbose_pids: HashSet<u32>,
    pending: Vec<PendingAction>,
    next_pending_id: u64,
}

impl ResponseEngine {
    pub fn new(
        config: &Config,
        vault: Arc<BackupVault>,
        store: Arc<EventStore>,
        bus: AlertBus,
    ) -> Self {
        Self {
            vault,
            store,
            controller: ProcessController::new(),
            bus,
            safe_mode: config.response.safe_mode,
            window: Duration::seconds(config.behavior.window_seconds as i64),
            confirmation_timeout: Duration::minutes(
                config.response.confirmation_timeout_minutes as i64,
            ),
            states: HashMap::new(),
            backed_up: HashMap::new(),
            verbose_pids: HashSet::new(),
            pending: Vec::new(),
            next_pending_id: 1,
        }
    }

    /// Current posture for a PID.
    pub fn state(&self, pid: u32) -> ResponseState {
        self.states.get(&pid).copied().unwrap_or(ResponseState::Idle)
    }

    /// Pending safe-mode actions (all statuses).
    pub fn pending_actions(&self) -> &[PendingAction] {
        &self.pending
    }

    pub fn controller(&self) -> &ProcessController {
        &self.controller
    }

    /// Whether level 1 raised this PID's logging verbosity.
    pub fn is_verbose(&self, pid: u32) -> bool {
        self.verbose_pids.contains(&pid)
    }

    /// Drive the state machine with one threat notice. The record is
    /// persisted with everything that happened appended to it.
    pub fn handle(&mut self, notice: ThreatNotice) {
        let mut record = notice.record;
        let pid = record.pid;
        let target = record.escalation.min(4);
        let current = self.state(pid).level();

        if target <= current {
            // Same-level re-report: persist for the audit trail, no new actions
            self.persist(&record);
            return;
        }

        let mut restores: Vec<RestoreResult> = Vec::new();
        for level in (current + 1)..=target {
            match level {
                1 => self.run_monitor(&mut record),
                2 => self.run_warn(&mut record, &notice.touched_paths),
                3 => self.run_quarantine(&mut record, &notice.touched_paths),
                4 => restores = self.run_terminate(&mut record),
                _ => unreachable!(),
            }
        }
        self.states.insert(pid, ResponseState::for_level(target));

        if target >= 4 {
            record.incident_report = Some(self.incident_report(&record, &notice.window, &restores));
        }

        self.persist(&record);
    }

    /// Level 1: watch closely, tell the operator, touch nothing.
    fn run_monitor(&mut self, record: &mut ThreatRecord) {
        self.verbose_pids.insert(record.pid);
        record
            .actions_taken
            .push(ActionRecord::ok("verbose_logging_enabled"));

        self.bus.publish(Alert::new(
            AlertType::Threat,
            Severity::Info,
            serde_json::json!({
                "pid": record.pid,
                "process": record.process_name,
                "score": record.score,
                "escalation": record.escalation,
                "indicators": record.indicators.keys().collect::<Vec<_>>(),
            }),
        ));
    }

    /// Level 2: emergency backups of everything the process touched, plus
    /// its process tree for the record.
    fn run_warn(&mut self, record: &mut ThreatRecord, touched: &[PathBuf]) {
        self.emergency_backups(record, touched);

        let tree = process::process_tree(record.pid);
        if !tree.is_empty() {
            record.actions_taken.push(ActionRecord::with_detail(
                "process_tree_logged",
                serde_json::to_string(&tree).unwrap_or_default(),
            ));
        }

        self.bus.publish(Alert::new(
            AlertType::Threat,
            Severity::Warning,
            serde_json::json!({
                "pid": record.pid,
                "process": record.process_name,
                "score": record.score,
                "escalation": record.escalation,
                "backed_up": touched.len(),
            }),
        ));
    }

    /// Level 3: quarantine. Backups first (if L2 was skipped over), then
    /// suspension - queued instead when safe mode is on.
    fn run_quarantine(&mut self, record: &mut ThreatRecord, touched: &[PathBuf]) {
        self.emergency_backups(record, touched);

        if self.safe_mode {
            self.queue_pending(record, ProposedAction::Suspend);
            return;
        }

        let outcome = self.controller.suspend(record.pid);
        record.actions_taken.push(outcome_record(&outcome));

        self.bus.publish(Alert::new(
            AlertType::Quarantine,
            Severity::Critical,
            serde_json::json!({
                "pid": record.pid,
                "process": record.process_name,
                "score": record.score,
                "suspended": outcome.success,
            }),
        ));
    }

    /// Level 4: terminate, deny the executable, roll back. Returns the
    /// restore results for the incident report.
    fn run_terminate(&mut self, record: &mut ThreatRecord) -> Vec<RestoreResult> {
        if self.safe_mode {
            self.queue_pending(record, ProposedAction::Terminate);
            self.queue_pending(record, ProposedAction::Rollback);
            return Vec::new();
        }

        let outcome = self.controller.terminate(record.pid);
        record.actions_taken.push(outcome_record(&outcome));

        if let Some(exe) = record.process_exe.clone() {
            let blocked = self.controller.block_future_exec(&exe);
            record.actions_taken.push(ActionRecord {
                timestamp: Utc::now(),
                action: "block_future_exec".to_string(),
                success: blocked.success,
                detail: Some(exe.display().to_string()),
            });
        }

        let restores = self.rollback(record.pid, record.timestamp);
        let restored = restores.iter().filter(|r| r.success).count();
        record.actions_taken.push(ActionRecord::with_detail(
            "rollback",
            format!("{restored}/{} file(s) restored", restores.len()),
        ));

        self.bus.publish(Alert::new(
            AlertType::Quarantine,
            Severity::Critical,
            serde_json::json!({
                "pid": record.pid,
                "process": record.process_name,
                "score": record.score,
                "terminated": outcome.success,
                "restored": restored,
            }),
        ));

        restores
    }

    /// Best-effort restore of pre-incident content written by the offender
    /// within the last two windows.
    fn rollback(&self, pid: u32, detected_at: DateTime<Utc>) -> Vec<RestoreResult> {
        let since = Utc::now() - self.window * 2;
        let results = self
            .vault
            .restore_for_pid_window(pid, since, detected_at)
            .unwrap_or_else(|e| {
                warn!(pid, "rollback query failed: {e}");
                Vec::new()
            });

        for r in &results {
            self.bus.publish(Alert::new(
                AlertType::Restore,
                if r.integrity_ok == Some(false) {
                    Severity::Warning
                } else {
                    Severity::Info
                },
                serde_json::json!({
                    "entry_id": r.entry_id,
                    "path": r.original_path,
                    "success": r.success,
                    "integrity_ok": r.integrity_ok,
                }),
            ));
        }
        results
    }

    /// Snapshot every touched path not already captured for this PID.
    /// Disk pressure degrades to a warning; escalation continues.
    fn emergency_backups(&mut self, record: &mut ThreatRecord, touched: &[PathBuf]) {
        let done = self.backed_up.entry(record.pid).or_default();
        let mut stored = 0usize;
        let mut pressure = false;

        for path in touched {
            if done.contains(path) {
                continue;
            }
            match self.vault.snapshot(
                path,
                BackupReason::Emergency,
                Some(record.pid),
                Some(&record.process_name),
            ) {
                Ok(_) => {
                    done.insert(path.clone());
                    stored += 1;
                }
                Err(VaultError::DiskPressure { free_mb }) => {
                    if !pressure {
                        record.actions_taken.push(ActionRecord::failed(
                            "emergency_backup",
                            format!("disk pressure: {free_mb} MB free"),
                        ));
                        self.bus.publish(Alert::new(
                            AlertType::Threat,
                            Severity::Warning,
                            serde_json::json!({
                                "pid": record.pid,
                                "reason": "disk_pressure",
                                "free_mb": free_mb,
                            }),
                        ));
                    }
                    pressure = true;
                }
                Err(VaultError::NotAFile(_)) => {
                    // Deleted or renamed since the window snapshot; nothing to copy
                }
                Err(e) => {
                    warn!(path = %path.display(), "emergency backup failed: {e}");
                }
            }
        }

        if stored > 0 {
            record.actions_taken.push(ActionRecord::with_detail(
                "emergency_backup",
                format!("{stored} file(s) stored"),
            ));
        }
    }

    /// Park a destructive step for confirmation. At most one live request
    /// per (pid, action).
    fn queue_pending(&mut self, record: &mut ThreatRecord, action: ProposedAction) {
        let already = self.pending.iter().any(|p| {
            p.pid == record.pid && p.action == action && p.status == PendingStatus::Pending
        });
        if already {
            return;
        }

        let now = Utc::now();
        let pending = PendingAction {
            id: self.next_pending_id,
            created_at: now,
            threat_id: record.id,
            action,
            pid: record.pid,
            process_name: record.process_name.clone(),
            expires_at: now + self.confirmation_timeout,
            status: PendingStatus::Pending,
            rollback_until: matches!(action, ProposedAction::Rollback).then_some(record.timestamp),
        };
        self.next_pending_id += 1;

        record.actions_taken.push(ActionRecord::with_detail(
            "queued_for_confirmation",
            format!("{action:?} (request {})", pending.id),
        ));

        self.bus.publish(Alert::new(
            AlertType::PendingAction,
            Severity::Critical,
            serde_json::json!({
                "id": pending.id,
                "pid": pending.pid,
                "process": pending.process_name,
                "action": action,
                "expires_at": pending.expires_at,
                "score": record.score,
            }),
        ));

        info!(
            id = pending.id,
            pid = pending.pid,
            ?action,
            "safe mode: action queued for confirmation"
        );
        self.pending.push(pending);
    }

    /// Execute a confirmed pending action. Returns false for an unknown or
    /// already-settled id.
    pub fn confirm(&mut self, action_id: u64) -> bool {
        let Some(idx) = self
            .pending
            .iter()
            .position(|p| p.id == action_id && p.status == PendingStatus::Pending)
        else {
            return false;
        };

        self.pending[idx].status = PendingStatus::Confirmed;
        let pending = self.pending[idx].clone();
        info!(id = action_id, pid = pending.pid, action = ?pending.action, "pending action confirmed");

        match pending.action {
            ProposedAction::Suspend => {
                let outcome = self.controller.suspend(pending.pid);
                self.bus.publish(Alert::new(
                    AlertType::Quarantine,
                    Severity::Critical,
                    serde_json::json!({
                        "pid": pending.pid,
                        "process": pending.process_name,
                        "suspended": outcome.success,
                        "confirmed": pending.id,
                    }),
                ));
            }
            ProposedAction::Terminate => {
                let outcome = self.controller.terminate(pending.pid);
                self.bus.publish(Alert::new(
                    AlertType::Quarantine,
                    Severity::Critical,
                    serde_json::json!({
                        "pid": pending.pid,
                        "process": pending.process_name,
                        "terminated": outcome.success,
                        "confirmed": pending.id,
                    }),
                ));
            }
            ProposedAction::Rollback => {
                let until = pending.rollback_until.unwrap_or_else(Utc::now);
                let results = self.rollback(pending.pid, until);
                let restored = results.iter().filter(|r| r.success).count();
                info!(pid = pending.pid, restored, "confirmed rollback complete");
            }
        }
        true
    }

    /// Deny a pending action.
    pub fn deny(&mut self, action_id: u64) -> bool {
        let Some(p) = self
            .pending
            .iter_mut()
            .find(|p| p.id == action_id && p.status == PendingStatus::Pending)
        else {
            return false;
        };
        p.status = PendingStatus::Denied;
        info!(id = action_id, pid = p.pid, action = ?p.action, "pending action denied");
        true
    }

    /// Timer tick: expire overdue pending actions. Expiry is a denial.
    pub fn expire_pending(&mut self, now: DateTime<Utc>) -> usize {
        let mut expired = 0usize;
        for p in &mut self.pending {
            if p.status == PendingStatus::Pending && now >= p.expires_at {
                p.status = PendingStatus::Expired;
                expired += 1;
                warn!(id = p.id, pid = p.pid, action = ?p.action, "pending action expired unconfirmed");
                self.bus.publish(Alert::new(
                    AlertType::PendingAction,
                    Severity::Warning,
                    serde_json::json!({
                        "id": p.id,
                        "pid": p.pid,
                        "action": p.action,
                        "status": "expired",
                    }),
                ));
            }
        }
        expired
    }

    /// Drop settled pending actions older than a day to bound the list.
    pub fn compact_pending(&mut self, now: DateTime<Utc>) {
        self.pending.retain(|p| {
            p.status == PendingStatus::Pending || now - p.created_at < Duration::days(1)
        });
    }

    fn incident_report(
        &self,
        record: &ThreatRecord,
        window: &crate::analyzer::WindowSummary,
        restores: &[RestoreResult],
    ) -> serde_json::Value {
        serde_json::json!({
            "generated_at": Utc::now(),
            "threat": {
                "pid": record.pid,
                "process": record.process_name,
                "process_exe": record.process_exe,
                "score": record.score,
                "level": record.level,
                "escalation": record.escalation,
                "indicators": record.indicators,
                "detected_at": record.timestamp,
            },
            "window": window,
            "actions": record.actions_taken,
            "restores": restores,
            "blocked_executables": self.controller.blocked_executables(),
        })
    }

    fn persist(&self, record: &ThreatRecord) {
        if let Err(e) = self.store.append_threat(record) {
            warn!(pid = record.pid, "failed to persist threat record: {e}");
        }
    }
}

fn outcome_record(outcome: &ControlOutcome) -> ActionRecord {
    ActionRecord {
        timestamp: Utc::now(),
        action: outcome.action.to_string(),
        success: outcome.success,
        detail: outcome.reason.clone(),
    }
}
