//! Process control (suspend / resume / terminate / deny-exec)
//!
//! Signals do the heavy lifting: SIGSTOP freezes a process faster than any
//! kill, keeping its memory intact for forensics, SIGCONT resumes it, and
//! SIGKILL ends it. Failures are reported, never propagated - the response
//! engine records them and moves on.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::event::ProcessIdentity;

/// Outcome of one control operation.
#[derive(Debug, Clone)]
pub struct ControlOutcome {
    pub action: &'static str,
    pub pid: u32,
    pub success: bool,
    pub reason: Option<String>,
}

impl ControlOutcome {
    fn ok(action: &'static str, pid: u32) -> Self {
        Self {
            action,
            pid,
            success: true,
            reason: None,
        }
    }

    fn failed(action: &'static str, pid: u32, reason: String) -> Self {
        Self {
            action,
            pid,
            success: false,
            reason: Some(reason),
        }
    }
}

/// One node of a process tree listing.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessNode {
    pub pid: u32,
    pub name: String,
}

/// Manages suspension, termination, and the executable deny list.
#[derive(Default)]
pub struct ProcessController {
    /// Executables denied future execution.
    blocked: Mutex<HashSet<PathBuf>>,
    /// Serializes signal dispatch so suspend and terminate for the same
    /// PID cannot race each other.
    signal_lock: Mutex<()>,
}

impl ProcessController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Freeze a process with SIGSTOP.
    pub fn suspend(&self, pid: u32) -> ControlOutcome {
        self.send_signal("suspend", pid, Signal::SIGSTOP)
    }

    /// Resume a previously suspended process with SIGCONT.
    pub fn resume(&self, pid: u32) -> ControlOutcome {
        self.send_signal("resume", pid, Signal::SIGCONT)
    }

    /// Kill a process with SIGKILL.
    pub fn terminate(&self, pid: u32) -> ControlOutcome {
        self.send_signal("terminate", pid, Signal::SIGKILL)
    }

    fn send_signal(&self, action: &'static str, pid: u32, sig: Signal) -> ControlOutcome {
        let _serialized = self.signal_lock.lock().expect("signal lock poisoned");
        match signal::kill(Pid::from_raw(pid as i32), sig) {
            Ok(()) => {
                info!(pid, action, "signal delivered");
                ControlOutcome::ok(action, pid)
            }
            Err(errno) => {
                warn!(pid, action, "signal failed: {errno}");
                ControlOutcome::failed(action, pid, errno.desc().to_string())
            }
        }
    }

    /// Record an executable path on the deny list.
    pub fn block_future_exec(&self, exe: &Path) -> ControlOutcome {
        self.blocked
            .lock()
            .expect("blocklist poisoned")
            .insert(exe.to_path_buf());
        warn!(exe = %exe.display(), "executable denied future execution");
        ControlOutcome::ok("block_exec", 0)
    }

    /// Whether an executable has been denied.
    pub fn is_blocked(&self, exe: &Path) -> bool {
        self.blocked.lock().expect("blocklist poisoned").contains(exe)
    }

    /// Current deny list.
    pub fn blocked_executables(&self) -> Vec<PathBuf> {
        let mut list: Vec<PathBuf> = self
            .blocked
            .lock()
            .expect("blocklist poisoned")
            .iter()
            .cloned()
            .collect();
        list.sort();
        list
    }
}

/// Resolve a PID's identity from /proc.
pub fn identity(pid: u32) -> Option<ProcessIdentity> {
    let comm = std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .ok()?
        .trim()
        .to_string();
    let exe = std::fs::read_link(format!("/proc/{pid}/exe")).ok();

    Some(ProcessIdentity {
        pid,
        name: comm,
        exe,
    })
}

/// Single-character process state from /proc/<pid>/stat ('T' = stopped).
pub fn state(pid: u32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Format: pid (comm) state ... - comm may contain spaces, split on ')'
    let after_comm = stat.rsplit(')').next()?;
    after_comm.trim_start().chars().next()
}

/// Parent plus all descendants, for the level-2 action log.
pub fn process_tree(pid: u32) -> Vec<ProcessNode> {
    let mut tree = Vec::new();
    let mut queue = vec![pid];

    while let Some(current) = queue.pop() {
        let name = std::fs::read_to_string(format!("/proc/{current}/comm"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "?".to_string());
        tree.push(ProcessNode { pid: current, name });

        for tid in task_ids(current) {
            if let Ok(children) =
                std::fs::read_to_string(format!("/proc/{current}/task/{tid}/children"))
            {
                queue.extend(children.split_whitespace().filter_map(|c| c.parse::<u32>().ok()));
            }
        }
    }
    tree
}

fn task_ids(pid: u32) -> Vec<u32> {
    std::fs::read_dir(format!("/proc/{pid}/task"))
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| e.file_name().to_string_lossy().parse().ok())
                .collect()
        })
        .unwrap_or_default()
}
