//! Rampart - behavioral ransomware detection and rollback
//!
//! Rampart watches file system activity, attributes it to processes,
//! measures content entropy, and scores each process's recent behavior
//! against six ransomware indicators. Threats escalate through four
//! response tiers - monitor, warn with backups, suspend, terminate with
//! rollback - backed by an integrity-verified copy-on-write vault so the
//! damage a late detection allows can be undone.
//!
//! # Features
//!
//! - **Entropy analysis** - per-file baselines catch the low-to-high
//!   randomness jump encryption cannot avoid
//! - **Behavioral scoring** - weighted indicators over a sliding window,
//!   not signatures
//! - **Copy-on-write vault** - SHA-256 verified snapshots and best-effort
//!   rollback
//! - **Safe mode** - destructive actions wait for human confirmation
//!
//! # Example
//!
//! ```rust,no_run
//! use rampart::{pipeline, Config};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let (raw_tx, raw_rx) = mpsc::channel(4096);
//!
//!     // raw_tx feeds events from your watcher adapter
//!     let handle = pipeline::spawn(config, raw_rx)?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod alert;
pub mod analyzer;
pub mod config;
pub mod entropy;
pub mod event;
pub mod intake;
pub mod pipeline;
pub mod response;
pub mod store;
pub mod vault;

mod sys;

pub use analyzer::{BehaviorAnalyzer, ThreatLevel, ThreatRecord};
pub use config::Config;
pub use event::{EventKind, FileEvent, RawFileEvent};
pub use response::{ProcessController, ResponseEngine};
pub use store::EventStore;
pub use vault::{BackupEntry, BackupVault};
