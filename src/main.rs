//! Rampart - behavioral ransomware detection for Linux hosts
//!
//! # Usage
//!
//! ```bash
//! # Run the detection pipeline (raw events arrive as JSON lines on stdin
//! # from the watcher adapter)
//! rampart monitor
//!
//! # Inspect and restore backups
//! rampart vault list --process evil
//! rampart vault restore 42
//! rampart vault restore --process evil
//!
//! # Configuration
//! rampart config show
//! rampart config set response.safe_mode true
//! ```

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::AsyncBufReadExt;
use tracing::{error, info, warn};

use rampart::config::{Config, LogLevel};
use rampart::event::RawFileEvent;
use rampart::pipeline;
use rampart::vault::{BackupVault, ListFilter};

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_IO: i32 = 2;
const EXIT_PERMISSION: i32 = 3;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "rampart")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/rampart/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingest + analyzer + response pipeline
    Monitor,

    /// Backup vault operations
    Vault {
        #[command(subcommand)]
        action: VaultAction,
    },

    /// Show or change configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum VaultAction {
    /// List backup entries
    List {
        /// Only entries for this original path
        #[arg(long)]
        path: Option<PathBuf>,

        /// Only entries recorded against this process name
        #[arg(long)]
        process: Option<String>,

        /// Only entries at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<String>,
    },

    /// Restore by entry id, by process, or everything since a timestamp
    Restore {
        /// Backup entry id
        entry_id: Option<i64>,

        /// Restore the newest version per path backed up against a process
        #[arg(long, conflicts_with = "entry_id")]
        process: Option<String>,

        /// Restore the newest version per path since an RFC 3339 timestamp
        #[arg(long, conflicts_with_all = ["entry_id", "process"])]
        all_since: Option<String>,
    },

    /// Re-hash a stored backup against its recorded digest
    Verify {
        entry_id: i64,
    },

    /// Delete entries older than the retention window
    Purge,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Set a single key (dotted name) and save
    Set { key: String, value: String },
}

fn setup_logging(config: &Config, verbose: bool) {
    let filter = if verbose {
        "debug"
    } else {
        LogLevel::parse(&config.logging.level)
            .map(LogLevel::as_filter)
            .unwrap_or("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Missing config file falls back to defaults; a present-but-invalid
    // one is fatal at startup.
    let config = if cli.config.exists() {
        match Config::load(&cli.config) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("configuration error: {e:#}");
                std::process::exit(EXIT_CONFIG);
            }
        }
    } else {
        Config::default()
    };

    setup_logging(&config, cli.verbose);

    let code = match run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            classify_error(&e)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Monitor => monitor(config).await,
        Commands::Vault { action } => vault_command(config, action),
        Commands::Config { action } => config_command(cli.config, config, action),
    }
}

/// Run the pipeline until interrupted. The watcher adapter's seam is
/// stdin: one JSON-encoded raw event per line.
async fn monitor(config: Config) -> anyhow::Result<i32> {
    let (raw_tx, raw_rx) = tokio::sync::mpsc::channel(4096);
    let handle = pipeline::spawn(config, raw_rx)?;

    // Watcher adapter: JSON lines on stdin
    let reader_task = tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<RawFileEvent>(&line) {
                Ok(raw) => {
                    if raw_tx.send(raw).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("unparseable raw event: {e}"),
            }
        }
    });

    info!("rampart monitoring started");
    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    reader_task.abort();
    handle.shutdown().await;
    Ok(EXIT_INTERRUPTED)
}

fn vault_command(config: Config, action: VaultAction) -> anyhow::Result<i32> {
    let vault = BackupVault::open(&config.backup.vault_path, config.backup.min_free_mb)?;

    match action {
        VaultAction::List {
            path,
            process,
            since,
        } => {
            let filter = ListFilter {
                path,
                process,
                since: since.as_deref().map(parse_timestamp).transpose()?,
                ..Default::default()
            };
            let entries = vault.list(&filter)?;
            if entries.is_empty() {
                println!("no backup entries match");
                return Ok(EXIT_OK);
            }
            println!(
                "{:>6}  {:<24}  {:<12}  {:<16}  {}",
                "ID", "TIMESTAMP", "REASON", "PROCESS", "ORIGINAL PATH"
            );
            for e in entries {
                println!(
                    "{:>6}  {:<24}  {:<12}  {:<16}  {}",
                    e.id,
                    e.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                    e.reason.as_str(),
                    e.process_name.as_deref().unwrap_or("-"),
                    e.original_path.display(),
                );
            }
        }

        VaultAction::Restore {
            entry_id,
            process,
            all_since,
        } => {
            let results = if let Some(id) = entry_id {
                vec![vault.restore(id)?]
            } else if let Some(process) = process {
                vault.restore_by_process(&process)?
            } else if let Some(since) = all_since {
                vault.restore_all_since(parse_timestamp(&since)?)?
            } else {
                anyhow::bail!("specify an entry id, --process, or --all-since");
            };

            let mut failures = 0;
            for r in &results {
                let integrity = match r.integrity_ok {
                    Some(true) => "intact",
                    Some(false) => "HASH MISMATCH",
                    None => "unverified",
                };
                if r.success {
                    println!("restored {} ({integrity})", r.original_path.display());
                } else {
                    failures += 1;
                    println!(
                        "FAILED {} ({})",
                        r.original_path.display(),
                        r.error.as_deref().unwrap_or("unknown error"),
                    );
                }
            }
            println!("{}/{} restored", results.len() - failures, results.len());
            if failures > 0 {
                return Ok(EXIT_IO);
            }
        }

        VaultAction::Verify { entry_id } => {
            if vault.verify(entry_id)? {
                println!("entry {entry_id}: stored bytes match the recorded digest");
            } else {
                println!("entry {entry_id}: HASH MISMATCH");
                return Ok(EXIT_IO);
            }
        }

        VaultAction::Purge => {
            let removed = vault
                .purge_older_than(chrono::Duration::hours(config.backup.retention_hours as i64))?;
            println!("purged {removed} backup entr{}", if removed == 1 { "y" } else { "ies" });
        }
    }
    Ok(EXIT_OK)
}

fn config_command(
    config_path: PathBuf,
    mut config: Config,
    action: ConfigAction,
) -> anyhow::Result<i32> {
    match action {
        ConfigAction::Show => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Set { key, value } => {
            config.set_key(&key, &value)?;
            config.save(&config_path)?;
            println!("{key} = {value}");
        }
    }
    Ok(EXIT_OK)
}

fn parse_timestamp(s: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| anyhow::anyhow!("invalid timestamp {s:?} (want RFC 3339): {e}"))
}

/// Map an error chain to the documented exit codes.
fn classify_error(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return if io.kind() == std::io::ErrorKind::PermissionDenied {
                EXIT_PERMISSION
            } else {
                EXIT_IO
            };
        }
        if cause.downcast_ref::<serde_json::Error>().is_some() {
            return EXIT_CONFIG;
        }
    }
    // Vault and store failures without an io cause (disk pressure,
    // database errors) are still I/O problems from the operator's seat.
    let io_shaped = err.chain().any(|cause| {
        cause.downcast_ref::<rampart::vault::VaultError>().is_some()
            || cause.downcast_ref::<rampart::store::StoreError>().is_some()
            || cause.downcast_ref::<rusqlite::Error>().is_some()
    });
    if io_shaped {
        EXIT_IO
    } else {
        EXIT_CONFIG
    }
}
