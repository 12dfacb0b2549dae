//! Configuration management for Rampart
//!
//! The configuration file is JSON with every recognized key enumerated
//! below. Invalid configuration is fatal at startup and never fatal at
//! runtime: callers hold on to the last good `Config` when a reload fails.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Directory watching
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Entropy measurement
    #[serde(default)]
    pub entropy: EntropyConfig,

    /// Behavioral analysis thresholds
    #[serde(default)]
    pub behavior: BehaviorConfig,

    /// Response escalation and safe mode
    #[serde(default)]
    pub response: ResponseConfig,

    /// Backup vault
    #[serde(default)]
    pub backup: BackupConfig,

    /// Event database
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.entropy.prefix_bytes == 0 {
            anyhow::bail!("entropy.prefix_bytes must be positive");
        }
        if !(0.0..=8.0).contains(&self.entropy.delta_threshold) {
            anyhow::bail!("entropy.delta_threshold must be within [0, 8]");
        }
        if self.behavior.window_seconds == 0 {
            anyhow::bail!("behavior.window_seconds must be positive");
        }
        if self.behavior.mass_window_seconds > self.behavior.window_seconds {
            anyhow::bail!("behavior.mass_window_seconds cannot exceed behavior.window_seconds");
        }
        if self.behavior.mass_threshold == 0 {
            anyhow::bail!("behavior.mass_threshold must be positive");
        }
        LogLevel::parse(&self.logging.level)?;
        Ok(())
    }

    /// Check if a path should be excluded from monitoring.
    pub fn is_excluded(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();

        for pattern in &self.monitor.exclude_directories {
            if let Ok(glob) = globset::Glob::new(pattern) {
                if glob.compile_matcher().is_match(path) {
                    return true;
                }
            }
            // Substring fallback for non-glob patterns
            if path_str.contains(pattern.trim_matches('*')) {
                return true;
            }
        }
        false
    }

    /// Check if a path passes the extension filter (empty filter passes all).
    pub fn passes_extension_filter(&self, path: &Path) -> bool {
        if self.monitor.file_extension_filter.is_empty() {
            return true;
        }
        let ext = match path.extension() {
            Some(e) => format!(".{}", e.to_string_lossy().to_lowercase()),
            None => return false,
        };
        self.monitor
            .file_extension_filter
            .iter()
            .any(|f| normalize_ext(f) == ext)
    }

    /// Check if a process name is whitelisted (scores forced to 0).
    pub fn is_whitelisted(&self, process_name: &str) -> bool {
        self.response.process_whitelist.iter().any(|p| {
            if p.ends_with('*') {
                process_name.starts_with(p.trim_end_matches('*'))
            } else {
                process_name == p
            }
        })
    }

    /// Set a single configuration key by its dotted name.
    ///
    /// Only the enumerated keys are accepted; anything else is an error so
    /// typos surface instead of being silently stored.
    pub fn set_key(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "monitor.watch_directories" => {
                self.monitor.watch_directories =
                    parse_list(value).into_iter().map(PathBuf::from).collect();
            }
            "monitor.exclude_directories" => self.monitor.exclude_directories = parse_list(value),
            "monitor.file_extension_filter" => {
                self.monitor.file_extension_filter = parse_list(value);
            }
            "monitor.recursive" => self.monitor.recursive = value.parse()?,
            "entropy.prefix_bytes" => self.entropy.prefix_bytes = value.parse()?,
            "entropy.delta_threshold" => self.entropy.delta_threshold = value.parse()?,
            "entropy.sample_spread" => self.entropy.sample_spread = value.parse()?,
            "entropy.baseline_db_path" => self.entropy.baseline_db_path = PathBuf::from(value),
            "behavior.window_seconds" => self.behavior.window_seconds = value.parse()?,
            "behavior.mass_threshold" => self.behavior.mass_threshold = value.parse()?,
            "behavior.mass_window_seconds" => self.behavior.mass_window_seconds = value.parse()?,
            "behavior.entropy_spike_min_files" => {
                self.behavior.entropy_spike_min_files = value.parse()?;
            }
            "behavior.extension_min_files" => self.behavior.extension_min_files = value.parse()?,
            "behavior.traversal_min_dirs" => self.behavior.traversal_min_dirs = value.parse()?,
            "behavior.deletion_min_pairs" => self.behavior.deletion_min_pairs = value.parse()?,
            "behavior.refractory_seconds" => self.behavior.refractory_seconds = value.parse()?,
            "response.safe_mode" => self.response.safe_mode = value.parse()?,
            "response.confirmation_timeout_minutes" => {
                self.response.confirmation_timeout_minutes = value.parse()?;
            }
            "response.process_whitelist" => self.response.process_whitelist = parse_list(value),
            "backup.vault_path" => self.backup.vault_path = PathBuf::from(value),
            "backup.retention_hours" => self.backup.retention_hours = value.parse()?,
            "backup.min_free_mb" => self.backup.min_free_mb = value.parse()?,
            "database.path" => self.database.path = PathBuf::from(value),
            "logging.level" => {
                LogLevel::parse(value)?;
                self.logging.level = value.to_string();
            }
            other => anyhow::bail!("unrecognized configuration key: {other}"),
        }
        self.validate()
    }
}

fn normalize_ext(filter: &str) -> String {
    let f = filter.to_lowercase();
    if f.starts_with('.') {
        f
    } else {
        format!(".{f}")
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Directory watching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Roots to subscribe to
    #[serde(default)]
    pub watch_directories: Vec<PathBuf>,

    /// Patterns causing a path to be dropped silently
    #[serde(default = "default_excludes")]
    pub exclude_directories: Vec<String>,

    /// If non-empty, only matching suffixes are kept
    #[serde(default)]
    pub file_extension_filter: Vec<String>,

    /// Whether sub-trees are watched
    #[serde(default = "default_true")]
    pub recursive: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            watch_directories: Vec::new(),
            exclude_directories: default_excludes(),
            file_extension_filter: Vec::new(),
            recursive: true,
        }
    }
}

/// Entropy measurement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntropyConfig {
    /// Bytes sampled per measurement
    #[serde(default = "default_prefix_bytes")]
    pub prefix_bytes: usize,

    /// Minimum entropy delta counted as a spike
    #[serde(default = "default_delta_threshold")]
    pub delta_threshold: f64,

    /// Sample three spread offsets instead of only the head for large files
    #[serde(default)]
    pub sample_spread: bool,

    /// Baseline database path
    #[serde(default = "default_baseline_db")]
    pub baseline_db_path: PathBuf,
}

impl Default for EntropyConfig {
    fn default() -> Self {
        Self {
            prefix_bytes: default_prefix_bytes(),
            delta_threshold: default_delta_threshold(),
            sample_spread: false,
            baseline_db_path: default_baseline_db(),
        }
    }
}

/// Behavioral analysis thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    /// Sliding window length W in seconds
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Distinct paths written before MassModification triggers
    #[serde(default = "default_mass_threshold")]
    pub mass_threshold: usize,

    /// Sub-window T in seconds for the burst indicators
    #[serde(default = "default_mass_window")]
    pub mass_window_seconds: u64,

    /// Spiked files before EntropySpike triggers
    #[serde(default = "default_three")]
    pub entropy_spike_min_files: usize,

    /// Suspicious renames before ExtensionManipulation triggers
    #[serde(default = "default_three")]
    pub extension_min_files: usize,

    /// Distinct directories before DirectoryTraversal triggers
    #[serde(default = "default_traversal_dirs")]
    pub traversal_min_dirs: usize,

    /// Delete-then-create pairs before DeletionPattern triggers
    #[serde(default = "default_three")]
    pub deletion_min_pairs: usize,

    /// Seconds between same-escalation re-emissions per process
    #[serde(default = "default_refractory")]
    pub refractory_seconds: u64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
            mass_threshold: default_mass_threshold(),
            mass_window_seconds: default_mass_window(),
            entropy_spike_min_files: default_three(),
            extension_min_files: default_three(),
            traversal_min_dirs: default_traversal_dirs(),
            deletion_min_pairs: default_three(),
            refractory_seconds: default_refractory(),
        }
    }
}

/// Response escalation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseConfig {
    /// When true, L3/L4 destructive actions require confirmation
    #[serde(default)]
    pub safe_mode: bool,

    /// Minutes before a pending confirmation expires
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_minutes: u64,

    /// Process names whose scores are forced to 0
    #[serde(default)]
    pub process_whitelist: Vec<String>,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            safe_mode: false,
            confirmation_timeout_minutes: default_confirmation_timeout(),
            process_whitelist: Vec::new(),
        }
    }
}

/// Backup vault configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Vault root directory (created 0700)
    #[serde(default = "default_vault_path")]
    pub vault_path: PathBuf,

    /// Entries older than this are purge-eligible
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Snapshots are refused below this much free space
    #[serde(default = "default_min_free_mb")]
    pub min_free_mb: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            vault_path: default_vault_path(),
            retention_hours: default_retention_hours(),
            min_free_mb: default_min_free_mb(),
        }
    }
}

/// Event database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Event store path
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Debug / Info / Warning / Error
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Parsed logging level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Parse a config string, case-insensitively.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => anyhow::bail!("unknown logging level: {other}"),
        }
    }

    /// Env-filter directive for tracing-subscriber.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

// Default value functions for serde

fn default_true() -> bool {
    true
}

fn default_excludes() -> Vec<String> {
    vec![
        "/tmp/**".to_string(),
        "/var/log/**".to_string(),
        "*.swp".to_string(),
        "*.tmp".to_string(),
    ]
}

fn default_prefix_bytes() -> usize {
    1024
}

fn default_delta_threshold() -> f64 {
    2.0
}

fn default_baseline_db() -> PathBuf {
    PathBuf::from("/var/lib/rampart/baselines.db")
}

fn default_window_seconds() -> u64 {
    60
}

fn default_mass_threshold() -> usize {
    20
}

fn default_mass_window() -> u64 {
    10
}

fn default_three() -> usize {
    3
}

fn default_traversal_dirs() -> usize {
    5
}

fn default_refractory() -> u64 {
    5
}

fn default_confirmation_timeout() -> u64 {
    5
}

fn default_vault_path() -> PathBuf {
    PathBuf::from("/var/lib/rampart/vault")
}

fn default_retention_hours() -> u64 {
    48
}

fn default_min_free_mb() -> u64 {
    100
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/rampart/events.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.behavior.window_seconds, 60);
        assert_eq!(config.backup.retention_hours, 48);
        assert_eq!(config.backup.min_free_mb, 100);
    }

    #[test]
    fn test_is_excluded() {
        let config = Config::default();
        assert!(config.is_excluded(Path::new("/tmp/test.txt")));
        assert!(config.is_excluded(Path::new("/var/log/syslog")));
        assert!(!config.is_excluded(Path::new("/home/user/document.pdf")));
    }

    #[test]
    fn test_extension_filter() {
        let mut config = Config::default();
        assert!(config.passes_extension_filter(Path::new("/a/b.anything")));

        config.monitor.file_extension_filter = vec!["docx".to_string(), ".pdf".to_string()];
        assert!(config.passes_extension_filter(Path::new("/a/report.docx")));
        assert!(config.passes_extension_filter(Path::new("/a/report.PDF")));
        assert!(!config.passes_extension_filter(Path::new("/a/report.txt")));
        assert!(!config.passes_extension_filter(Path::new("/a/noext")));
    }

    #[test]
    fn test_is_whitelisted() {
        let mut config = Config::default();
        config.response.process_whitelist = vec!["7z.exe".to_string(), "rsync*".to_string()];

        assert!(config.is_whitelisted("7z.exe"));
        assert!(config.is_whitelisted("rsync"));
        assert!(config.is_whitelisted("rsync3"));
        assert!(!config.is_whitelisted("malware"));
    }

    #[test]
    fn test_set_key() {
        let mut config = Config::default();
        config.set_key("behavior.mass_threshold", "30").unwrap();
        assert_eq!(config.behavior.mass_threshold, 30);

        config.set_key("response.safe_mode", "true").unwrap();
        assert!(config.response.safe_mode);

        config
            .set_key("response.process_whitelist", "7z.exe, tar")
            .unwrap();
        assert_eq!(config.response.process_whitelist.len(), 2);

        assert!(config.set_key("no.such.key", "1").is_err());
        assert!(config.set_key("logging.level", "loud").is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.behavior.mass_window_seconds = 120;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.entropy.delta_threshold = 9.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.behavior.mass_threshold = 25;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.behavior.mass_threshold, 25);
    }
}
