//! Configuration management for save-sync.
//!
//! Loads configuration from a TOML file (or the legacy `config.json` game
//! list) with environment variable overrides.

use crate::utils::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub labels: LabelConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    /// Ordered game list; index order is the order shown to the user
    #[serde(default)]
    pub games: Vec<PairConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelConfig {
    /// Display name of the emulator owning `source_save_path`
    #[serde(default = "default_source_label")]
    pub source: String,

    /// Display name of the emulator owning `dest_save_path`
    #[serde(default = "default_dest_label")]
    pub dest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Minimum timestamp gap (ms) before one side counts as newer
    #[serde(default)]
    pub tolerance_ms: u64,

    /// What a sync request does when its pair is already syncing
    #[serde(default)]
    pub on_busy: BusyPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Quiet window (ms) before a burst of changes triggers a sync
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Run one reconcile pass over every pair before watching
    #[serde(default = "default_true")]
    pub reconcile_on_start: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusyPolicy {
    /// Wait for the running sync, then run
    #[default]
    Queue,
    /// Fail immediately with `AlreadySyncing`
    FailFast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    pub name: String,

    #[serde(alias = "sourceSavePath", alias = "yuzu_save_path")]
    pub source_save_path: PathBuf,

    #[serde(alias = "destSavePath", alias = "ryujinx_save_path")]
    pub dest_save_path: PathBuf,
}

// Default values
fn default_log_level() -> String {
    "info".to_string()
}

fn default_source_label() -> String {
    "yuzu".to_string()
}

fn default_dest_label() -> String {
    "ryujinx".to_string()
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            source: default_source_label(),
            dest: default_dest_label(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tolerance_ms: 0,
            on_busy: BusyPolicy::default(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            reconcile_on_start: true,
        }
    }
}

impl SyncConfig {
    pub fn tolerance(&self) -> Duration {
        Duration::from_millis(self.tolerance_ms)
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Config {
    /// Load configuration from a file: JSON when the extension is `.json`,
    /// TOML otherwise.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read {}: {}", path.display(), e)))?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let config = if is_json {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        Ok(config)
    }

    /// Load from `path` (or defaults), then apply `.env` and environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `SAVE_SYNC_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("SAVE_SYNC_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(value) = lookup("SAVE_SYNC_TOLERANCE_MS") {
            self.sync.tolerance_ms = parse_ms("SAVE_SYNC_TOLERANCE_MS", &value)?;
        }
        if let Some(value) = lookup("SAVE_SYNC_DEBOUNCE_MS") {
            self.watch.debounce_ms = parse_ms("SAVE_SYNC_DEBOUNCE_MS", &value)?;
        }
        Ok(())
    }
}

fn parse_ms(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| SyncError::Config(format!("{} must be a number of milliseconds, got '{}'", key, value)))
}
