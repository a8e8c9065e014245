//! Error types for the sync engine.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Which side of a one-way transfer an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Source,
    Destination,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Source => f.write_str("source"),
            Role::Destination => f.write_str("destination"),
        }
    }
}

/// Step of the replace sequence that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplaceStage {
    /// Copying the source into the temporary sibling
    Stage,
    /// Moving the old destination out of the way
    Displace,
    /// Renaming the staged copy onto the destination path
    Swap,
}

impl fmt::Display for ReplaceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplaceStage::Stage => f.write_str("staging copy"),
            ReplaceStage::Displace => f.write_str("displacing destination"),
            ReplaceStage::Swap => f.write_str("swapping in staged copy"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Source directory missing: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("No regular files under {}", .0.display())]
    EmptyTree(PathBuf),

    #[error("Backup of {role} {} failed: {source}", path.display())]
    BackupFailed {
        role: Role,
        path: PathBuf,
        #[source]
        source: Box<SyncError>,
    },

    #[error(
        "Replacing {} failed while {stage}: {source} (destination restored: {restored})",
        dest.display()
    )]
    ReplaceFailed {
        dest: PathBuf,
        stage: ReplaceStage,
        #[source]
        source: std::io::Error,
        restored: bool,
    },

    #[error("Backup destination already exists: {}", .0.display())]
    DestinationExists(PathBuf),

    #[error("Pair '{0}' is already syncing")]
    AlreadySyncing(String),

    #[error("Cannot watch {}: {source}", path.display())]
    WatchSubscription {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("Unknown pair: {0}")]
    UnknownPair(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Sync engine stopped")]
    EngineStopped,
}

impl SyncError {
    /// Short machine-readable name used in events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::SourceMissing(_) => "source-missing",
            SyncError::EmptyTree(_) => "empty-tree",
            SyncError::BackupFailed { .. } => "backup-failed",
            SyncError::ReplaceFailed { .. } => "replace-failed",
            SyncError::DestinationExists(_) => "destination-exists",
            SyncError::AlreadySyncing(_) => "already-syncing",
            SyncError::WatchSubscription { .. } => "watch-subscription",
            SyncError::UnknownPair(_) => "unknown-pair",
            SyncError::Config(_) => "config",
            SyncError::Io(_) => "io",
            SyncError::Json(_) => "json",
            SyncError::Toml(_) => "toml",
            SyncError::EngineStopped => "engine-stopped",
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
