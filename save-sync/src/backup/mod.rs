//! Timestamped sibling snapshots of save trees.
//!
//! A backup of `/save/yuzu/zelda` taken at Unix time 1700000000 lives at
//! `/save/yuzu/zelda_1700000000`. A second backup within the same second
//! gets `_1700000000-1`, then `-2`, and so on. Backups are never pruned:
//! every sync grows disk usage by the size of both trees.

pub mod clock;

use crate::fs::{copy_tree, replace_tree, CopyStats};
use crate::utils::{Result, SyncError};
use clock::{Clock, SystemClock};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Same-second collisions tolerated before giving up
const MAX_SEQUENCE: u32 = 999;

/// An existing backup found next to a tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupEntry {
    pub path: PathBuf,

    /// Unix timestamp encoded in the name
    pub created: i64,

    /// Same-second disambiguation counter, 0 for the plain name
    pub sequence: u32,
}

#[derive(Clone)]
pub struct BackupStore {
    clock: Arc<dyn Clock>,
}

impl BackupStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Back up `tree` under the current timestamp, adding a counter suffix
    /// when that second is already taken.
    pub fn backup(&self, tree: &Path) -> Result<PathBuf> {
        let tree = normalize(tree);
        ensure_tree(&tree)?;

        let timestamp = self.clock.unix_now();
        for sequence in 0..=MAX_SEQUENCE {
            let candidate = backup_path(&tree, timestamp, sequence);
            match fs::create_dir(&candidate) {
                Ok(()) => return self.fill(&tree, candidate),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(SyncError::Io(e)),
            }
        }

        Err(SyncError::DestinationExists(backup_path(&tree, timestamp, 0)))
    }

    /// Back up `tree` to exactly `<tree>_<timestamp>`, failing with
    /// `DestinationExists` if that path is taken.
    pub fn backup_at(&self, tree: &Path, timestamp: i64) -> Result<PathBuf> {
        let tree = normalize(tree);
        ensure_tree(&tree)?;

        let target = backup_path(&tree, timestamp, 0);
        match fs::create_dir(&target) {
            Ok(()) => self.fill(&tree, target),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(SyncError::DestinationExists(target))
            }
            Err(e) => Err(SyncError::Io(e)),
        }
    }

    /// Existing backups of `tree`, newest first.
    pub fn list(&self, tree: &Path) -> Result<Vec<BackupEntry>> {
        let tree = normalize(tree);
        let (Some(parent), Some(name)) = (tree.parent(), tree.file_name()) else {
            return Ok(Vec::new());
        };
        let prefix = format!("{}_", name.to_string_lossy());

        let mut entries: Vec<BackupEntry> = match fs::read_dir(parent) {
            Ok(dir) => dir
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
                .filter_map(|e| {
                    let file_name = e.file_name().to_string_lossy().to_string();
                    let suffix = file_name.strip_prefix(&prefix)?;
                    let (created, sequence) = parse_suffix(suffix)?;
                    Some(BackupEntry {
                        path: e.path(),
                        created,
                        sequence,
                    })
                })
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(SyncError::Io(e)),
        };

        entries.sort_by(|a, b| (b.created, b.sequence).cmp(&(a.created, a.sequence)));
        Ok(entries)
    }

    /// Replace `tree` with the contents of `backup`.
    pub fn restore(&self, backup: &Path, tree: &Path) -> Result<CopyStats> {
        if !backup.is_dir() {
            return Err(SyncError::SourceMissing(backup.to_path_buf()));
        }
        let stats = replace_tree(backup, &normalize(tree))?;
        info!(backup = %backup.display(), tree = %tree.display(), files = stats.files, "Restored backup");
        Ok(stats)
    }

    fn fill(&self, tree: &Path, target: PathBuf) -> Result<PathBuf> {
        match copy_tree(tree, &target) {
            Ok(stats) => {
                info!(
                    tree = %tree.display(),
                    backup = %target.display(),
                    files = stats.files,
                    bytes = stats.bytes,
                    "Backup created"
                );
                Ok(target)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&target) {
                    warn!(backup = %target.display(), "Failed to remove partial backup: {}", cleanup);
                }
                Err(SyncError::Io(e))
            }
        }
    }
}

impl Default for BackupStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop trailing separators so the suffix lands on the directory name.
fn normalize(tree: &Path) -> PathBuf {
    tree.components().collect()
}

fn ensure_tree(tree: &Path) -> Result<()> {
    if tree.is_dir() {
        Ok(())
    } else {
        Err(SyncError::SourceMissing(tree.to_path_buf()))
    }
}

fn backup_path(tree: &Path, timestamp: i64, sequence: u32) -> PathBuf {
    let mut name = OsString::from(tree.as_os_str());
    if sequence == 0 {
        name.push(format!("_{}", timestamp));
    } else {
        name.push(format!("_{}-{}", timestamp, sequence));
    }
    PathBuf::from(name)
}

fn parse_suffix(suffix: &str) -> Option<(i64, u32)> {
    let (created, sequence) = match suffix.split_once('-') {
        Some((created, sequence)) => (created, sequence.parse().ok()?),
        None => (suffix, 0),
    };
    if created.is_empty() || !created.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((created.parse().ok()?, sequence))
}
