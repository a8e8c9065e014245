//! Backup-then-replace of one directory by another.
//!
//! Blocking; callers on the async side run it through `spawn_blocking`.

use crate::backup::BackupStore;
use crate::fs::{replace_tree_with, FsRenamer, Renamer};
use crate::utils::{Result, Role, SyncError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

/// One completed transfer
#[derive(Debug, Clone, Serialize)]
pub struct SyncOperation {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub source_backup: PathBuf,
    pub dest_backup: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub files: usize,
    pub bytes: u64,
    pub elapsed_ms: u64,
}

/// Back up both trees, then replace `dst` with a copy of `src`.
///
/// Nothing destructive happens unless both backups succeed. If the replace
/// fails and the destination could not be rolled back, it is restored from
/// the backup just taken.
pub fn sync_one_way(store: &BackupStore, src: &Path, dst: &Path) -> Result<SyncOperation> {
    sync_one_way_with(store, &FsRenamer, src, dst)
}

pub fn sync_one_way_with<R: Renamer + ?Sized>(
    store: &BackupStore,
    renamer: &R,
    src: &Path,
    dst: &Path,
) -> Result<SyncOperation> {
    let start = Instant::now();

    if !src.is_dir() {
        return Err(SyncError::SourceMissing(src.to_path_buf()));
    }
    if src.starts_with(dst) || dst.starts_with(src) {
        return Err(SyncError::Config(format!(
            "{} and {} overlap",
            src.display(),
            dst.display()
        )));
    }

    let source_backup = store.backup(src).map_err(|e| SyncError::BackupFailed {
        role: Role::Source,
        path: src.to_path_buf(),
        source: Box::new(e),
    })?;

    let dest_backup = store.backup(dst).map_err(|e| SyncError::BackupFailed {
        role: Role::Destination,
        path: dst.to_path_buf(),
        source: Box::new(e),
    })?;

    let stats = match replace_tree_with(renamer, src, dst) {
        Ok(stats) => stats,
        Err(SyncError::ReplaceFailed {
            dest,
            stage,
            source,
            restored: false,
        }) => {
            warn!(dest = %dest.display(), %stage, "Replace left destination displaced, restoring from backup");
            let restored = match store.restore(&dest_backup, dst) {
                Ok(_) => true,
                Err(e) => {
                    error!(
                        dest = %dest.display(),
                        backup = %dest_backup.display(),
                        "Restore from backup failed: {}", e
                    );
                    false
                }
            };
            return Err(SyncError::ReplaceFailed {
                dest,
                stage,
                source,
                restored,
            });
        }
        Err(e) => return Err(e),
    };

    let elapsed_ms = start.elapsed().as_millis() as u64;
    info!(
        source = %src.display(),
        dest = %dst.display(),
        files = stats.files,
        bytes = stats.bytes,
        elapsed_ms,
        "Sync completed"
    );

    Ok(SyncOperation {
        source: src.to_path_buf(),
        dest: dst.to_path_buf(),
        source_backup,
        dest_backup,
        timestamp: Utc::now(),
        files: stats.files,
        bytes: stats.bytes,
        elapsed_ms,
    })
}
