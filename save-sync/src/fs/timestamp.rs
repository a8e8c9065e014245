//! Tree-wide "last modified" computation.

use super::walker::{walk_files, WalkReport};
use crate::utils::{Result, SyncError};
use std::cmp::Ordering;
use std::io;
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;

/// Latest modification time of any regular file under `dir`.
///
/// Directories themselves do not count. Fails with `EmptyTree` when the tree
/// holds no regular files and `SourceMissing` when `dir` does not exist.
pub fn last_modified(dir: &Path) -> Result<SystemTime> {
    let report = scan(dir)?;
    if report.skipped > 0 {
        debug!(root = %dir.display(), skipped = report.skipped, "Timestamp scan skipped entries");
    }

    report
        .latest_modified()
        .ok_or_else(|| SyncError::EmptyTree(dir.to_path_buf()))
}

fn scan(dir: &Path) -> Result<WalkReport> {
    walk_files(dir).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => SyncError::SourceMissing(dir.to_path_buf()),
        _ => SyncError::Io(e),
    })
}

/// Freshness of one side of a pair. An empty tree is older than anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Empty,
    Modified(SystemTime),
}

impl Freshness {
    /// Like [`last_modified`], folding `EmptyTree` into `Freshness::Empty`.
    pub fn of(dir: &Path) -> Result<Self> {
        match last_modified(dir) {
            Ok(at) => Ok(Freshness::Modified(at)),
            Err(SyncError::EmptyTree(_)) => Ok(Freshness::Empty),
            Err(e) => Err(e),
        }
    }

    pub fn instant(&self) -> Option<SystemTime> {
        match self {
            Freshness::Empty => None,
            Freshness::Modified(at) => Some(*at),
        }
    }
}

impl PartialOrd for Freshness {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Freshness {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Freshness::Empty, Freshness::Empty) => Ordering::Equal,
            (Freshness::Empty, _) => Ordering::Less,
            (_, Freshness::Empty) => Ordering::Greater,
            (Freshness::Modified(a), Freshness::Modified(b)) => a.cmp(b),
        }
    }
}

/// Cheap identity of a tree's state: newest mtime plus file count and size.
///
/// Catches deletions and same-mtime rewrites of smaller files that the
/// timestamp alone would miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub latest: Option<SystemTime>,
    pub files: usize,
    pub bytes: u64,
}

impl Fingerprint {
    pub fn of(dir: &Path) -> Result<Self> {
        let report = scan(dir)?;
        Ok(Self {
            latest: report.latest_modified(),
            files: report.files.len(),
            bytes: report.total_bytes(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.files == 0
    }
}
