//! Tolerant directory traversal for save trees.
//!
//! Individual entries that cannot be read are logged and counted, never
//! fatal. Only a root that cannot be opened fails the walk.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// A regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Last modification time (symlinks report their target's)
    pub modified: SystemTime,

    /// Is this a symlink?
    pub is_symlink: bool,
}

impl FileInfo {
    /// Build from a non-directory entry. Symlinks resolve to their target;
    /// links to directories and broken links yield `None`.
    fn from_entry(entry: &DirEntry, root: &Path) -> io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let is_symlink = entry.path_is_symlink();

        let metadata = if is_symlink {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_dir() => return Ok(None),
                Ok(resolved) => resolved,
                Err(_) => return Ok(None),
            }
        } else {
            entry.metadata()?
        };

        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Ok(Some(Self {
            relative_path,
            size: metadata.len(),
            modified: metadata.modified()?,
            is_symlink,
            path,
        }))
    }
}

/// Result of a tolerant walk
#[derive(Debug, Default)]
pub struct WalkReport {
    pub files: Vec<FileInfo>,

    /// Entries skipped because they could not be read
    pub skipped: usize,
}

impl WalkReport {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Latest modification time across all files, `None` when empty.
    pub fn latest_modified(&self) -> Option<SystemTime> {
        self.files.iter().map(|f| f.modified).max()
    }
}

/// Walk `root` recursively and collect every regular file.
///
/// # Returns
/// * `Ok(WalkReport)` - Files found plus the number of skipped entries
/// * `Err(io::Error)` - If the root itself cannot be read
pub fn walk_files(root: &Path) -> io::Result<WalkReport> {
    let mut report = WalkReport::default();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(into_io_error(e)),
            Err(e) => {
                warn!(root = %root.display(), "Skipping unreadable entry: {}", e);
                report.skipped += 1;
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }

        match FileInfo::from_entry(&entry, root) {
            Ok(Some(file)) => report.files.push(file),
            Ok(None) => {}
            Err(e) => {
                warn!(path = %entry.path().display(), "Skipping file without readable metadata: {}", e);
                report.skipped += 1;
            }
        }
    }

    Ok(report)
}

fn into_io_error(err: walkdir::Error) -> io::Error {
    let message = err.to_string();
    err.into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, message))
}
