//! Recursive tree copy preserving file metadata.

use super::metadata::FileMetadata;
use std::fs;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// Totals for a completed copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: usize,
    pub bytes: u64,
}

/// Copy every entry under `src` into `dest`, creating `dest` if needed.
///
/// Unlike the timestamp walk this is strict: any unreadable entry fails the
/// copy, since a partial backup or replacement is worse than none.
pub fn copy_tree(src: &Path, dest: &Path) -> io::Result<CopyStats> {
    let mut stats = CopyStats::default();
    fs::create_dir_all(dest)?;

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let rel_path = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let new_path = dest.join(rel_path);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&new_path)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &new_path)?;
        } else {
            if let Some(parent) = new_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let bytes = fs::copy(entry.path(), &new_path)?;
            FileMetadata::from_path(entry.path())?.apply_to_path(&new_path)?;
            stats.files += 1;
            stats.bytes += bytes;
        }
    }

    Ok(stats)
}

#[cfg(unix)]
fn copy_symlink(link: &Path, new_path: &Path) -> io::Result<()> {
    let target = fs::read_link(link)?;
    std::os::unix::fs::symlink(target, new_path)
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, new_path: &Path) -> io::Result<()> {
    // Windows symlinks need privileges; copy the target instead
    fs::copy(link, new_path).map(|_| ())
}

/// Compare two trees file by file: same relative paths, same bytes.
pub fn trees_identical(a: &Path, b: &Path) -> io::Result<bool> {
    let mut a_files = super::walker::walk_files(a)?.files;
    let mut b_files = super::walker::walk_files(b)?.files;
    if a_files.len() != b_files.len() {
        return Ok(false);
    }

    a_files.sort_by(|x, y| x.relative_path.cmp(&y.relative_path));
    b_files.sort_by(|x, y| x.relative_path.cmp(&y.relative_path));

    for (x, y) in a_files.iter().zip(b_files.iter()) {
        if x.relative_path != y.relative_path || x.size != y.size {
            return Ok(false);
        }
        if fs::read(&x.path)? != fs::read(&y.path)? {
            return Ok(false);
        }
    }

    Ok(true)
}
