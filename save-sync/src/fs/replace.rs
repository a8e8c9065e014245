//! Replace a directory's contents without a half-written window.
//!
//! The new contents are staged in a hidden sibling, the old directory is
//! moved aside, and the staged copy is renamed into place. Both renames stay
//! inside one parent directory, so they never cross filesystems.

use super::copy::{copy_tree, CopyStats};
use crate::utils::{ReplaceStage, Result, SyncError};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Directory renames performed by [`replace_tree_with`]
pub trait Renamer {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
}

/// Plain `std::fs::rename`
#[derive(Debug, Default, Clone, Copy)]
pub struct FsRenamer;

impl Renamer for FsRenamer {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }
}

/// Replace `dest` with a copy of `src`. `dest` may be missing.
///
/// On failure `ReplaceFailed::restored` says whether `dest` is still intact
/// (either untouched or rolled back); when it is `false` the caller must
/// recover from its own backup.
pub fn replace_tree(src: &Path, dest: &Path) -> Result<CopyStats> {
    replace_tree_with(&FsRenamer, src, dest)
}

pub fn replace_tree_with<R: Renamer + ?Sized>(
    renamer: &R,
    src: &Path,
    dest: &Path,
) -> Result<CopyStats> {
    let staging = sibling(dest, "incoming")?;
    debug!(staging = %staging.display(), "Staging replacement");

    let stats = match copy_tree(src, &staging) {
        Ok(stats) => stats,
        Err(e) => {
            discard(&staging);
            return Err(failed(dest, ReplaceStage::Stage, e, true));
        }
    };

    let displaced = if dest.exists() {
        let outgoing = sibling(dest, "outgoing")?;
        if let Err(e) = renamer.rename(dest, &outgoing) {
            discard(&staging);
            return Err(failed(dest, ReplaceStage::Displace, e, true));
        }
        Some(outgoing)
    } else {
        None
    };

    if let Err(e) = renamer.rename(&staging, dest) {
        let restored = match &displaced {
            Some(outgoing) => match renamer.rename(outgoing, dest) {
                Ok(()) => true,
                Err(rollback) => {
                    warn!(dest = %dest.display(), "Rolling back displaced directory failed: {}", rollback);
                    false
                }
            },
            None => true,
        };
        discard(&staging);
        return Err(failed(dest, ReplaceStage::Swap, e, restored));
    }

    if let Some(outgoing) = displaced {
        discard(&outgoing);
    }

    Ok(stats)
}

/// Hidden sibling path `.<name>.<tag>-<uuid>` next to `path`.
fn sibling(path: &Path, tag: &str) -> Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| SyncError::Config(format!("{} has no parent directory", path.display())))?;
    let name = path
        .file_name()
        .ok_or_else(|| SyncError::Config(format!("{} has no directory name", path.display())))?;

    let mut sibling_name = OsString::from(".");
    sibling_name.push(name);
    sibling_name.push(format!(".{}-{}", tag, Uuid::new_v4().simple()));
    Ok(parent.join(sibling_name))
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), "Failed to remove temporary directory: {}", e);
        }
    }
}

fn failed(dest: &Path, stage: ReplaceStage, source: io::Error, restored: bool) -> SyncError {
    SyncError::ReplaceFailed {
        dest: dest.to_path_buf(),
        stage,
        source,
        restored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::copy::trees_identical;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Fails the listed renames, counted from 1: displace, swap, rollback.
    struct FailingRenamer {
        calls: AtomicUsize,
        fail: &'static [usize],
    }

    impl FailingRenamer {
        fn new(fail: &'static [usize]) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl Renamer for FailingRenamer {
        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail.contains(&call) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "rename refused"));
            }
            fs::rename(from, to)
        }
    }

    fn populated(root: &Path) -> io::Result<(PathBuf, PathBuf)> {
        let src = root.join("yuzu");
        let dest = root.join("ryujinx");
        fs::create_dir_all(&src)?;
        fs::create_dir_all(&dest)?;
        fs::write(src.join("new.sav"), b"new")?;
        fs::write(dest.join("old.sav"), b"old")?;
        Ok((src, dest))
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with('.'))
            .collect()
    }

    #[test]
    fn test_replace_swaps_contents() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let src = temp_dir.path().join("yuzu");
        let dest = temp_dir.path().join("ryujinx");
        fs::create_dir_all(&src)?;
        fs::create_dir_all(&dest)?;
        fs::write(src.join("new.sav"), b"new")?;
        fs::write(dest.join("old.sav"), b"old")?;

        let stats = replace_tree(&src, &dest)?;

        assert_eq!(stats.files, 1);
        assert!(!dest.join("old.sav").exists());
        assert!(trees_identical(&src, &dest)?);
        assert!(leftovers(temp_dir.path()).is_empty());
        Ok(())
    }

    #[test]
    fn test_replace_into_missing_destination() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let src = temp_dir.path().join("src");
        fs::create_dir_all(&src)?;
        fs::write(src.join("a"), b"a")?;

        let dest = temp_dir.path().join("fresh");
        replace_tree(&src, &dest)?;

        assert_eq!(fs::read(dest.join("a"))?, b"a");
        Ok(())
    }

    #[test]
    fn test_failed_displace_leaves_destination_untouched() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let (src, dest) = populated(temp_dir.path())?;

        let err = replace_tree_with(&FailingRenamer::new(&[1]), &src, &dest).unwrap_err();

        match err {
            SyncError::ReplaceFailed { stage, restored, .. } => {
                assert_eq!(stage, ReplaceStage::Displace);
                assert!(restored);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fs::read(dest.join("old.sav"))?, b"old");
        assert!(leftovers(temp_dir.path()).is_empty());
        Ok(())
    }

    #[test]
    fn test_failed_swap_rolls_back() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let (src, dest) = populated(temp_dir.path())?;

        let err = replace_tree_with(&FailingRenamer::new(&[2]), &src, &dest).unwrap_err();

        match err {
            SyncError::ReplaceFailed { stage, restored, .. } => {
                assert_eq!(stage, ReplaceStage::Swap);
                assert!(restored);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fs::read(dest.join("old.sav"))?, b"old");
        assert!(!dest.join("new.sav").exists());
        assert!(leftovers(temp_dir.path()).is_empty());
        Ok(())
    }

    #[test]
    fn test_failed_rollback_reports_displaced_destination() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let (src, dest) = populated(temp_dir.path())?;

        let err = replace_tree_with(&FailingRenamer::new(&[2, 3]), &src, &dest).unwrap_err();

        match err {
            SyncError::ReplaceFailed { stage, restored, .. } => {
                assert_eq!(stage, ReplaceStage::Swap);
                assert!(!restored);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dest.exists());
        // The old tree is still parked next to it
        let parked = leftovers(temp_dir.path());
        assert_eq!(parked.len(), 1);
        assert!(parked[0].starts_with(".ryujinx.outgoing-"));
        Ok(())
    }

    #[test]
    fn test_failed_staging_leaves_destination_untouched() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let dest = temp_dir.path().join("dest");
        fs::create_dir_all(&dest)?;
        fs::write(dest.join("keep.sav"), b"keep")?;

        let err = replace_tree(&temp_dir.path().join("missing"), &dest).unwrap_err();

        match err {
            SyncError::ReplaceFailed { stage, restored, .. } => {
                assert_eq!(stage, ReplaceStage::Stage);
                assert!(restored);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fs::read(dest.join("keep.sav"))?, b"keep");
        assert!(leftovers(temp_dir.path()).is_empty());
        Ok(())
    }
}
