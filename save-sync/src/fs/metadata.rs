//! File metadata carried across copies.
//!
//! Copies must keep modification times, otherwise a freshly synced
//! destination would always look newer than its source.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// Metadata preserved when a file is copied
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,

    /// Last modified time
    pub modified: SystemTime,

    /// File permissions (Unix mode bits)
    pub permissions: Option<u32>,
}

impl FileMetadata {
    /// Extract metadata from a file path (follows symlinks)
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;

        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode())
        };

        #[cfg(not(unix))]
        let permissions = None;

        Ok(Self {
            size: metadata.len(),
            modified: metadata.modified()?,
            permissions,
        })
    }

    /// Apply modification time and permissions to a file
    #[cfg(unix)]
    pub fn apply_to_path(&self, path: &Path) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        // futimens only needs ownership, a read-only handle is enough
        fs::File::open(path)?.set_modified(self.modified)?;

        if let Some(mode) = self.permissions {
            fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        }

        Ok(())
    }

    #[cfg(not(unix))]
    pub fn apply_to_path(&self, path: &Path) -> std::io::Result<()> {
        let file = fs::OpenOptions::new().write(true).open(path)?;
        file.set_modified(self.modified)
    }
}
