//! Filesystem primitives: walking, copying, replacing, timestamps.

pub mod copy;
pub mod metadata;
pub mod replace;
pub mod timestamp;
pub mod walker;

pub use copy::{copy_tree, CopyStats};
pub use replace::{replace_tree, replace_tree_with, FsRenamer, Renamer};
pub use timestamp::{last_modified, Fingerprint, Freshness};
