//! Utility modules for the sync engine.

pub mod errors;
pub mod format;
pub mod logger;

pub use errors::{ReplaceStage, Role, SyncError, Result};
