//! Save Sync Library
//!
//! Keeps paired emulator save directories consistent: newest-wins
//! reconcile, backup-then-replace syncs and a debounced filesystem watcher.

pub mod backup;
pub mod config;
pub mod control;
pub mod engine;
pub mod events;
pub mod fs;
pub mod registry;
pub mod utils;
pub mod watcher;

// Re-export commonly used types
pub use config::Config;
pub use engine::{SyncEngine, SyncReport, SyncResult};
pub use registry::{Direction, PairRegistry, SavePair, Side};
pub use utils::{Result, SyncError};
