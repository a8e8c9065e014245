//! Game save-path pairs driving the engine and watcher.
//!
//! Built once from configuration and shared read-only (`Arc<PairRegistry>`)
//! for the rest of the session.

use crate::config::PairConfig;
use crate::utils::{Result, SyncError};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// One side of a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Source,
    Dest,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Source => Side::Dest,
            Side::Dest => Side::Source,
        }
    }
}

/// Direction of a one-way sync within a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    SourceToDest,
    DestToSource,
}

impl Direction {
    /// Direction that copies from `side` onto the other side.
    pub fn from_side(side: Side) -> Direction {
        match side {
            Side::Source => Direction::SourceToDest,
            Side::Dest => Direction::DestToSource,
        }
    }

    /// Side the copy reads from
    pub fn origin(self) -> Side {
        match self {
            Direction::SourceToDest => Side::Source,
            Direction::DestToSource => Side::Dest,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::SourceToDest => f.write_str("source -> dest"),
            Direction::DestToSource => f.write_str("dest -> source"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavePair {
    pub name: String,
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
}

impl SavePair {
    pub fn new(name: impl Into<String>, source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source_path: source.into(),
            dest_path: dest.into(),
        }
    }

    pub fn path(&self, side: Side) -> &Path {
        match side {
            Side::Source => &self.source_path,
            Side::Dest => &self.dest_path,
        }
    }

    /// `(from, to)` paths for a direction
    pub fn endpoints(&self, direction: Direction) -> (&Path, &Path) {
        let from = direction.origin();
        (self.path(from), self.path(from.other()))
    }
}

/// Ordered, name-unique list of pairs
#[derive(Debug, Clone, Default)]
pub struct PairRegistry {
    pairs: Vec<SavePair>,
}

impl PairRegistry {
    /// Build from pairs, rejecting duplicate or empty names. Paths are not
    /// checked here; each operation checks them when it runs.
    pub fn new(pairs: Vec<SavePair>) -> Result<Self> {
        let mut seen = HashSet::new();
        for pair in &pairs {
            if pair.name.trim().is_empty() {
                return Err(SyncError::Config("pair name must not be empty".to_string()));
            }
            if !seen.insert(pair.name.as_str()) {
                return Err(SyncError::Config(format!("duplicate pair name '{}'", pair.name)));
            }
        }
        Ok(Self { pairs })
    }

    pub fn from_config(games: &[PairConfig]) -> Result<Self> {
        Self::new(
            games
                .iter()
                .map(|g| SavePair::new(&g.name, &g.source_save_path, &g.dest_save_path))
                .collect(),
        )
    }

    pub fn pairs(&self) -> &[SavePair] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SavePair> {
        self.pairs.get(index)
    }

    pub fn by_name(&self, name: &str) -> Option<&SavePair> {
        self.pairs.iter().find(|p| p.name == name)
    }

    /// Resolve a pair by exact name, falling back to a 0-based index.
    pub fn resolve(&self, key: &str) -> Result<&SavePair> {
        self.by_name(key)
            .or_else(|| key.parse::<usize>().ok().and_then(|i| self.get(i)))
            .ok_or_else(|| SyncError::UnknownPair(key.to_string()))
    }

    /// Pair whose endpoints are exactly `a` and `b`, in either order.
    pub fn find_by_paths(&self, a: &Path, b: &Path) -> Option<&SavePair> {
        self.pairs.iter().find(|p| {
            (p.source_path == a && p.dest_path == b) || (p.source_path == b && p.dest_path == a)
        })
    }
}
