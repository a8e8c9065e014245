//! Newest-wins decision for a pair.

use crate::fs::Freshness;
use crate::registry::Direction;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Timestamps equal or within tolerance
    InSync,
    BothEmpty,
    Sync(Direction),
}

/// Decide which way (if any) a pair should sync.
///
/// The newer side wins only when it leads by strictly more than
/// `tolerance`. An empty side always loses to a non-empty one.
pub fn decide(source: Freshness, dest: Freshness, tolerance: Duration) -> Decision {
    match (source, dest) {
        (Freshness::Empty, Freshness::Empty) => Decision::BothEmpty,
        (Freshness::Modified(_), Freshness::Empty) => Decision::Sync(Direction::SourceToDest),
        (Freshness::Empty, Freshness::Modified(_)) => Decision::Sync(Direction::DestToSource),
        (Freshness::Modified(s), Freshness::Modified(d)) => {
            if let Ok(lead) = s.duration_since(d) {
                if lead > tolerance {
                    return Decision::Sync(Direction::SourceToDest);
                }
            }
            if let Ok(lead) = d.duration_since(s) {
                if lead > tolerance {
                    return Decision::Sync(Direction::DestToSource);
                }
            }
            Decision::InSync
        }
    }
}
