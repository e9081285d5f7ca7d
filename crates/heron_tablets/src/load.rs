//! Load observations feeding the balancer.
//!
//! Per-shard sizes and per-tablet size estimates arrive from the
//! metrics source on its own refresh schedule. They are read-mostly,
//! eventually-consistent inputs; staleness is tolerated, and a missing
//! estimate simply means "unknown" (never split on unknown).

use std::collections::HashMap;

use parking_lot::RwLock;

use heron_common::types::{TableId, TabletId};

use crate::model::ReplicaLocation;

/// Point-in-time copy of the observed loads, handed to one balancing
/// round so the round sees a stable view.
#[derive(Debug, Clone, Default)]
pub struct LoadSnapshot {
    shard_bytes: HashMap<ReplicaLocation, u64>,
    tablet_bytes: HashMap<(TableId, TabletId), u64>,
}

impl LoadSnapshot {
    pub fn shard_bytes(&self, loc: ReplicaLocation) -> u64 {
        self.shard_bytes.get(&loc).copied().unwrap_or(0)
    }

    /// Estimated on-disk size of a tablet, if one has been observed.
    pub fn tablet_bytes(&self, table: TableId, tablet: TabletId) -> Option<u64> {
        self.tablet_bytes.get(&(table, tablet)).copied()
    }
}

/// Accumulates load observations between balancing rounds.
pub struct LoadTracker {
    shard_bytes: RwLock<HashMap<ReplicaLocation, u64>>,
    tablet_bytes: RwLock<HashMap<(TableId, TabletId), u64>>,
}

impl LoadTracker {
    pub fn new() -> Self {
        Self {
            shard_bytes: RwLock::new(HashMap::new()),
            tablet_bytes: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_shard(&self, loc: ReplicaLocation, size_bytes: u64) {
        self.shard_bytes.write().insert(loc, size_bytes);
    }

    pub fn record_tablet(&self, table: TableId, tablet: TabletId, size_bytes: u64) {
        self.tablet_bytes.write().insert((table, tablet), size_bytes);
    }

    /// Forget a tablet's estimate, e.g. after it was split or merged
    /// away (fresh ids get fresh estimates).
    pub fn forget_tablet(&self, table: TableId, tablet: TabletId) {
        self.tablet_bytes.write().remove(&(table, tablet));
    }

    pub fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot {
            shard_bytes: self.shard_bytes.read().clone(),
            tablet_bytes: self.tablet_bytes.read().clone(),
        }
    }
}

impl Default for LoadTracker {
    fn default() -> Self {
        Self::new()
    }
}
