//! The topology log seam: a linearizable, durable, append-only history
//! of placement commits, consumed through a narrow trait.
//!
//! The real implementation lives in the consensus layer and is an
//! external collaborator. `InMemoryTopologyLog` provides the same
//! commit-or-conflict contract in process, for tests and single-node
//! deployments: a single mutex makes every proposal a linearizable
//! epoch-guarded compare-and-swap.

use std::collections::HashMap;

use parking_lot::Mutex;

use heron_common::types::{Epoch, TableId};
use heron_common::TabletError;

use crate::model::TabletMap;

/// Durable, linearizable store of all placement-metadata commits.
///
/// `propose` commits `map` as the table's new state only if the
/// currently committed epoch matches `expected` (`None` = the table
/// must not exist yet). On a mismatch it fails with
/// `TabletError::Conflict` and commits nothing.
pub trait TopologyLog: Send + Sync {
    fn propose(
        &self,
        table: TableId,
        expected: Option<Epoch>,
        map: TabletMap,
    ) -> Result<Epoch, TabletError>;

    /// Full-state read-back of the last committed map, used after a
    /// crash and on conflict refresh.
    fn read(&self, table: TableId) -> Option<TabletMap>;

    fn tables(&self) -> Vec<TableId>;

    /// Remove a dropped table's history.
    fn remove(&self, table: TableId);
}

/// In-process topology log. One mutex over the whole committed state
/// keeps every propose/read linearizable.
pub struct InMemoryTopologyLog {
    state: Mutex<HashMap<TableId, TabletMap>>,
}

impl InMemoryTopologyLog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryTopologyLog {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyLog for InMemoryTopologyLog {
    fn propose(
        &self,
        table: TableId,
        expected: Option<Epoch>,
        mut map: TabletMap,
    ) -> Result<Epoch, TabletError> {
        let mut state = self.state.lock();
        let current = state.get(&table).map(|m| m.epoch);
        match (expected, current) {
            (None, None) => {
                map.epoch = Epoch(1);
            }
            (None, Some(actual)) => {
                return Err(TabletError::Conflict {
                    table,
                    expected: Epoch(0),
                    actual,
                });
            }
            (Some(e), Some(actual)) if e == actual => {
                map.epoch = e.next();
            }
            (Some(e), Some(actual)) => {
                return Err(TabletError::Conflict {
                    table,
                    expected: e,
                    actual,
                });
            }
            (Some(e), None) => {
                return Err(TabletError::Conflict {
                    table,
                    expected: e,
                    actual: Epoch(0),
                });
            }
        }
        let committed = map.epoch;
        state.insert(table, map);
        Ok(committed)
    }

    fn read(&self, table: TableId) -> Option<TabletMap> {
        self.state.lock().get(&table).cloned()
    }

    fn tables(&self) -> Vec<TableId> {
        let mut tables: Vec<TableId> = self.state.lock().keys().copied().collect();
        tables.sort();
        tables
    }

    fn remove(&self, table: TableId) {
        self.state.lock().remove(&table);
    }
}
