//! The placement registry: the authoritative table → tablet-sequence
//! mapping, backed by the topology log.
//!
//! The registry's committed state is the only piece of mutable shared
//! state in the subsystem, and it is never mutated directly. Readers
//! get `Arc` snapshots; every mutation flows through `apply`, which
//! validates locally, then commits through the log's epoch-guarded
//! compare-and-swap. A `Conflict` means the caller lost an optimistic
//! race and must re-read.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use heron_common::types::{Epoch, TableId, Token};
use heron_common::{HeronResult, TabletError};

use crate::events::{TabletEventKind, TabletEventLog};
use crate::model::{ReplicaLocation, Tablet, TabletMap, TabletTransition};
use crate::topology::TopologyLog;

pub struct PlacementRegistry {
    log: Arc<dyn TopologyLog>,
    events: Arc<TabletEventLog>,
    /// Last committed snapshot per table. Kept in sync with the log by
    /// `apply`/`refresh`; refreshed wholesale on conflict.
    cache: RwLock<HashMap<TableId, Arc<TabletMap>>>,
    /// Tables whose automatic balancing is halted after a committed
    /// invariant violation was detected. Manual intervention only.
    halted: RwLock<HashSet<TableId>>,
}

impl PlacementRegistry {
    pub fn new(log: Arc<dyn TopologyLog>, events: Arc<TabletEventLog>) -> Arc<Self> {
        let registry = Arc::new(Self {
            log,
            events,
            cache: RwLock::new(HashMap::new()),
            halted: RwLock::new(HashSet::new()),
        });
        // Crash recovery: repopulate the cache from the log.
        for table in registry.log.tables() {
            let _ = registry.refresh(table);
        }
        registry
    }

    /// Create a table's tablet sequence: `tablet_count` equal ranges,
    /// `rf` replicas each, assigned round-robin over `shards`.
    pub fn create_table(
        &self,
        table: TableId,
        tablet_count: usize,
        rf: usize,
        shards: &[ReplicaLocation],
    ) -> HeronResult<Arc<TabletMap>> {
        let mut map = TabletMap::initial(table, tablet_count, rf, shards)?;
        let committed = self.log.propose(table, None, map.clone())?;
        map.epoch = committed;
        let snap = Arc::new(map);
        self.cache.write().insert(table, snap.clone());
        self.events
            .record(table, TabletEventKind::TableCreated { tablet_count });
        tracing::info!(
            table = %table,
            tablets = tablet_count,
            rf,
            epoch = %committed,
            "created tablet map"
        );
        Ok(snap)
    }

    pub fn drop_table(&self, table: TableId) {
        self.log.remove(table);
        self.cache.write().remove(&table);
        self.halted.write().remove(&table);
        self.events.record(table, TabletEventKind::TableDropped);
        tracing::info!(table = %table, "dropped tablet map");
    }

    /// Immutable consistent view of the table's committed placement.
    /// Readers never observe a partially applied transition.
    pub fn snapshot(&self, table: TableId) -> HeronResult<Arc<TabletMap>> {
        if let Some(snap) = self.cache.read().get(&table) {
            return Ok(snap.clone());
        }
        self.refresh(table)
    }

    /// The tablet serving `token`, from the latest committed snapshot.
    pub fn lookup(&self, table: TableId, token: Token) -> HeronResult<Tablet> {
        Ok(self.snapshot(table)?.lookup(token).clone())
    }

    /// Tables known to the registry, sorted for deterministic iteration.
    pub fn tables(&self) -> Vec<TableId> {
        let mut tables: Vec<TableId> = self.cache.read().keys().copied().collect();
        tables.sort();
        tables
    }

    /// Apply a validated transition if `expected` still matches the
    /// committed epoch. On success the committed epoch is returned and
    /// the cached snapshot advances; on a lost race the cache is
    /// refreshed and `Conflict` is returned for the caller to retry on
    /// its own schedule.
    pub fn apply(
        &self,
        table: TableId,
        expected: Epoch,
        transition: &TabletTransition,
    ) -> HeronResult<Epoch> {
        let snap = self.snapshot(table)?;
        if snap.epoch != expected {
            return Err(TabletError::Conflict {
                table,
                expected,
                actual: snap.epoch,
            }
            .into());
        }

        // Local precondition check; an invalid transition never reaches
        // the log.
        let mut next = snap.apply_transition(transition)?;

        match self.log.propose(table, Some(expected), next.clone()) {
            Ok(committed) => {
                next.epoch = committed;
                self.cache.write().insert(table, Arc::new(next));
                tracing::debug!(
                    table = %table,
                    tablet = %transition.tablet(),
                    epoch = %committed,
                    "committed tablet transition"
                );
                Ok(committed)
            }
            Err(e @ TabletError::Conflict { .. }) => {
                // The log moved under us: refresh so the next attempt
                // validates against fresh state.
                let _ = self.refresh(table);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-read a table's committed state from the log, validating it on
    /// the way in. A violation in *committed* state indicates
    /// corruption: balancing for the table is halted pending manual
    /// intervention.
    pub fn refresh(&self, table: TableId) -> HeronResult<Arc<TabletMap>> {
        let map = self
            .log
            .read(table)
            .ok_or(TabletError::TableNotFound(table))?;
        if let Err(violation) = map.validate() {
            self.halted.write().insert(table);
            self.events.record(
                table,
                TabletEventKind::BalancingHalted {
                    detail: violation.to_string(),
                },
            );
            tracing::error!(
                table = %table,
                error = %violation,
                "committed tablet map violates invariants; balancing halted for table"
            );
            return Err(violation.into());
        }
        let snap = Arc::new(map);
        self.cache.write().insert(table, snap.clone());
        Ok(snap)
    }

    /// True while automatic balancing for the table is halted.
    pub fn is_halted(&self, table: TableId) -> bool {
        self.halted.read().contains(&table)
    }

    /// Manual intervention: re-validate the committed state and, if it
    /// is sound again, resume automatic balancing.
    pub fn resume_balancing(&self, table: TableId) -> HeronResult<()> {
        self.refresh(table)?;
        self.halted.write().remove(&table);
        tracing::info!(table = %table, "balancing resumed");
        Ok(())
    }
}
