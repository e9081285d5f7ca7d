//! Administrative surface: describe placement, force splits, merges and
//! migrations, decommission nodes, and cancel in-flight migrations.
//!
//! Forced operations go through exactly the same commit path as the
//! balancer's own proposals; admin is a client of the registry and
//! coordinator, never a back door around the epoch protocol.

use std::sync::Arc;

use serde::Serialize;

use heron_common::types::{Epoch, NodeId, TableId, TabletId};
use heron_common::{HeronResult, TabletError};

use crate::directory::{NodeDirectory, NodeState};
use crate::events::{TabletEvent, TabletEventKind, TabletEventLog};
use crate::load::LoadTracker;
use crate::migration::{MigrationCoordinator, MigrationOutcome};
use crate::model::{MigrationStage, ReplicaLocation, TabletReplica, TabletTransition, TokenRange};
use crate::registry::PlacementRegistry;

/// Per-tablet line of `describe` output.
#[derive(Debug, Clone, Serialize)]
pub struct TabletView {
    pub id: TabletId,
    pub range: TokenRange,
    pub replicas: Vec<TabletReplica>,
    /// Committed migration stage, if one is in flight.
    pub stage: Option<MigrationStage>,
    pub size_estimate: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableDescription {
    pub table: TableId,
    pub epoch: Epoch,
    pub replication_factor: usize,
    pub balancing_halted: bool,
    pub tablets: Vec<TabletView>,
}

pub struct TabletAdmin {
    registry: Arc<PlacementRegistry>,
    coordinator: Arc<MigrationCoordinator>,
    directory: Arc<NodeDirectory>,
    load: Arc<LoadTracker>,
    events: Arc<TabletEventLog>,
}

impl TabletAdmin {
    pub fn new(
        registry: Arc<PlacementRegistry>,
        coordinator: Arc<MigrationCoordinator>,
        directory: Arc<NodeDirectory>,
        load: Arc<LoadTracker>,
        events: Arc<TabletEventLog>,
    ) -> Self {
        Self {
            registry,
            coordinator,
            directory,
            load,
            events,
        }
    }

    /// Committed placement of `table`, with per-tablet stage and size
    /// estimates, for status tooling.
    pub fn describe(&self, table: TableId) -> HeronResult<TableDescription> {
        let snap = self.registry.snapshot(table)?;
        let load = self.load.snapshot();
        let tablets = snap
            .tablets
            .iter()
            .map(|t| TabletView {
                id: t.id,
                range: t.range,
                replicas: t.replicas.clone(),
                stage: t.migration.map(|m| m.stage),
                size_estimate: load.tablet_bytes(table, t.id),
            })
            .collect();
        Ok(TableDescription {
            table,
            epoch: snap.epoch,
            replication_factor: snap.rf,
            balancing_halted: self.registry.is_halted(table),
            tablets,
        })
    }

    /// Split `tablet` at its range midpoint, regardless of size.
    pub fn force_split(&self, table: TableId, tablet: TabletId) -> HeronResult<Epoch> {
        let snap = self.registry.snapshot(table)?;
        let epoch = self
            .registry
            .apply(table, snap.epoch, &TabletTransition::Split { tablet })?;
        self.load.forget_tablet(table, tablet);
        if let Some(old) = snap.get(tablet) {
            if let (Ok(fresh), Some(mid)) =
                (self.registry.snapshot(table), old.range.midpoint())
            {
                self.events.record(
                    table,
                    TabletEventKind::TabletSplit {
                        tablet,
                        left: fresh.lookup(old.range.start).id,
                        right: fresh.lookup(mid).id,
                    },
                );
            }
        }
        tracing::info!(table = %table, tablet = %tablet, epoch = %epoch, "forced split");
        Ok(epoch)
    }

    /// Merge `tablet` with its immediate right neighbour.
    pub fn force_merge(&self, table: TableId, tablet: TabletId) -> HeronResult<Epoch> {
        let snap = self.registry.snapshot(table)?;
        let idx = snap.index_of(tablet).ok_or(TabletError::TabletNotFound {
            table,
            tablet,
        })?;
        let right = snap
            .tablets
            .get(idx + 1)
            .map(|t| t.id)
            .ok_or_else(|| TabletError::InvalidTransition {
                tablet,
                detail: "no right neighbour to merge with".into(),
            })?;
        let start = snap.tablets[idx].range.start;
        let epoch = self.registry.apply(
            table,
            snap.epoch,
            &TabletTransition::Merge {
                left: tablet,
                right,
            },
        )?;
        self.load.forget_tablet(table, tablet);
        self.load.forget_tablet(table, right);
        if let Ok(fresh) = self.registry.snapshot(table) {
            self.events.record(
                table,
                TabletEventKind::TabletsMerged {
                    left: tablet,
                    right,
                    merged: fresh.lookup(start).id,
                },
            );
        }
        tracing::info!(table = %table, left = %tablet, right = %right, epoch = %epoch, "forced merge");
        Ok(epoch)
    }

    /// Move one replica of `tablet` to `destination`, blocking until
    /// the migration reaches a terminal outcome. The source is the
    /// first replica not sharing a node with the destination. A
    /// migration that degrades to cancelled (retry exhaustion, no
    /// bandwidth) is surfaced as a `Cancelled` error.
    pub fn force_migrate(
        &self,
        table: TableId,
        tablet: TabletId,
        destination: ReplicaLocation,
    ) -> HeronResult<MigrationOutcome> {
        if !self.directory.contains(destination.node) {
            return Err(TabletError::NodeNotFound(destination.node).into());
        }
        let snap = self.registry.snapshot(table)?;
        let t = snap.get(tablet).ok_or(TabletError::TabletNotFound {
            table,
            tablet,
        })?;
        if t.migration.is_some() {
            return Err(TabletError::MigrationInFlight { tablet }.into());
        }
        if t.has_replica_on_node(destination.node) {
            return Err(TabletError::InvalidTransition {
                tablet,
                detail: format!("already replicated on {}", destination.node),
            }
            .into());
        }
        let source = t
            .replicas
            .iter()
            .map(|r| r.location)
            .find(|loc| loc.node != destination.node)
            .ok_or_else(|| TabletError::InvalidTransition {
                tablet,
                detail: "no movable source replica".into(),
            })?;
        let size = self.load.snapshot().tablet_bytes(table, tablet).unwrap_or(0);
        match self
            .coordinator
            .migrate(table, tablet, source, destination, size)?
        {
            MigrationOutcome::Cancelled { reason } => {
                Err(TabletError::Cancelled { tablet, reason }.into())
            }
            outcome => Ok(outcome),
        }
    }

    /// Flag `node` for decommission; the balancer drains it with top
    /// priority from the next round on.
    pub fn decommission(&self, node: NodeId) -> HeronResult<()> {
        self.directory.set_state(node, NodeState::Draining)?;
        self.events
            .record_node(TabletEventKind::NodeDrainStarted { node });
        tracing::info!(node = %node, "node flagged for decommission");
        Ok(())
    }

    /// Undo a decommission flag before the node is removed.
    pub fn recommission(&self, node: NodeId) -> HeronResult<()> {
        self.directory.set_state(node, NodeState::Normal)?;
        self.events
            .record_node(TabletEventKind::NodeDrainFinished { node });
        tracing::info!(node = %node, "node decommission flag cleared");
        Ok(())
    }

    /// True once no tablet of any table holds a replica on `node`.
    pub fn is_drained(&self, node: NodeId) -> HeronResult<bool> {
        for table in self.registry.tables() {
            let snap = self.registry.snapshot(table)?;
            if !snap.tablets_on_node(node).is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Cancel an in-flight migration. Rejected once cleanup has
    /// committed; the migration is irreversible at that point.
    pub fn cancel_migration(&self, table: TableId, tablet: TabletId) -> HeronResult<()> {
        self.coordinator
            .cancel(table, tablet, "administrator request")
    }

    /// Re-validate a table halted after a committed invariant violation
    /// and resume automatic balancing if the state is sound again.
    pub fn resume_balancing(&self, table: TableId) -> HeronResult<()> {
        self.registry.resume_balancing(table)?;
        self.events
            .record(table, TabletEventKind::BalancingResumed);
        Ok(())
    }

    /// Most recent tablet lifecycle events, newest last.
    pub fn recent_events(&self, limit: usize) -> Vec<TabletEvent> {
        self.events.recent(limit)
    }
}
