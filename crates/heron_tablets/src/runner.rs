//! Background balancing loop: one planning round per interval, each
//! accepted migration handed to its own worker thread.
//!
//! The loop never blocks on a migration. Splits and merges are
//! metadata-only commits and are applied inline; a commit lost to a
//! `Conflict` is dropped and reconsidered next round against fresh
//! state.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use heron_common::shutdown::ShutdownSignal;
use heron_common::types::{TableId, TabletId};
use heron_common::HeronError;

use crate::balancer::{LoadBalancer, PlanKind};
use crate::events::{TabletEventKind, TabletEventLog};
use crate::load::LoadTracker;
use crate::migration::MigrationCoordinator;
use crate::model::{ReplicaLocation, TabletTransition};
use crate::registry::PlacementRegistry;

pub struct BalancerRunner {
    balancer: LoadBalancer,
    coordinator: Arc<MigrationCoordinator>,
    registry: Arc<PlacementRegistry>,
    load: Arc<LoadTracker>,
    events: Arc<TabletEventLog>,
    interval: Duration,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Owner of the running balancer thread. Dropping the handle requests
/// shutdown and joins the loop.
pub struct BalancerRunnerHandle {
    shutdown: ShutdownSignal,
    thread: Option<JoinHandle<()>>,
}

impl BalancerRunnerHandle {
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for BalancerRunnerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl BalancerRunner {
    pub fn new(
        balancer: LoadBalancer,
        coordinator: Arc<MigrationCoordinator>,
        registry: Arc<PlacementRegistry>,
        load: Arc<LoadTracker>,
        events: Arc<TabletEventLog>,
        interval_ms: u64,
    ) -> Self {
        Self {
            balancer,
            coordinator,
            registry,
            load,
            events,
            interval: Duration::from_millis(interval_ms),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the recurring balancing loop. The first action is crash
    /// recovery: every in-flight migration committed in the log is
    /// resumed from its last committed stage.
    pub fn start(self) -> Result<BalancerRunnerHandle, HeronError> {
        let shutdown = ShutdownSignal::new();
        let runner = Arc::new(self);
        let thread = {
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("tablet-balancer".into())
                .spawn(move || runner.run(shutdown))
                .map_err(|e| {
                    HeronError::Internal(format!("failed to spawn balancer thread: {e}"))
                })?
        };
        Ok(BalancerRunnerHandle {
            shutdown,
            thread: Some(thread),
        })
    }

    fn run(&self, shutdown: ShutdownSignal) {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "balancer started");
        self.resume_all();
        loop {
            if shutdown.wait_timeout(self.interval) {
                break;
            }
            self.run_round();
            self.reap_workers();
        }
        self.join_workers();
        tracing::info!("balancer stopped");
    }

    fn resume_all(&self) {
        for table in self.registry.tables() {
            match self.coordinator.resume(table) {
                Ok(outcomes) => {
                    for (tablet, outcome) in outcomes {
                        tracing::info!(
                            table = %table,
                            tablet = %tablet,
                            ?outcome,
                            "resumed migration settled"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(table = %table, error = %e, "resume failed");
                }
            }
        }
    }

    /// One planning round: plan against a load snapshot, then submit.
    /// Migrations go to worker threads; splits and merges commit inline.
    pub fn run_round(&self) {
        let load = self.load.snapshot();
        let in_flight = self.coordinator.in_flight_count();
        let plans = self.balancer.plan_round(&load, in_flight);
        if plans.is_empty() {
            return;
        }
        tracing::debug!(proposals = plans.len(), in_flight, "balancing round planned");
        for plan in plans {
            match plan.kind {
                PlanKind::Migrate { from, to } => {
                    self.spawn_migration(plan.table, plan.tablet, from, to, plan.size_estimate);
                }
                PlanKind::Split => self.apply_split(plan.table, plan.tablet),
                PlanKind::Merge { right } => self.apply_merge(plan.table, plan.tablet, right),
            }
        }
    }

    fn spawn_migration(
        &self,
        table: TableId,
        tablet: TabletId,
        from: ReplicaLocation,
        to: ReplicaLocation,
        size_estimate: u64,
    ) {
        let coordinator = self.coordinator.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("tablet-migrate-{tablet}"))
            .spawn(move || {
                match coordinator.migrate(table, tablet, from, to, size_estimate) {
                    Ok(outcome) => {
                        tracing::debug!(table = %table, tablet = %tablet, ?outcome, "migration settled");
                    }
                    Err(e) if e.is_retryable() => {
                        // Lost a race; the next round replans from
                        // fresh state.
                        tracing::debug!(table = %table, tablet = %tablet, error = %e, "migration dropped");
                    }
                    Err(e) => {
                        tracing::warn!(table = %table, tablet = %tablet, error = %e, "migration failed");
                    }
                }
            });
        match spawned {
            Ok(handle) => self.workers.lock().push(handle),
            Err(e) => tracing::error!(error = %e, "failed to spawn migration worker"),
        }
    }

    fn apply_split(&self, table: TableId, tablet: TabletId) {
        let snap = match self.registry.snapshot(table) {
            Ok(snap) => snap,
            Err(e) => {
                tracing::warn!(table = %table, error = %e, "split skipped");
                return;
            }
        };
        let old = match snap.get(tablet) {
            Some(t) => t.clone(),
            None => return,
        };
        match self
            .registry
            .apply(table, snap.epoch, &TabletTransition::Split { tablet })
        {
            Ok(epoch) => {
                self.load.forget_tablet(table, tablet);
                if let (Ok(fresh), Some(mid)) =
                    (self.registry.snapshot(table), old.range.midpoint())
                {
                    let left = fresh.lookup(old.range.start).id;
                    let right = fresh.lookup(mid).id;
                    self.events.record(
                        table,
                        TabletEventKind::TabletSplit {
                            tablet,
                            left,
                            right,
                        },
                    );
                    tracing::info!(
                        table = %table,
                        tablet = %tablet,
                        left = %left,
                        right = %right,
                        epoch = %epoch,
                        "tablet split"
                    );
                }
            }
            Err(e) if e.is_retryable() => {
                tracing::debug!(table = %table, tablet = %tablet, error = %e, "split dropped");
            }
            Err(e) => {
                tracing::warn!(table = %table, tablet = %tablet, error = %e, "split failed");
            }
        }
    }

    fn apply_merge(&self, table: TableId, left: TabletId, right: TabletId) {
        let snap = match self.registry.snapshot(table) {
            Ok(snap) => snap,
            Err(e) => {
                tracing::warn!(table = %table, error = %e, "merge skipped");
                return;
            }
        };
        let start = match snap.get(left) {
            Some(t) => t.range.start,
            None => return,
        };
        match self.registry.apply(
            table,
            snap.epoch,
            &TabletTransition::Merge { left, right },
        ) {
            Ok(epoch) => {
                self.load.forget_tablet(table, left);
                self.load.forget_tablet(table, right);
                if let Ok(fresh) = self.registry.snapshot(table) {
                    let merged = fresh.lookup(start).id;
                    self.events.record(
                        table,
                        TabletEventKind::TabletsMerged {
                            left,
                            right,
                            merged,
                        },
                    );
                    tracing::info!(
                        table = %table,
                        left = %left,
                        right = %right,
                        merged = %merged,
                        epoch = %epoch,
                        "tablets merged"
                    );
                }
            }
            Err(e) if e.is_retryable() => {
                tracing::debug!(table = %table, left = %left, right = %right, error = %e, "merge dropped");
            }
            Err(e) => {
                tracing::warn!(table = %table, left = %left, right = %right, error = %e, "merge failed");
            }
        }
    }

    fn reap_workers(&self) {
        self.workers.lock().retain(|w| !w.is_finished());
    }

    fn join_workers(&self) {
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::LoadBalancer;
    use crate::bandwidth::BandwidthLimiter;
    use crate::directory::NodeDirectory;
    use crate::streamer::ScriptedStreamer;
    use crate::topology::InMemoryTopologyLog;
    use heron_common::config::{BalancerConfig, BandwidthConfig, MigrationConfig};
    use heron_common::types::NodeId;
    use std::time::Instant;

    struct Stack {
        registry: Arc<PlacementRegistry>,
        directory: Arc<NodeDirectory>,
        coordinator: Arc<MigrationCoordinator>,
        load: Arc<LoadTracker>,
        events: Arc<TabletEventLog>,
        runner: BalancerRunner,
    }

    fn stack(node_count: u64) -> Stack {
        let events = Arc::new(TabletEventLog::default());
        let registry =
            PlacementRegistry::new(Arc::new(InMemoryTopologyLog::new()), events.clone());
        let directory = Arc::new(NodeDirectory::new());
        for n in 1..=node_count {
            directory.add_node(NodeId(n), 1);
        }
        let load = Arc::new(LoadTracker::new());
        let bandwidth = Arc::new(BandwidthLimiter::new(BandwidthConfig {
            bytes_per_sec: 1 << 30,
            burst_bytes: 1 << 30,
            max_wait_ms: 1_000,
        }));
        let coordinator = Arc::new(MigrationCoordinator::new(
            registry.clone(),
            Arc::new(ScriptedStreamer::new()),
            bandwidth,
            events.clone(),
            MigrationConfig {
                max_transfer_retries: 3,
                retry_backoff_ms: 1,
                transfer_timeout_ms: 1_000,
            },
        ));
        let balancer = LoadBalancer::new(
            registry.clone(),
            directory.clone(),
            BalancerConfig::default(),
        );
        let runner = BalancerRunner::new(
            balancer,
            coordinator.clone(),
            registry.clone(),
            load.clone(),
            events.clone(),
            5,
        );
        Stack {
            registry,
            directory,
            coordinator,
            load,
            events,
            runner,
        }
    }

    fn wait_for_quiesce(coordinator: &MigrationCoordinator) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while coordinator.in_flight_count() > 0 {
            assert!(Instant::now() < deadline, "migrations did not settle");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_round_fills_new_node() {
        let s = stack(3);
        let table = TableId(1);
        s.registry
            .create_table(table, 4, 3, &s.directory.all_shards())
            .unwrap();
        s.directory.add_node(NodeId(4), 1);

        // Bounded number of rounds until per-node counts differ by at
        // most one.
        for _ in 0..8 {
            s.runner.run_round();
            wait_for_quiesce(&s.coordinator);
        }

        let snap = s.registry.snapshot(table).unwrap();
        snap.validate().unwrap();
        let counts: Vec<usize> = (1..=4)
            .map(|n| snap.tablets_on_node(NodeId(n)).len())
            .collect();
        let max = *counts.iter().max().unwrap();
        let min = *counts.iter().min().unwrap();
        assert!(max - min <= 1, "unbalanced counts: {counts:?}");
        assert!(counts[3] >= 2, "new node never filled: {counts:?}");
    }

    #[test]
    fn test_round_applies_split() {
        let s = stack(3);
        let table = TableId(1);
        let snap = s
            .registry
            .create_table(table, 4, 3, &s.directory.all_shards())
            .unwrap();
        let big = snap.tablets[1].id;
        let old_range = snap.tablets[1].range;
        s.load.record_tablet(table, big, 20 << 30);

        s.runner.run_round();

        let fresh = s.registry.snapshot(table).unwrap();
        fresh.validate().unwrap();
        assert_eq!(fresh.tablets.len(), 5);
        assert!(fresh.get(big).is_none());
        let left = fresh.lookup(old_range.start);
        assert_eq!(left.range.start, old_range.start);
        assert_eq!(left.range.end, old_range.midpoint().unwrap());
        // The stale estimate is gone, so the next round does not split
        // the halves again.
        assert!(s.load.snapshot().tablet_bytes(table, big).is_none());
        s.runner.run_round();
        assert_eq!(s.registry.snapshot(table).unwrap().tablets.len(), 5);
    }

    #[test]
    fn test_round_applies_merge() {
        let s = stack(3);
        let table = TableId(1);
        let snap = s
            .registry
            .create_table(table, 4, 3, &s.directory.all_shards())
            .unwrap();
        let left = snap.tablets[0].id;
        let right = snap.tablets[1].id;
        s.load.record_tablet(table, left, 1024);
        s.load.record_tablet(table, right, 1024);

        s.runner.run_round();

        let fresh = s.registry.snapshot(table).unwrap();
        fresh.validate().unwrap();
        assert_eq!(fresh.tablets.len(), 3);
        assert!(fresh.get(left).is_none());
        assert!(fresh.get(right).is_none());
        let merged = s
            .events
            .recent_for_table(table, 10)
            .into_iter()
            .any(|e| matches!(e.kind, TabletEventKind::TabletsMerged { .. }));
        assert!(merged);
    }

    #[test]
    fn test_start_resumes_and_shuts_down_cleanly() {
        let s = stack(3);
        let table = TableId(1);
        let snap = s
            .registry
            .create_table(table, 4, 3, &s.directory.all_shards())
            .unwrap();
        // A migration stranded mid-flight by a "crash".
        let t = snap.tablets[0].id;
        let source = snap.tablets[0].replicas[0].location;
        s.registry
            .apply(
                table,
                snap.epoch,
                &TabletTransition::BeginMigration {
                    tablet: t,
                    source,
                    target: ReplicaLocation::new(9, 0),
                },
            )
            .unwrap();

        let handle = s.runner.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let fresh = s.registry.snapshot(table).unwrap();
            if fresh.migrations_in_flight() == 0 {
                break;
            }
            assert!(Instant::now() < deadline, "stranded migration never settled");
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();

        let fresh = s.registry.snapshot(table).unwrap();
        fresh.validate().unwrap();
    }
}
