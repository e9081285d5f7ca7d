//! Migration coordinator: drives one tablet's replica move through the
//! staged state machine, committing every stage through the topology
//! log before performing its side effect.
//!
//! Commit-before-side-effect plus idempotent side effects make a crash
//! at any point recoverable: `resume` re-reads the committed stage and
//! redoes at most one side effect. Cancellation is possible at every
//! stage boundary up to `Cleanup`; once cleanup commits, the outgoing
//! replica's data is already condemned and the migration can only run
//! forward.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use heron_common::config::MigrationConfig;
use heron_common::types::{TableId, TabletId};
use heron_common::{HeronError, HeronResult, TabletError};

use crate::bandwidth::BandwidthLimiter;
use crate::events::{TabletEventKind, TabletEventLog};
use crate::model::{MigrationStage, ReplicaLocation, Tablet, TabletTransition, TokenRange};
use crate::registry::PlacementRegistry;
use crate::streamer::{Streamer, TransferError};

/// Terminal state of one coordinated migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The target holds the data and the source replica is gone.
    Completed,
    /// Aborted before the point of no return; the tablet is back to its
    /// quiescent replica set.
    Cancelled { reason: String },
    /// The committed state no longer matches what this driver was
    /// doing: another actor finished, cancelled, or replaced the
    /// migration. Nothing further to do here.
    Superseded,
}

enum CommitResult {
    Committed,
    Superseded,
}

pub struct MigrationCoordinator {
    registry: Arc<PlacementRegistry>,
    streamer: Arc<dyn Streamer>,
    bandwidth: Arc<BandwidthLimiter>,
    events: Arc<TabletEventLog>,
    config: MigrationConfig,
    /// One entry per migration this process is actively driving. The
    /// flag requests cooperative cancellation.
    in_flight: DashMap<(TableId, TabletId), Arc<AtomicBool>>,
}

impl MigrationCoordinator {
    pub fn new(
        registry: Arc<PlacementRegistry>,
        streamer: Arc<dyn Streamer>,
        bandwidth: Arc<BandwidthLimiter>,
        events: Arc<TabletEventLog>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            registry,
            streamer,
            bandwidth,
            events,
            config,
            in_flight: DashMap::new(),
        }
    }

    /// Migrations this process is currently driving.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Move one replica of `tablet` from `source` to `target`, driving
    /// the full state machine to a terminal outcome. Blocks for the
    /// duration; the balancer runner calls this from worker threads.
    ///
    /// `size_estimate` is the tablet's expected on-disk size, charged
    /// against the shared streaming bandwidth budget.
    pub fn migrate(
        &self,
        table: TableId,
        tablet: TabletId,
        source: ReplicaLocation,
        target: ReplicaLocation,
        size_estimate: u64,
    ) -> HeronResult<MigrationOutcome> {
        let cancel = self.register(table, tablet)?;
        let result = self.drive_new(table, tablet, source, target, size_estimate, &cancel);
        self.in_flight.remove(&(table, tablet));
        result
    }

    /// Pick up every in-flight migration committed for `table` and
    /// drive each to a terminal outcome, starting from its committed
    /// stage. Called once after process start.
    pub fn resume(&self, table: TableId) -> HeronResult<Vec<(TabletId, MigrationOutcome)>> {
        let snap = self.registry.snapshot(table)?;
        let mut outcomes = Vec::new();
        for t in &snap.tablets {
            let m = match t.migration {
                Some(m) => m,
                None => continue,
            };
            let cancel = match self.register(table, t.id) {
                Ok(flag) => flag,
                // Already being driven here; leave it alone.
                Err(_) => continue,
            };
            tracing::info!(
                table = %table,
                tablet = %t.id,
                stage = %m.stage,
                "resuming in-flight migration"
            );
            let result = self.drive_stages(
                table, t.id, m.source, m.target, 0, &cancel, m.stage, false,
            );
            self.in_flight.remove(&(table, t.id));
            outcomes.push((t.id, result?));
        }
        Ok(outcomes)
    }

    /// Request cancellation of `tablet`'s migration. If this process is
    /// driving it, the driver aborts at the next stage boundary;
    /// otherwise the cancellation is committed directly. Fails with
    /// `PastPointOfNoReturn` once cleanup has committed.
    pub fn cancel(&self, table: TableId, tablet: TabletId, reason: &str) -> HeronResult<()> {
        if let Some(flag) = self.in_flight.get(&(table, tablet)) {
            flag.store(true, Ordering::SeqCst);
            tracing::info!(
                table = %table,
                tablet = %tablet,
                reason,
                "cancellation requested for active migration"
            );
            return Ok(());
        }

        let snap = self.registry.snapshot(table)?;
        let t = snap.get(tablet).ok_or(TabletError::TabletNotFound {
            table,
            tablet,
        })?;
        let m = t.migration.ok_or_else(|| TabletError::InvalidTransition {
            tablet,
            detail: "no migration in flight".into(),
        })?;
        if m.stage.is_past_point_of_no_return() {
            return Err(TabletError::PastPointOfNoReturn { tablet }.into());
        }

        match self.commit_step(
            table,
            &TabletTransition::CancelMigration { tablet },
            |t| matches!(t.migration, Some(m) if !m.stage.is_past_point_of_no_return()),
        )? {
            CommitResult::Committed => {
                self.streamer.abort(table, tablet, m.target);
                self.events.record(
                    table,
                    TabletEventKind::MigrationCancelled {
                        tablet,
                        reason: reason.into(),
                    },
                );
                Ok(())
            }
            CommitResult::Superseded => Ok(()),
        }
    }

    // ── Driving ──

    fn register(&self, table: TableId, tablet: TabletId) -> HeronResult<Arc<AtomicBool>> {
        let flag = Arc::new(AtomicBool::new(false));
        match self.in_flight.entry((table, tablet)) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(TabletError::MigrationInFlight { tablet }.into())
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(flag.clone());
                Ok(flag)
            }
        }
    }

    fn drive_new(
        &self,
        table: TableId,
        tablet: TabletId,
        source: ReplicaLocation,
        target: ReplicaLocation,
        size_estimate: u64,
        cancel: &AtomicBool,
    ) -> HeronResult<MigrationOutcome> {
        let begin = TabletTransition::BeginMigration {
            tablet,
            source,
            target,
        };
        match self.commit_step(table, &begin, |t| {
            t.migration.is_none() && t.has_replica_at(source) && !t.has_replica_at(target)
        })? {
            CommitResult::Committed => {}
            CommitResult::Superseded => return Ok(MigrationOutcome::Superseded),
        }
        self.events.record(
            table,
            TabletEventKind::MigrationStarted {
                tablet,
                source,
                target,
            },
        );
        tracing::info!(
            table = %table,
            tablet = %tablet,
            source = %source,
            target = %target,
            "migration started"
        );
        self.drive_stages(
            table,
            tablet,
            source,
            target,
            size_estimate,
            cancel,
            MigrationStage::Preparing,
            false,
        )
    }

    /// Run the state machine forward from `stage` (already committed)
    /// until a terminal outcome. `acquired` says whether this driver
    /// already holds the bandwidth budget.
    #[allow(clippy::too_many_arguments)]
    fn drive_stages(
        &self,
        table: TableId,
        tablet: TabletId,
        source: ReplicaLocation,
        target: ReplicaLocation,
        size_estimate: u64,
        cancel: &AtomicBool,
        mut stage: MigrationStage,
        mut acquired: bool,
    ) -> HeronResult<MigrationOutcome> {
        loop {
            match stage {
                MigrationStage::Preparing => {
                    if cancel.load(Ordering::SeqCst) {
                        return self.cancel_committed(
                            table, tablet, target, acquired, size_estimate,
                            "cancelled by request",
                        );
                    }
                    if !acquired {
                        if let Err(e) = self.bandwidth.acquire(size_estimate) {
                            tracing::warn!(
                                table = %table,
                                tablet = %tablet,
                                error = %e,
                                "bandwidth budget unavailable, cancelling migration"
                            );
                            return self.cancel_committed(
                                table, tablet, target, false, size_estimate,
                                "bandwidth budget unavailable",
                            );
                        }
                        acquired = true;
                    }
                    match self.advance(table, tablet, stage)? {
                        CommitResult::Committed => stage = MigrationStage::Streaming,
                        CommitResult::Superseded => {
                            self.bandwidth.release(size_estimate);
                            return Ok(MigrationOutcome::Superseded);
                        }
                    }
                }

                MigrationStage::Streaming => {
                    if !acquired {
                        // Resumed after a crash; the old process's
                        // budget died with it.
                        if self.bandwidth.acquire(size_estimate).is_ok() {
                            acquired = true;
                        }
                    }
                    let range = match self.registry.snapshot(table)?.get(tablet) {
                        Some(t) => t.range,
                        None => return Ok(MigrationOutcome::Superseded),
                    };
                    if let Some(outcome) = self.run_transfer(
                        table, tablet, range, source, target, acquired, size_estimate, cancel,
                    )? {
                        return Ok(outcome);
                    }
                    match self.advance(table, tablet, stage)? {
                        CommitResult::Committed => stage = MigrationStage::WriteBothReadNew,
                        CommitResult::Superseded => return Ok(MigrationOutcome::Superseded),
                    }
                }

                MigrationStage::WriteBothReadNew => {
                    if cancel.load(Ordering::SeqCst) {
                        return self.cancel_committed(
                            table, tablet, target, acquired, size_estimate,
                            "cancelled by request",
                        );
                    }
                    // Point of no return: after this commit the source
                    // replica is condemned.
                    match self.advance(table, tablet, stage)? {
                        CommitResult::Committed => stage = MigrationStage::Cleanup,
                        CommitResult::Superseded => return Ok(MigrationOutcome::Superseded),
                    }
                }

                MigrationStage::Cleanup => {
                    self.streamer.remove(table, tablet, source);
                    let finish = TabletTransition::FinishMigration { tablet };
                    match self.commit_step(table, &finish, |t| {
                        matches!(t.migration, Some(m) if m.stage == MigrationStage::Cleanup)
                    })? {
                        CommitResult::Committed => {}
                        CommitResult::Superseded => return Ok(MigrationOutcome::Superseded),
                    }
                    self.events
                        .record(table, TabletEventKind::MigrationFinished { tablet });
                    tracing::info!(table = %table, tablet = %tablet, "migration finished");
                    return Ok(MigrationOutcome::Completed);
                }
            }
        }
    }

    /// Transfer with bounded retries and doubling back-off. Returns
    /// `Some(outcome)` when the migration ended here (cancelled), `None`
    /// when the transfer succeeded and the caller should advance.
    #[allow(clippy::too_many_arguments)]
    fn run_transfer(
        &self,
        table: TableId,
        tablet: TabletId,
        range: TokenRange,
        source: ReplicaLocation,
        target: ReplicaLocation,
        acquired: bool,
        size_estimate: u64,
        cancel: &AtomicBool,
    ) -> HeronResult<Option<MigrationOutcome>> {
        let mut attempt: u32 = 0;
        loop {
            if cancel.load(Ordering::SeqCst) {
                return self
                    .cancel_committed(
                        table, tablet, target, acquired, size_estimate,
                        "cancelled by request",
                    )
                    .map(Some);
            }
            match self.attempt_transfer(table, tablet, range, source, target) {
                Ok(()) => return Ok(None),
                Err(e) => {
                    attempt += 1;
                    let backoff = self.config.retry_backoff_ms << (attempt - 1).min(16);
                    let err = TabletError::TransientTransfer {
                        tablet,
                        reason: e.to_string(),
                        retry_after_ms: backoff,
                    };
                    if attempt > self.config.max_transfer_retries {
                        tracing::warn!(
                            table = %table,
                            tablet = %tablet,
                            attempts = attempt,
                            error = %err,
                            "transfer retries exhausted, cancelling migration"
                        );
                        return self
                            .cancel_committed(
                                table, tablet, target, acquired, size_estimate,
                                &format!("transfer retries exhausted: {e}"),
                            )
                            .map(Some);
                    }
                    tracing::warn!(
                        table = %table,
                        tablet = %tablet,
                        attempt,
                        backoff_ms = backoff,
                        error = %err,
                        "transfer attempt failed, retrying"
                    );
                    self.events.record(
                        table,
                        TabletEventKind::TransferRetried {
                            tablet,
                            attempt,
                            reason: e.to_string(),
                        },
                    );
                    std::thread::sleep(Duration::from_millis(err.retry_after_ms()));
                }
            }
        }
    }

    /// One transfer attempt, bounded by the configured timeout. A hung
    /// transfer is indistinguishable from a failed one: the attempt is
    /// written off as `Timeout` and the retry loop takes over. The
    /// streamer's atomic contract makes abandoning an attempt safe.
    fn attempt_transfer(
        &self,
        table: TableId,
        tablet: TabletId,
        range: TokenRange,
        source: ReplicaLocation,
        target: ReplicaLocation,
    ) -> Result<(), TransferError> {
        if self.config.transfer_timeout_ms == 0 {
            return self.streamer.transfer(table, tablet, range, source, target);
        }
        let (tx, rx) = std::sync::mpsc::channel();
        let streamer = self.streamer.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("tablet-transfer-{tablet}"))
            .spawn(move || {
                let _ = tx.send(streamer.transfer(table, tablet, range, source, target));
            });
        if spawned.is_err() {
            // Could not spawn a watchdog thread; run inline without a
            // deadline rather than failing the attempt outright.
            return self.streamer.transfer(table, tablet, range, source, target);
        }
        match rx.recv_timeout(Duration::from_millis(self.config.transfer_timeout_ms)) {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout),
        }
    }

    fn advance(
        &self,
        table: TableId,
        tablet: TabletId,
        from: MigrationStage,
    ) -> HeronResult<CommitResult> {
        let to = from.next().ok_or_else(|| {
            HeronError::Internal(format!("no stage after {from} for {tablet}"))
        })?;
        let step = TabletTransition::AdvanceStage { tablet, from, to };
        let result =
            self.commit_step(table, &step, |t| {
                matches!(t.migration, Some(m) if m.stage == from)
            })?;
        if matches!(result, CommitResult::Committed) {
            self.events.record(
                table,
                TabletEventKind::MigrationStageChanged { tablet, stage: to },
            );
            tracing::debug!(table = %table, tablet = %tablet, stage = %to, "stage committed");
        }
        Ok(result)
    }

    fn cancel_committed(
        &self,
        table: TableId,
        tablet: TabletId,
        target: ReplicaLocation,
        acquired: bool,
        size_estimate: u64,
        reason: &str,
    ) -> HeronResult<MigrationOutcome> {
        let step = TabletTransition::CancelMigration { tablet };
        let result = self.commit_step(table, &step, |t| {
            matches!(t.migration, Some(m) if !m.stage.is_past_point_of_no_return())
        })?;
        if acquired {
            self.bandwidth.release(size_estimate);
        }
        match result {
            CommitResult::Committed => {
                self.streamer.abort(table, tablet, target);
                self.events.record(
                    table,
                    TabletEventKind::MigrationCancelled {
                        tablet,
                        reason: reason.into(),
                    },
                );
                tracing::info!(table = %table, tablet = %tablet, reason, "migration cancelled");
                Ok(MigrationOutcome::Cancelled {
                    reason: reason.into(),
                })
            }
            CommitResult::Superseded => Ok(MigrationOutcome::Superseded),
        }
    }

    /// Commit one transition, absorbing epoch conflicts caused by
    /// unrelated concurrent commits: re-read, re-check that the tablet
    /// is still in the state this driver expects, and retry against the
    /// fresh epoch. A failed re-check means another actor changed *this*
    /// migration, which ends the driver's involvement.
    fn commit_step<F>(
        &self,
        table: TableId,
        transition: &TabletTransition,
        expect: F,
    ) -> HeronResult<CommitResult>
    where
        F: Fn(&Tablet) -> bool,
    {
        const MAX_COMMIT_ATTEMPTS: u32 = 16;
        let mut last: Option<HeronError> = None;
        for _ in 0..MAX_COMMIT_ATTEMPTS {
            let snap = self.registry.snapshot(table)?;
            let tablet = match snap.get(transition.tablet()) {
                Some(t) => t,
                None => return Ok(CommitResult::Superseded),
            };
            if !expect(tablet) {
                return Ok(CommitResult::Superseded);
            }
            match self.registry.apply(table, snap.epoch, transition) {
                Ok(_) => return Ok(CommitResult::Committed),
                Err(e) if e.is_retryable() => last = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| {
            HeronError::Internal(format!(
                "commit of {} gave up without observing a conflict",
                transition.tablet()
            ))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandwidth::BandwidthLimiter;
    use crate::events::TabletEventLog;
    use crate::registry::PlacementRegistry;
    use crate::streamer::ScriptedStreamer;
    use crate::topology::InMemoryTopologyLog;
    use heron_common::config::BandwidthConfig;

    struct Fixture {
        registry: Arc<PlacementRegistry>,
        streamer: Arc<ScriptedStreamer>,
        events: Arc<TabletEventLog>,
        coordinator: MigrationCoordinator,
        table: TableId,
        tablet: TabletId,
        source: ReplicaLocation,
        target: ReplicaLocation,
    }

    fn fixture() -> Fixture {
        fixture_with(MigrationConfig {
            max_transfer_retries: 3,
            retry_backoff_ms: 1,
            transfer_timeout_ms: 1_000,
        })
    }

    fn fixture_with(config: MigrationConfig) -> Fixture {
        let events = Arc::new(TabletEventLog::default());
        let registry =
            PlacementRegistry::new(Arc::new(InMemoryTopologyLog::new()), events.clone());
        let streamer = Arc::new(ScriptedStreamer::new());
        let bandwidth = Arc::new(BandwidthLimiter::new(BandwidthConfig {
            bytes_per_sec: 1 << 30,
            burst_bytes: 1 << 30,
            max_wait_ms: 1_000,
        }));
        let coordinator = MigrationCoordinator::new(
            registry.clone(),
            streamer.clone(),
            bandwidth,
            events.clone(),
            config,
        );

        let table = TableId(1);
        let shards: Vec<ReplicaLocation> =
            (1..=4).map(|n| ReplicaLocation::new(n, 0)).collect();
        let snap = registry.create_table(table, 4, 3, &shards).unwrap();
        let tablet = snap.tablets[0].id;
        let source = snap.tablets[0].replicas[0].location;
        let target = ReplicaLocation::new(9, 0);

        Fixture {
            registry,
            streamer,
            events,
            coordinator,
            table,
            tablet,
            source,
            target,
        }
    }

    #[test]
    fn test_successful_migration_end_to_end() {
        let f = fixture();
        let outcome = f
            .coordinator
            .migrate(f.table, f.tablet, f.source, f.target, 1024)
            .unwrap();
        assert_eq!(outcome, MigrationOutcome::Completed);

        let snap = f.registry.snapshot(f.table).unwrap();
        let t = snap.get(f.tablet).unwrap();
        assert!(t.migration.is_none());
        assert!(t.has_replica_at(f.target));
        assert!(!t.has_replica_at(f.source));
        assert_eq!(t.replicas.len(), 3);
        snap.validate().unwrap();

        assert_eq!(f.streamer.transfer_count(f.tablet), 1);
        assert_eq!(f.streamer.removed_locations(f.tablet), vec![f.source]);
        assert_eq!(f.coordinator.in_flight_count(), 0);
    }

    #[test]
    fn test_transfer_retries_then_succeeds() {
        let f = fixture();
        f.streamer.fail_first_attempts(f.tablet, 2);
        let outcome = f
            .coordinator
            .migrate(f.table, f.tablet, f.source, f.target, 1024)
            .unwrap();
        assert_eq!(outcome, MigrationOutcome::Completed);
        assert_eq!(f.streamer.transfer_count(f.tablet), 3);

        let retries = f
            .events
            .recent_for_table(f.table, 64)
            .into_iter()
            .filter(|e| matches!(e.kind, TabletEventKind::TransferRetried { .. }))
            .count();
        assert_eq!(retries, 2);
    }

    #[test]
    fn test_retry_exhaustion_cancels_and_restores() {
        let f = fixture();
        f.streamer.fail_first_attempts(f.tablet, 10);
        let outcome = f
            .coordinator
            .migrate(f.table, f.tablet, f.source, f.target, 1024)
            .unwrap();
        let reason = match outcome {
            MigrationOutcome::Cancelled { reason } => reason,
            other => panic!("expected cancellation, got {other:?}"),
        };
        assert!(reason.contains("transfer retries exhausted"));
        // The last attempt's failure is carried into the reason.
        assert!(reason.contains("injected failure"));

        // max_transfer_retries = 3, so 4 attempts in total.
        assert_eq!(f.streamer.transfer_count(f.tablet), 4);
        assert_eq!(f.streamer.abort_count(f.tablet), 1);

        let snap = f.registry.snapshot(f.table).unwrap();
        let t = snap.get(f.tablet).unwrap();
        assert!(t.migration.is_none());
        assert!(!t.has_replica_at(f.target));
        assert!(t.has_replica_at(f.source));
        assert_eq!(t.replicas.len(), 3);
        snap.validate().unwrap();
    }

    #[test]
    fn test_cancel_of_externally_committed_migration() {
        let f = fixture();
        let snap = f.registry.snapshot(f.table).unwrap();
        f.registry
            .apply(
                f.table,
                snap.epoch,
                &TabletTransition::BeginMigration {
                    tablet: f.tablet,
                    source: f.source,
                    target: f.target,
                },
            )
            .unwrap();

        f.coordinator.cancel(f.table, f.tablet, "operator").unwrap();
        assert_eq!(f.streamer.abort_count(f.tablet), 1);
        let t = f.registry.snapshot(f.table).unwrap().get(f.tablet).cloned().unwrap();
        assert!(t.migration.is_none());
        assert!(!t.has_replica_at(f.target));
    }

    #[test]
    fn test_cancel_past_point_of_no_return_fails() {
        let f = fixture();
        let mut epoch = f.registry.snapshot(f.table).unwrap().epoch;
        epoch = f
            .registry
            .apply(
                f.table,
                epoch,
                &TabletTransition::BeginMigration {
                    tablet: f.tablet,
                    source: f.source,
                    target: f.target,
                },
            )
            .unwrap();
        for (from, to) in [
            (MigrationStage::Preparing, MigrationStage::Streaming),
            (MigrationStage::Streaming, MigrationStage::WriteBothReadNew),
            (MigrationStage::WriteBothReadNew, MigrationStage::Cleanup),
        ] {
            epoch = f
                .registry
                .apply(
                    f.table,
                    epoch,
                    &TabletTransition::AdvanceStage {
                        tablet: f.tablet,
                        from,
                        to,
                    },
                )
                .unwrap();
        }

        let err = f
            .coordinator
            .cancel(f.table, f.tablet, "too late")
            .unwrap_err();
        assert!(matches!(
            err,
            HeronError::Tablet(TabletError::PastPointOfNoReturn { .. })
        ));
    }

    #[test]
    fn test_cancel_without_migration_fails() {
        let f = fixture();
        let err = f
            .coordinator
            .cancel(f.table, f.tablet, "nothing there")
            .unwrap_err();
        assert!(matches!(
            err,
            HeronError::Tablet(TabletError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_resume_from_streaming_completes() {
        let f = fixture();
        let mut epoch = f.registry.snapshot(f.table).unwrap().epoch;
        epoch = f
            .registry
            .apply(
                f.table,
                epoch,
                &TabletTransition::BeginMigration {
                    tablet: f.tablet,
                    source: f.source,
                    target: f.target,
                },
            )
            .unwrap();
        f.registry
            .apply(
                f.table,
                epoch,
                &TabletTransition::AdvanceStage {
                    tablet: f.tablet,
                    from: MigrationStage::Preparing,
                    to: MigrationStage::Streaming,
                },
            )
            .unwrap();

        // The process that was streaming is gone; a fresh coordinator
        // picks the migration up from its committed stage.
        let outcomes = f.coordinator.resume(f.table).unwrap();
        assert_eq!(outcomes, vec![(f.tablet, MigrationOutcome::Completed)]);
        assert_eq!(f.streamer.transfer_count(f.tablet), 1);

        let t = f.registry.snapshot(f.table).unwrap().get(f.tablet).cloned().unwrap();
        assert!(t.migration.is_none());
        assert!(t.has_replica_at(f.target));
    }

    #[test]
    fn test_resume_from_cleanup_finishes_without_transfer() {
        let f = fixture();
        let mut epoch = f.registry.snapshot(f.table).unwrap().epoch;
        epoch = f
            .registry
            .apply(
                f.table,
                epoch,
                &TabletTransition::BeginMigration {
                    tablet: f.tablet,
                    source: f.source,
                    target: f.target,
                },
            )
            .unwrap();
        for (from, to) in [
            (MigrationStage::Preparing, MigrationStage::Streaming),
            (MigrationStage::Streaming, MigrationStage::WriteBothReadNew),
            (MigrationStage::WriteBothReadNew, MigrationStage::Cleanup),
        ] {
            epoch = f
                .registry
                .apply(
                    f.table,
                    epoch,
                    &TabletTransition::AdvanceStage {
                        tablet: f.tablet,
                        from,
                        to,
                    },
                )
                .unwrap();
        }

        let outcomes = f.coordinator.resume(f.table).unwrap();
        assert_eq!(outcomes, vec![(f.tablet, MigrationOutcome::Completed)]);
        // No re-streaming past the point of no return, but the source
        // removal is redone (idempotent).
        assert_eq!(f.streamer.transfer_count(f.tablet), 0);
        assert_eq!(f.streamer.removal_count(f.tablet), 1);
    }

    #[test]
    fn test_migrate_superseded_by_existing_migration() {
        let f = fixture();
        let snap = f.registry.snapshot(f.table).unwrap();
        f.registry
            .apply(
                f.table,
                snap.epoch,
                &TabletTransition::BeginMigration {
                    tablet: f.tablet,
                    source: f.source,
                    target: ReplicaLocation::new(8, 0),
                },
            )
            .unwrap();

        // Committed state already has a different migration in flight.
        let outcome = f
            .coordinator
            .migrate(f.table, f.tablet, f.source, f.target, 1024)
            .unwrap();
        assert_eq!(outcome, MigrationOutcome::Superseded);
        assert_eq!(f.streamer.transfer_count(f.tablet), 0);
    }

    /// Streamer whose next attempts stall for scripted durations. Later
    /// attempts return immediately.
    struct SluggishStreamer {
        delays_ms: std::sync::Mutex<std::collections::VecDeque<u64>>,
        attempts: std::sync::atomic::AtomicUsize,
    }

    impl SluggishStreamer {
        fn new(delays_ms: Vec<u64>) -> Self {
            Self {
                delays_ms: std::sync::Mutex::new(delays_ms.into()),
                attempts: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    impl Streamer for SluggishStreamer {
        fn transfer(
            &self,
            _table: TableId,
            _tablet: TabletId,
            _range: TokenRange,
            _source: ReplicaLocation,
            _destination: ReplicaLocation,
        ) -> Result<(), TransferError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let delay = self.delays_ms.lock().unwrap().pop_front().unwrap_or(0);
            if delay > 0 {
                std::thread::sleep(Duration::from_millis(delay));
            }
            Ok(())
        }

        fn abort(&self, _table: TableId, _tablet: TabletId, _destination: ReplicaLocation) {}

        fn remove(&self, _table: TableId, _tablet: TabletId, _replica: ReplicaLocation) {}
    }

    #[test]
    fn test_hung_transfer_times_out_and_retries() {
        let events = Arc::new(TabletEventLog::default());
        let registry =
            PlacementRegistry::new(Arc::new(InMemoryTopologyLog::new()), events.clone());
        // First attempt hangs far past the deadline, second returns at
        // once.
        let streamer = Arc::new(SluggishStreamer::new(vec![10_000]));
        let bandwidth = Arc::new(BandwidthLimiter::new(BandwidthConfig {
            bytes_per_sec: 1 << 30,
            burst_bytes: 1 << 30,
            max_wait_ms: 1_000,
        }));
        let coordinator = MigrationCoordinator::new(
            registry.clone(),
            streamer.clone(),
            bandwidth,
            events.clone(),
            MigrationConfig {
                max_transfer_retries: 3,
                retry_backoff_ms: 1,
                transfer_timeout_ms: 25,
            },
        );
        let table = TableId(1);
        let shards: Vec<ReplicaLocation> =
            (1..=4).map(|n| ReplicaLocation::new(n, 0)).collect();
        let snap = registry.create_table(table, 4, 3, &shards).unwrap();
        let tablet = snap.tablets[0].id;
        let source = snap.tablets[0].replicas[0].location;
        let target = ReplicaLocation::new(9, 0);

        let started = std::time::Instant::now();
        let outcome = coordinator
            .migrate(table, tablet, source, target, 1024)
            .unwrap();
        assert_eq!(outcome, MigrationOutcome::Completed);
        // The hung attempt was abandoned, not waited out.
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(streamer.attempts.load(Ordering::SeqCst), 2);

        let timed_out = events
            .recent_for_table(table, 64)
            .into_iter()
            .any(|e| matches!(
                e.kind,
                TabletEventKind::TransferRetried { ref reason, .. } if reason.contains("timed out")
            ));
        assert!(timed_out);
    }

    #[test]
    fn test_cooperative_cancel_mid_flight() {
        let f = fixture_with(MigrationConfig {
            max_transfer_retries: 100,
            retry_backoff_ms: 10,
            transfer_timeout_ms: 1_000,
        });
        // Keep the driver in the retry loop long enough to cancel it.
        f.streamer.fail_first_attempts(f.tablet, 1_000);

        let coordinator = Arc::new(f.coordinator);
        let driver = {
            let coordinator = coordinator.clone();
            let (table, tablet, source, target) = (f.table, f.tablet, f.source, f.target);
            std::thread::spawn(move || {
                coordinator.migrate(table, tablet, source, target, 1024)
            })
        };

        // Wait until the driver has registered itself.
        while coordinator.in_flight_count() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        coordinator.cancel(f.table, f.tablet, "operator").unwrap();

        let outcome = driver.join().unwrap().unwrap();
        assert!(matches!(outcome, MigrationOutcome::Cancelled { .. }));
        let t = f.registry.snapshot(f.table).unwrap().get(f.tablet).cloned().unwrap();
        assert!(t.migration.is_none());
        assert!(!t.has_replica_at(f.target));
    }
}
