//! The streamer seam: bulk transfer of the immutable files backing one
//! tablet between replicas.
//!
//! The transfer contract is atomic: the destination either ends up with
//! the complete, consistent data set for the tablet's range or with
//! nothing usable. That makes a retried transfer safe without any
//! partial-state bookkeeping here.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use thiserror::Error;

use heron_common::types::{TableId, TabletId};

use crate::model::{ReplicaLocation, TokenRange};

/// Failure of a single transfer attempt. Always transient from the
/// coordinator's point of view: retried with back-off, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("transfer failed: {0}")]
    Failed(String),
    #[error("transfer timed out")]
    Timeout,
}

/// External component performing bulk atomic data movement between
/// replicas.
pub trait Streamer: Send + Sync {
    /// Copy the data for `range` of `tablet` from `source` to
    /// `destination`, all-or-nothing.
    fn transfer(
        &self,
        table: TableId,
        tablet: TabletId,
        range: TokenRange,
        source: ReplicaLocation,
        destination: ReplicaLocation,
    ) -> Result<(), TransferError>;

    /// Drop whatever partial allocation `destination` holds for
    /// `tablet` after a cancelled migration. Idempotent.
    fn abort(&self, table: TableId, tablet: TabletId, destination: ReplicaLocation);

    /// Delete the outgoing replica's data during cleanup. Idempotent:
    /// re-running after a crash is safe.
    fn remove(&self, table: TableId, tablet: TabletId, replica: ReplicaLocation);
}

/// Streamer that always succeeds and does nothing. Useful when wiring
/// the subsystem against storage that is not attached yet.
pub struct NoopStreamer;

impl Streamer for NoopStreamer {
    fn transfer(
        &self,
        _table: TableId,
        _tablet: TabletId,
        _range: TokenRange,
        _source: ReplicaLocation,
        _destination: ReplicaLocation,
    ) -> Result<(), TransferError> {
        Ok(())
    }

    fn abort(&self, _table: TableId, _tablet: TabletId, _destination: ReplicaLocation) {}

    fn remove(&self, _table: TableId, _tablet: TabletId, _replica: ReplicaLocation) {}
}

/// Test double with scripted per-tablet outcomes and call counters.
///
/// Each scripted outcome is consumed by one transfer attempt; once the
/// script runs out, attempts succeed.
pub struct ScriptedStreamer {
    scripts: Mutex<HashMap<TabletId, VecDeque<Result<(), TransferError>>>>,
    transfers: Mutex<Vec<(TabletId, ReplicaLocation, ReplicaLocation)>>,
    aborts: Mutex<Vec<(TabletId, ReplicaLocation)>>,
    removals: Mutex<Vec<(TabletId, ReplicaLocation)>>,
}

impl ScriptedStreamer {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            transfers: Mutex::new(Vec::new()),
            aborts: Mutex::new(Vec::new()),
            removals: Mutex::new(Vec::new()),
        }
    }

    /// Script the outcomes of the next transfer attempts for `tablet`.
    pub fn script(&self, tablet: TabletId, outcomes: Vec<Result<(), TransferError>>) {
        self.scripts.lock().insert(tablet, outcomes.into());
    }

    /// Script `n` failures followed by success.
    pub fn fail_first_attempts(&self, tablet: TabletId, n: usize) {
        let outcomes = (0..n)
            .map(|i| Err(TransferError::Failed(format!("injected failure #{}", i + 1))))
            .collect();
        self.script(tablet, outcomes);
    }

    pub fn transfer_count(&self, tablet: TabletId) -> usize {
        self.transfers
            .lock()
            .iter()
            .filter(|(t, _, _)| *t == tablet)
            .count()
    }

    pub fn abort_count(&self, tablet: TabletId) -> usize {
        self.aborts.lock().iter().filter(|(t, _)| *t == tablet).count()
    }

    pub fn removal_count(&self, tablet: TabletId) -> usize {
        self.removals
            .lock()
            .iter()
            .filter(|(t, _)| *t == tablet)
            .count()
    }

    pub fn removed_locations(&self, tablet: TabletId) -> Vec<ReplicaLocation> {
        self.removals
            .lock()
            .iter()
            .filter(|(t, _)| *t == tablet)
            .map(|(_, loc)| *loc)
            .collect()
    }
}

impl Default for ScriptedStreamer {
    fn default() -> Self {
        Self::new()
    }
}

impl Streamer for ScriptedStreamer {
    fn transfer(
        &self,
        _table: TableId,
        tablet: TabletId,
        _range: TokenRange,
        source: ReplicaLocation,
        destination: ReplicaLocation,
    ) -> Result<(), TransferError> {
        self.transfers.lock().push((tablet, source, destination));
        self.scripts
            .lock()
            .get_mut(&tablet)
            .and_then(|q| q.pop_front())
            .unwrap_or(Ok(()))
    }

    fn abort(&self, _table: TableId, tablet: TabletId, destination: ReplicaLocation) {
        self.aborts.lock().push((tablet, destination));
    }

    fn remove(&self, _table: TableId, tablet: TabletId, replica: ReplicaLocation) {
        self.removals.lock().push((tablet, replica));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heron_common::types::Token;

    fn range() -> TokenRange {
        TokenRange {
            start: Token(0),
            end: Token(100),
        }
    }

    #[test]
    fn test_scripted_outcomes_consumed_in_order() {
        let s = ScriptedStreamer::new();
        let t = TabletId(1);
        s.fail_first_attempts(t, 2);

        let src = ReplicaLocation::new(1, 0);
        let dst = ReplicaLocation::new(2, 0);
        assert!(s.transfer(TableId(1), t, range(), src, dst).is_err());
        assert!(s.transfer(TableId(1), t, range(), src, dst).is_err());
        assert!(s.transfer(TableId(1), t, range(), src, dst).is_ok());
        assert_eq!(s.transfer_count(t), 3);
    }

    #[test]
    fn test_unscripted_tablet_succeeds() {
        let s = ScriptedStreamer::new();
        let ok = s.transfer(
            TableId(1),
            TabletId(9),
            range(),
            ReplicaLocation::new(1, 0),
            ReplicaLocation::new(2, 0),
        );
        assert!(ok.is_ok());
    }
}
