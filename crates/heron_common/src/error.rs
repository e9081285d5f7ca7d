use thiserror::Error;

use crate::types::{Epoch, NodeId, TableId, TabletId};

/// Convenience alias for `Result<T, HeronError>`.
pub type HeronResult<T> = Result<T, HeronError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`   — bad input or an action that is no longer possible
///   (e.g. cancelling past the point of no return); do not retry
/// - `Retryable`   — optimistic-write race lost (epoch conflict);
///   caller SHOULD re-read and retry on its own schedule
/// - `Transient`   — streaming I/O failure, timeout, backpressure;
///   caller MAY retry after back-off
/// - `InternalBug` — invariant violation; halts automatic balancing for
///   the affected table and triggers an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum HeronError {
    #[error("Tablet error: {0}")]
    Tablet(#[from] TabletError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors of the tablet distribution and load-balancing subsystem.
#[derive(Error, Debug)]
pub enum TabletError {
    /// Optimistic commit lost the race: the registry epoch moved under
    /// the caller. Re-read and retry later; never fatal.
    #[error("Epoch conflict on {table}: expected {expected}, committed is {actual}; re-read and retry")]
    Conflict {
        table: TableId,
        expected: Epoch,
        actual: Epoch,
    },

    /// A bulk transfer failed in a way that may succeed on retry.
    #[error("Transient transfer failure for {tablet}: {reason} (retry after {retry_after_ms}ms)")]
    TransientTransfer {
        tablet: TabletId,
        reason: String,
        retry_after_ms: u64,
    },

    /// A proposed or committed tablet map would break token coverage,
    /// overlap, ordering, or the replica-count invariant. Should be
    /// unreachable; if observed on committed state it indicates
    /// corruption and halts balancing for the table.
    #[error("Invariant violation on {table}: {detail}")]
    InvariantViolation { table: TableId, detail: String },

    /// The migration was cancelled (administrator request, superseding
    /// topology change, or retry exhaustion).
    #[error("Migration of {tablet} cancelled: {reason}")]
    Cancelled { tablet: TabletId, reason: String },

    /// Cancellation requested after the cleanup stage committed. The
    /// outgoing replica's data is already being deleted; the migration
    /// can only run to completion.
    #[error("Migration of {tablet} is past the point of no return (cleanup committed); it can no longer be cancelled, only completed")]
    PastPointOfNoReturn { tablet: TabletId },

    #[error("Table {0} not found in the placement registry")]
    TableNotFound(TableId),

    #[error("Tablet {tablet} not found in {table}")]
    TabletNotFound { table: TableId, tablet: TabletId },

    #[error("Node {0} not found in the node directory")]
    NodeNotFound(NodeId),

    #[error("Tablet {tablet} already has a migration in flight")]
    MigrationInFlight { tablet: TabletId },

    #[error("Invalid transition for {tablet}: {detail}")]
    InvalidTransition { tablet: TabletId, detail: String },
}

impl HeronError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HeronError::Tablet(e) => e.kind(),
            HeronError::Internal(_) => ErrorKind::InternalBug,
        }
    }

    /// Returns true if the caller should re-read and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// Returns true if this is a transient resource/transfer error.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Returns true if this is a user-facing "not possible" error.
    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    /// Returns true if this is an invariant violation or other bug.
    pub fn is_internal_bug(&self) -> bool {
        matches!(self.kind(), ErrorKind::InternalBug)
    }

    /// Emit a structured log entry for InternalBug errors. Must be
    /// called before surfacing a fatal error to an operator.
    pub fn log_if_fatal(&self) {
        if self.is_internal_bug() {
            tracing::error!(
                error_category = "Fatal",
                component = "tablets",
                "FATAL: {}",
                self
            );
        }
    }
}

impl TabletError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TabletError::Conflict { .. } => ErrorKind::Retryable,
            TabletError::TransientTransfer { .. } => ErrorKind::Transient,
            TabletError::InvariantViolation { .. } => ErrorKind::InternalBug,
            TabletError::Cancelled { .. } => ErrorKind::Transient,
            TabletError::PastPointOfNoReturn { .. } => ErrorKind::UserError,
            TabletError::TableNotFound(_) => ErrorKind::UserError,
            TabletError::TabletNotFound { .. } => ErrorKind::UserError,
            TabletError::NodeNotFound(_) => ErrorKind::UserError,
            TabletError::MigrationInFlight { .. } => ErrorKind::Retryable,
            TabletError::InvalidTransition { .. } => ErrorKind::UserError,
        }
    }

    /// Suggested retry delay in milliseconds (0 = retry on the caller's
    /// own schedule, e.g. the next balancing round).
    pub fn retry_after_ms(&self) -> u64 {
        match self {
            TabletError::TransientTransfer { retry_after_ms, .. } => *retry_after_ms,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod error_classification {
    use super::*;

    #[test]
    fn test_conflict_is_retryable() {
        let e: HeronError = TabletError::Conflict {
            table: TableId(1),
            expected: Epoch(3),
            actual: Epoch(4),
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::Retryable);
        assert!(e.is_retryable());
        assert!(!e.is_user_error());
    }

    #[test]
    fn test_transient_transfer_is_transient() {
        let e: HeronError = TabletError::TransientTransfer {
            tablet: TabletId(7),
            reason: "stream timeout".into(),
            retry_after_ms: 500,
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::Transient);
        assert!(e.is_transient());
        match e {
            HeronError::Tablet(t) => assert_eq!(t.retry_after_ms(), 500),
            _ => panic!("expected Tablet variant"),
        }
    }

    #[test]
    fn test_invariant_violation_is_internal_bug() {
        let e: HeronError = TabletError::InvariantViolation {
            table: TableId(1),
            detail: "token coverage gap".into(),
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::InternalBug);
        assert!(e.is_internal_bug());
    }

    #[test]
    fn test_past_point_of_no_return_is_user_error() {
        let e: HeronError = TabletError::PastPointOfNoReturn { tablet: TabletId(9) }.into();
        assert_eq!(e.kind(), ErrorKind::UserError);
        let msg = e.to_string();
        assert!(msg.contains("no longer be cancelled"));
        assert!(msg.contains("only completed"));
    }

    #[test]
    fn test_migration_in_flight_is_retryable() {
        let e: HeronError = TabletError::MigrationInFlight { tablet: TabletId(2) }.into();
        assert!(e.is_retryable());
    }

    #[test]
    fn test_internal_string_is_internal_bug() {
        let e = HeronError::Internal("unexpected None in tablet map".into());
        assert_eq!(e.kind(), ErrorKind::InternalBug);
    }

    #[test]
    fn test_conflict_message_says_retry() {
        let e = TabletError::Conflict {
            table: TableId(1),
            expected: Epoch(1),
            actual: Epoch(2),
        };
        assert!(e.to_string().contains("re-read and retry"));
    }
}
