//! Bounded in-memory history of notable tablet lifecycle events, for
//! operator inspection alongside the structured log output.

use std::collections::VecDeque;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use heron_common::types::{NodeId, TableId, TabletId};

use crate::model::{MigrationStage, ReplicaLocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletEventKind {
    TableCreated {
        tablet_count: usize,
    },
    TableDropped,
    MigrationStarted {
        tablet: TabletId,
        source: ReplicaLocation,
        target: ReplicaLocation,
    },
    MigrationStageChanged {
        tablet: TabletId,
        stage: MigrationStage,
    },
    MigrationFinished {
        tablet: TabletId,
    },
    MigrationCancelled {
        tablet: TabletId,
        reason: String,
    },
    TransferRetried {
        tablet: TabletId,
        attempt: u32,
        reason: String,
    },
    TabletSplit {
        tablet: TabletId,
        left: TabletId,
        right: TabletId,
    },
    TabletsMerged {
        left: TabletId,
        right: TabletId,
        merged: TabletId,
    },
    BalancingHalted {
        detail: String,
    },
    BalancingResumed,
    NodeDrainStarted {
        node: NodeId,
    },
    NodeDrainFinished {
        node: NodeId,
    },
}

impl TabletEventKind {
    pub fn severity(&self) -> EventSeverity {
        match self {
            TabletEventKind::BalancingHalted { .. } => EventSeverity::Error,
            TabletEventKind::MigrationCancelled { .. }
            | TabletEventKind::TransferRetried { .. } => EventSeverity::Warning,
            _ => EventSeverity::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletEvent {
    pub at: SystemTime,
    /// Table the event belongs to. `None` for node-scoped events such
    /// as a decommission, which span every table.
    pub table: Option<TableId>,
    pub kind: TabletEventKind,
}

impl TabletEvent {
    pub fn severity(&self) -> EventSeverity {
        self.kind.severity()
    }
}

/// Ring buffer of recent events, newest last. Oldest entries are
/// evicted once `capacity` is reached.
pub struct TabletEventLog {
    capacity: usize,
    events: Mutex<VecDeque<TabletEvent>>,
}

impl TabletEventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, table: TableId, kind: TabletEventKind) {
        self.push(Some(table), kind);
    }

    /// Record an event that is not tied to any one table, e.g. a node
    /// drain covering the whole cluster.
    pub fn record_node(&self, kind: TabletEventKind) {
        self.push(None, kind);
    }

    fn push(&self, table: Option<TableId>, kind: TabletEventKind) {
        let event = TabletEvent {
            at: SystemTime::now(),
            table,
            kind,
        };
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn recent(&self, limit: usize) -> Vec<TabletEvent> {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn recent_for_table(&self, table: TableId, limit: usize) -> Vec<TabletEvent> {
        let events = self.events.lock();
        let matching: Vec<TabletEvent> =
            events.iter().filter(|e| e.table == Some(table)).cloned().collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl Default for TabletEventLog {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let log = TabletEventLog::new(2);
        for i in 0..3 {
            log.record(
                TableId(i),
                TabletEventKind::TableCreated { tablet_count: 4 },
            );
        }
        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].table, Some(TableId(1)));
        assert_eq!(recent[1].table, Some(TableId(2)));
    }

    #[test]
    fn test_node_scoped_events_carry_no_table() {
        let log = TabletEventLog::new(16);
        log.record(TableId(1), TabletEventKind::TableCreated { tablet_count: 4 });
        log.record_node(TabletEventKind::NodeDrainStarted { node: NodeId(2) });

        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].table, None);
        // Per-table filtering never picks up node-scoped events.
        assert_eq!(log.recent_for_table(TableId(1), 10).len(), 1);
    }

    #[test]
    fn test_filter_by_table() {
        let log = TabletEventLog::new(16);
        log.record(TableId(1), TabletEventKind::TableCreated { tablet_count: 4 });
        log.record(TableId(2), TabletEventKind::TableCreated { tablet_count: 4 });
        log.record(TableId(1), TabletEventKind::TableDropped);
        let events = log.recent_for_table(TableId(1), 10);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1].kind, TabletEventKind::TableDropped));
    }

    #[test]
    fn test_severity_classification() {
        assert_eq!(
            TabletEventKind::BalancingHalted {
                detail: "bad map".into()
            }
            .severity(),
            EventSeverity::Error
        );
        assert_eq!(
            TabletEventKind::TransferRetried {
                tablet: TabletId(1),
                attempt: 1,
                reason: "timeout".into()
            }
            .severity(),
            EventSeverity::Warning
        );
        assert_eq!(
            TabletEventKind::MigrationFinished { tablet: TabletId(1) }.severity(),
            EventSeverity::Info
        );
    }
}
