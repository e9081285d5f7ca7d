//! The tablet data model: token ranges, replicas, migration stages, and
//! the per-table `TabletMap` with its validated transitions.
//!
//! A `TabletMap` is immutable once committed. Every change is expressed
//! as a `TabletTransition` applied to a snapshot, producing a new map
//! that is validated locally (coverage, overlap, replica count, stage
//! order) before it is ever proposed to the topology log.

use serde::{Deserialize, Serialize};

use heron_common::types::{Epoch, NodeId, ShardId, TableId, TabletId, Token};
use heron_common::TabletError;

// ── Token ranges ────────────────────────────────────────────────────────────

/// A contiguous, half-open range `[start, end)` of the token space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenRange {
    pub start: Token,
    pub end: Token,
}

impl TokenRange {
    /// The whole token space of a table.
    pub fn full() -> Self {
        Self {
            start: Token::MIN,
            end: Token::UPPER_BOUND,
        }
    }

    pub fn contains(&self, token: Token) -> bool {
        token >= self.start && token < self.end
    }

    pub fn width(&self) -> u64 {
        self.end.0 - self.start.0
    }

    /// Split point for this range, or `None` if the range is too narrow
    /// to split (width < 2).
    pub fn midpoint(&self) -> Option<Token> {
        if self.width() < 2 {
            return None;
        }
        Some(Token(self.start.0 + self.width() / 2))
    }
}

impl std::fmt::Display for TokenRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ── Replicas ────────────────────────────────────────────────────────────────

/// Where a replica lives: a specific CPU shard on a specific node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ReplicaLocation {
    pub node: NodeId,
    pub shard: ShardId,
}

impl ReplicaLocation {
    pub fn new(node: u64, shard: u32) -> Self {
        Self {
            node: NodeId(node),
            shard: ShardId(shard),
        }
    }
}

impl std::fmt::Display for ReplicaLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.node, self.shard)
    }
}

/// Role of a replica within its tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    /// Serves reads and writes at quiescence.
    Current,
    /// Incoming replica of an active migration. Receives fanned-out
    /// writes; serves reads only from `WriteBothReadNew` on.
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletReplica {
    pub location: ReplicaLocation,
    pub role: ReplicaRole,
}

// ── Migration stages ────────────────────────────────────────────────────────

/// Persisted stage of an in-flight migration. Stages are strictly
/// ordered; each change is committed to the topology log before any
/// side effect, which makes every stage idempotently resumable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MigrationStage {
    /// Target replica allocated. Writes fan out to current and target;
    /// reads still served by current.
    Preparing,
    /// Bulk data transfer in flight.
    Streaming,
    /// Streaming confirmed complete; reads switch to the target.
    WriteBothReadNew,
    /// Outgoing replica's data being removed. Point of no return.
    Cleanup,
}

impl MigrationStage {
    /// The next stage in the strict order, if any.
    pub fn next(self) -> Option<MigrationStage> {
        match self {
            MigrationStage::Preparing => Some(MigrationStage::Streaming),
            MigrationStage::Streaming => Some(MigrationStage::WriteBothReadNew),
            MigrationStage::WriteBothReadNew => Some(MigrationStage::Cleanup),
            MigrationStage::Cleanup => None,
        }
    }

    /// True once cancellation is no longer possible.
    pub fn is_past_point_of_no_return(self) -> bool {
        matches!(self, MigrationStage::Cleanup)
    }
}

impl std::fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStage::Preparing => write!(f, "preparing"),
            MigrationStage::Streaming => write!(f, "streaming"),
            MigrationStage::WriteBothReadNew => write!(f, "write_both_read_new"),
            MigrationStage::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// The persisted record of one tablet's in-flight migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationState {
    pub stage: MigrationStage,
    /// Outgoing replica. Stays `Current` until cleanup removes it.
    pub source: ReplicaLocation,
    /// Incoming replica, role `Target` until the migration finishes.
    pub target: ReplicaLocation,
}

// ── Tablets ─────────────────────────────────────────────────────────────────

/// A contiguous token-range unit of a table's data, replicated
/// independently of other tablets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablet {
    pub id: TabletId,
    pub range: TokenRange,
    /// Ordered by location for deterministic iteration.
    pub replicas: Vec<TabletReplica>,
    pub migration: Option<MigrationState>,
}

impl Tablet {
    pub fn has_replica_at(&self, loc: ReplicaLocation) -> bool {
        self.replicas.iter().any(|r| r.location == loc)
    }

    pub fn has_replica_on_node(&self, node: NodeId) -> bool {
        self.replicas.iter().any(|r| r.location.node == node)
    }

    pub fn current_replicas(&self) -> impl Iterator<Item = &TabletReplica> {
        self.replicas
            .iter()
            .filter(|r| r.role == ReplicaRole::Current)
    }

    /// Locations that must receive writes right now: all current
    /// replicas, plus the migration target while one is in flight.
    pub fn write_locations(&self) -> Vec<ReplicaLocation> {
        self.replicas.iter().map(|r| r.location).collect()
    }

    /// Locations that serve reads right now. Before the read handover
    /// reads go to the current replicas; from `WriteBothReadNew` on the
    /// outgoing replica is replaced by the target.
    pub fn read_locations(&self) -> Vec<ReplicaLocation> {
        match self.migration {
            Some(m) if m.stage >= MigrationStage::WriteBothReadNew => self
                .replicas
                .iter()
                .filter(|r| r.location != m.source)
                .map(|r| r.location)
                .collect(),
            _ => self.current_replicas().map(|r| r.location).collect(),
        }
    }

    fn sort_replicas(&mut self) {
        self.replicas.sort_by_key(|r| r.location);
    }
}

// ── Transitions ─────────────────────────────────────────────────────────────

/// The fixed tagged set of committed placement mutations. Evaluated and
/// validated locally before ever being proposed to the topology log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletTransition {
    /// Allocate the target replica and enter `Preparing`.
    BeginMigration {
        tablet: TabletId,
        source: ReplicaLocation,
        target: ReplicaLocation,
    },
    /// Advance the migration one stage. Entering `Cleanup` removes the
    /// outgoing replica from the replica set.
    AdvanceStage {
        tablet: TabletId,
        from: MigrationStage,
        to: MigrationStage,
    },
    /// `Cleanup` confirmed: the target becomes a sole current replica.
    FinishMigration { tablet: TabletId },
    /// Abort before the point of no return: release the target replica
    /// and restore the tablet to its quiescent replica set.
    CancelMigration { tablet: TabletId },
    /// Divide the tablet's range at its midpoint into two tablets, both
    /// inheriting the replica set. Metadata only; no data moves.
    Split { tablet: TabletId },
    /// Inverse of split: combine a tablet with its immediate right
    /// neighbour. Requires identical replica sets and no in-flight
    /// migration on either side.
    Merge { left: TabletId, right: TabletId },
}

impl TabletTransition {
    /// The tablet this transition primarily concerns (for logging).
    pub fn tablet(&self) -> TabletId {
        match self {
            TabletTransition::BeginMigration { tablet, .. }
            | TabletTransition::AdvanceStage { tablet, .. }
            | TabletTransition::FinishMigration { tablet }
            | TabletTransition::CancelMigration { tablet }
            | TabletTransition::Split { tablet } => *tablet,
            TabletTransition::Merge { left, .. } => *left,
        }
    }
}

// ── TabletMap ───────────────────────────────────────────────────────────────

/// One table's ordered, gapless, non-overlapping tablet sequence plus
/// the epoch of the topology-log commit that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletMap {
    pub table: TableId,
    pub epoch: Epoch,
    /// Replication factor at quiescence, fixed at table creation.
    pub rf: usize,
    /// Ordered by `range.start`.
    pub tablets: Vec<Tablet>,
    /// Next tablet id to allocate. Ids are never reused.
    next_tablet_id: u64,
}

impl TabletMap {
    /// Build the initial map for a freshly created table: `tablet_count`
    /// equal ranges, each with `rf` replicas assigned round-robin over
    /// `shards` (one replica per node per tablet).
    pub fn initial(
        table: TableId,
        tablet_count: usize,
        rf: usize,
        shards: &[ReplicaLocation],
    ) -> Result<TabletMap, TabletError> {
        if tablet_count == 0 {
            return Err(TabletError::InvariantViolation {
                table,
                detail: "initial tablet count must be at least 1".into(),
            });
        }
        let mut nodes: Vec<NodeId> = shards.iter().map(|s| s.node).collect();
        nodes.sort();
        nodes.dedup();
        if nodes.len() < rf {
            return Err(TabletError::InvariantViolation {
                table,
                detail: format!(
                    "replication factor {} exceeds distinct node count {}",
                    rf,
                    nodes.len()
                ),
            });
        }

        let mut sorted: Vec<ReplicaLocation> = shards.to_vec();
        sorted.sort();
        sorted.dedup();

        let span = Token::UPPER_BOUND.0 / tablet_count as u64;
        let mut tablets = Vec::with_capacity(tablet_count);
        let mut cursor = 0usize;
        for i in 0..tablet_count {
            let start = Token(i as u64 * span);
            let end = if i + 1 == tablet_count {
                Token::UPPER_BOUND
            } else {
                Token((i as u64 + 1) * span)
            };

            // Walk the shard list, taking at most one shard per node
            // until rf replicas are placed.
            let mut replicas: Vec<TabletReplica> = Vec::with_capacity(rf);
            let mut used_nodes: Vec<NodeId> = Vec::with_capacity(rf);
            let mut scanned = 0;
            while replicas.len() < rf && scanned < sorted.len() {
                let loc = sorted[cursor % sorted.len()];
                cursor += 1;
                scanned += 1;
                if used_nodes.contains(&loc.node) {
                    continue;
                }
                used_nodes.push(loc.node);
                replicas.push(TabletReplica {
                    location: loc,
                    role: ReplicaRole::Current,
                });
            }
            if replicas.len() < rf {
                // Scanned the whole ring without rf distinct nodes;
                // restart the scan ignoring the cursor position.
                for loc in &sorted {
                    if replicas.len() == rf {
                        break;
                    }
                    if !used_nodes.contains(&loc.node) {
                        used_nodes.push(loc.node);
                        replicas.push(TabletReplica {
                            location: *loc,
                            role: ReplicaRole::Current,
                        });
                    }
                }
            }
            replicas.sort_by_key(|r| r.location);
            tablets.push(Tablet {
                id: TabletId(i as u64),
                range: TokenRange { start, end },
                replicas,
                migration: None,
            });
        }

        let map = TabletMap {
            table,
            epoch: Epoch(0),
            rf,
            tablets,
            next_tablet_id: tablet_count as u64,
        };
        map.validate()?;
        Ok(map)
    }

    /// The tablet owning `token`. Total and deterministic for any token
    /// in `[0, Token::UPPER_BOUND)`.
    pub fn lookup(&self, token: Token) -> &Tablet {
        let idx = self
            .tablets
            .partition_point(|t| t.range.start <= token)
            .saturating_sub(1);
        &self.tablets[idx]
    }

    pub fn get(&self, id: TabletId) -> Option<&Tablet> {
        self.tablets.iter().find(|t| t.id == id)
    }

    /// Position of `id` in the ordered sequence.
    pub fn index_of(&self, id: TabletId) -> Option<usize> {
        self.tablets.iter().position(|t| t.id == id)
    }

    /// Derived, rebuildable reverse projection: tablets with a replica
    /// on `node`. Never stored; recomputed from the snapshot.
    pub fn tablets_on_node(&self, node: NodeId) -> Vec<TabletId> {
        self.tablets
            .iter()
            .filter(|t| t.has_replica_on_node(node))
            .map(|t| t.id)
            .collect()
    }

    /// Number of tablets with a migration in flight.
    pub fn migrations_in_flight(&self) -> usize {
        self.tablets.iter().filter(|t| t.migration.is_some()).count()
    }

    /// Check every structural invariant: full token coverage, ordering,
    /// no overlap, replica count (rf at quiescence, rf+1 before cleanup
    /// commits), and migration-record consistency.
    pub fn validate(&self) -> Result<(), TabletError> {
        let fail = |detail: String| {
            Err(TabletError::InvariantViolation {
                table: self.table,
                detail,
            })
        };

        if self.tablets.is_empty() {
            return fail("tablet sequence is empty".into());
        }
        if self.tablets[0].range.start != Token::MIN {
            return fail(format!(
                "coverage gap before first tablet: starts at {}",
                self.tablets[0].range.start
            ));
        }
        if self.tablets[self.tablets.len() - 1].range.end != Token::UPPER_BOUND {
            return fail("coverage gap after last tablet".into());
        }
        for pair in self.tablets.windows(2) {
            if pair[0].range.end != pair[1].range.start {
                return fail(format!(
                    "{} and {} are not contiguous: {} vs {}",
                    pair[0].id, pair[1].id, pair[0].range, pair[1].range
                ));
            }
        }

        for t in &self.tablets {
            if t.range.start >= t.range.end {
                return fail(format!("{} has an empty range {}", t.id, t.range));
            }
            let mut locs: Vec<ReplicaLocation> = t.replicas.iter().map(|r| r.location).collect();
            locs.sort();
            locs.dedup();
            if locs.len() != t.replicas.len() {
                return fail(format!("{} has duplicate replica locations", t.id));
            }
            let mut nodes: Vec<NodeId> = t.replicas.iter().map(|r| r.location.node).collect();
            nodes.sort();
            nodes.dedup();
            if nodes.len() != t.replicas.len() {
                return fail(format!("{} places two replicas on one node", t.id));
            }

            let targets: Vec<&TabletReplica> = t
                .replicas
                .iter()
                .filter(|r| r.role == ReplicaRole::Target)
                .collect();
            match &t.migration {
                None => {
                    if t.replicas.len() != self.rf {
                        return fail(format!(
                            "{} has {} replicas at quiescence, expected rf={}",
                            t.id,
                            t.replicas.len(),
                            self.rf
                        ));
                    }
                    if !targets.is_empty() {
                        return fail(format!("{} has a target replica but no migration", t.id));
                    }
                }
                Some(m) => {
                    if targets.len() != 1 || targets[0].location != m.target {
                        return fail(format!(
                            "{} migration target replica missing or mismatched",
                            t.id
                        ));
                    }
                    let source_current = t
                        .replicas
                        .iter()
                        .any(|r| r.location == m.source && r.role == ReplicaRole::Current);
                    if m.stage.is_past_point_of_no_return() {
                        // Cleanup committed: outgoing replica removed.
                        if t.replicas.len() != self.rf {
                            return fail(format!(
                                "{} has {} replicas during cleanup, expected rf={}",
                                t.id,
                                t.replicas.len(),
                                self.rf
                            ));
                        }
                        if t.has_replica_at(m.source) {
                            return fail(format!(
                                "{} still lists the outgoing replica during cleanup",
                                t.id
                            ));
                        }
                    } else {
                        if t.replicas.len() != self.rf + 1 {
                            return fail(format!(
                                "{} has {} replicas during {}, expected rf+1={}",
                                t.id,
                                t.replicas.len(),
                                m.stage,
                                self.rf + 1
                            ));
                        }
                        if !source_current {
                            return fail(format!(
                                "{} migration source is not a current replica",
                                t.id
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply a validated transition, producing the successor map. The
    /// epoch is left unchanged; the topology log assigns the committed
    /// epoch. Any rule violation is rejected here, before the proposal
    /// ever reaches the log.
    pub fn apply_transition(
        &self,
        transition: &TabletTransition,
    ) -> Result<TabletMap, TabletError> {
        let mut next = self.clone();
        match transition {
            TabletTransition::BeginMigration {
                tablet,
                source,
                target,
            } => {
                let idx = next.index_of(*tablet).ok_or(TabletError::TabletNotFound {
                    table: next.table,
                    tablet: *tablet,
                })?;
                let t = &mut next.tablets[idx];
                if t.migration.is_some() {
                    return Err(TabletError::MigrationInFlight { tablet: *tablet });
                }
                if !t
                    .replicas
                    .iter()
                    .any(|r| r.location == *source && r.role == ReplicaRole::Current)
                {
                    return Err(TabletError::InvalidTransition {
                        tablet: *tablet,
                        detail: format!("source {} is not a current replica", source),
                    });
                }
                if t.has_replica_on_node(target.node) {
                    return Err(TabletError::InvalidTransition {
                        tablet: *tablet,
                        detail: format!("target node {} already holds a replica", target.node),
                    });
                }
                t.replicas.push(TabletReplica {
                    location: *target,
                    role: ReplicaRole::Target,
                });
                t.sort_replicas();
                t.migration = Some(MigrationState {
                    stage: MigrationStage::Preparing,
                    source: *source,
                    target: *target,
                });
            }

            TabletTransition::AdvanceStage { tablet, from, to } => {
                let idx = next.index_of(*tablet).ok_or(TabletError::TabletNotFound {
                    table: next.table,
                    tablet: *tablet,
                })?;
                let t = &mut next.tablets[idx];
                let m = t.migration.as_mut().ok_or(TabletError::InvalidTransition {
                    tablet: *tablet,
                    detail: "no migration in flight".into(),
                })?;
                if m.stage != *from {
                    return Err(TabletError::InvalidTransition {
                        tablet: *tablet,
                        detail: format!("stage is {}, not {}", m.stage, from),
                    });
                }
                if from.next() != Some(*to) {
                    return Err(TabletError::InvalidTransition {
                        tablet: *tablet,
                        detail: format!("{} does not follow {}", to, from),
                    });
                }
                m.stage = *to;
                if *to == MigrationStage::Cleanup {
                    let source = m.source;
                    t.replicas.retain(|r| r.location != source);
                }
            }

            TabletTransition::FinishMigration { tablet } => {
                let idx = next.index_of(*tablet).ok_or(TabletError::TabletNotFound {
                    table: next.table,
                    tablet: *tablet,
                })?;
                let t = &mut next.tablets[idx];
                let m = t.migration.ok_or(TabletError::InvalidTransition {
                    tablet: *tablet,
                    detail: "no migration in flight".into(),
                })?;
                if m.stage != MigrationStage::Cleanup {
                    return Err(TabletError::InvalidTransition {
                        tablet: *tablet,
                        detail: format!("cannot finish from stage {}", m.stage),
                    });
                }
                for r in &mut t.replicas {
                    if r.location == m.target {
                        r.role = ReplicaRole::Current;
                    }
                }
                t.migration = None;
            }

            TabletTransition::CancelMigration { tablet } => {
                let idx = next.index_of(*tablet).ok_or(TabletError::TabletNotFound {
                    table: next.table,
                    tablet: *tablet,
                })?;
                let t = &mut next.tablets[idx];
                let m = t.migration.ok_or(TabletError::InvalidTransition {
                    tablet: *tablet,
                    detail: "no migration in flight".into(),
                })?;
                if m.stage.is_past_point_of_no_return() {
                    return Err(TabletError::PastPointOfNoReturn { tablet: *tablet });
                }
                t.replicas.retain(|r| r.location != m.target);
                t.migration = None;
            }

            TabletTransition::Split { tablet } => {
                let idx = next.index_of(*tablet).ok_or(TabletError::TabletNotFound {
                    table: next.table,
                    tablet: *tablet,
                })?;
                if next.tablets[idx].migration.is_some() {
                    return Err(TabletError::MigrationInFlight { tablet: *tablet });
                }
                let old = next.tablets[idx].clone();
                let mid = old.range.midpoint().ok_or(TabletError::InvalidTransition {
                    tablet: *tablet,
                    detail: format!("range {} too narrow to split", old.range),
                })?;
                let left = Tablet {
                    id: TabletId(next.next_tablet_id),
                    range: TokenRange {
                        start: old.range.start,
                        end: mid,
                    },
                    replicas: old.replicas.clone(),
                    migration: None,
                };
                let right = Tablet {
                    id: TabletId(next.next_tablet_id + 1),
                    range: TokenRange {
                        start: mid,
                        end: old.range.end,
                    },
                    replicas: old.replicas,
                    migration: None,
                };
                next.next_tablet_id += 2;
                next.tablets.splice(idx..=idx, [left, right]);
            }

            TabletTransition::Merge { left, right } => {
                let li = next.index_of(*left).ok_or(TabletError::TabletNotFound {
                    table: next.table,
                    tablet: *left,
                })?;
                let ri = next.index_of(*right).ok_or(TabletError::TabletNotFound {
                    table: next.table,
                    tablet: *right,
                })?;
                if ri != li + 1 {
                    return Err(TabletError::InvalidTransition {
                        tablet: *left,
                        detail: format!("{} is not the immediate right neighbour", right),
                    });
                }
                let (l, r) = (&next.tablets[li], &next.tablets[ri]);
                if l.migration.is_some() || r.migration.is_some() {
                    return Err(TabletError::MigrationInFlight {
                        tablet: if l.migration.is_some() { *left } else { *right },
                    });
                }
                if l.replicas != r.replicas {
                    return Err(TabletError::InvalidTransition {
                        tablet: *left,
                        detail: "merge requires identical replica sets".into(),
                    });
                }
                let merged = Tablet {
                    id: TabletId(next.next_tablet_id),
                    range: TokenRange {
                        start: l.range.start,
                        end: r.range.end,
                    },
                    replicas: l.replicas.clone(),
                    migration: None,
                };
                next.next_tablet_id += 1;
                next.tablets.splice(li..=ri, [merged]);
            }
        }

        next.validate()?;
        Ok(next)
    }
}
