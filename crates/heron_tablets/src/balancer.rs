//! Load balancer: one planning round over a consistent snapshot of
//! placement and load, producing a bounded set of proposals.
//!
//! Proposal categories are evaluated in fixed priority order, drain
//! first, general balancing last. Greedy selection with a hysteresis
//! gate on the expected gain keeps adjacent rounds from moving the same
//! data back and forth. Replica counts are the primary metric; observed
//! shard bytes order shards within a count, and remaining ties break by
//! lowest node id then lowest shard id so a given input always produces
//! the same plan.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use heron_common::config::BalancerConfig;
use heron_common::types::{TableId, TabletId};

use crate::directory::NodeDirectory;
use crate::load::LoadSnapshot;
use crate::model::{ReplicaLocation, TabletMap};
use crate::registry::PlacementRegistry;

/// Why a move was proposed, in decreasing priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProposalCategory {
    /// Evacuating a node flagged for decommission.
    Drain,
    /// Bootstrapping a node far below average load.
    Fill,
    /// Unloading a shard far above average load.
    Relieve,
    /// General imbalance reduction; also tags split/merge proposals.
    Balance,
}

impl std::fmt::Display for ProposalCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProposalCategory::Drain => write!(f, "drain"),
            ProposalCategory::Fill => write!(f, "fill"),
            ProposalCategory::Relieve => write!(f, "relieve"),
            ProposalCategory::Balance => write!(f, "balance"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanKind {
    Migrate {
        from: ReplicaLocation,
        to: ReplicaLocation,
    },
    Split,
    Merge {
        right: TabletId,
    },
}

/// One accepted proposal from a balancing round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    pub table: TableId,
    pub tablet: TabletId,
    pub kind: PlanKind,
    pub category: ProposalCategory,
    /// Estimated bytes involved, charged against the bandwidth budget
    /// for migrations. 0 when no estimate is known.
    pub size_estimate: u64,
}

pub struct LoadBalancer {
    registry: Arc<PlacementRegistry>,
    directory: Arc<NodeDirectory>,
    config: BalancerConfig,
}

struct Round<'a> {
    maps: Vec<(TableId, Arc<TabletMap>)>,
    /// Replica count per shard across all tables, the primary balancing
    /// metric. Observed shard bytes from `load` order shards within a
    /// count.
    counts: BTreeMap<ReplicaLocation, usize>,
    avg: f64,
    /// Tablets already migrating or already claimed by this round.
    used: HashSet<(TableId, TabletId)>,
    load: &'a LoadSnapshot,
}

impl LoadBalancer {
    pub fn new(
        registry: Arc<PlacementRegistry>,
        directory: Arc<NodeDirectory>,
        config: BalancerConfig,
    ) -> Self {
        Self {
            registry,
            directory,
            config,
        }
    }

    /// Plan one balancing round against the current committed placement
    /// and `load`. `in_flight` migrations from earlier rounds count
    /// against the concurrency cap. Pure planning; nothing is
    /// submitted here.
    pub fn plan_round(&self, load: &LoadSnapshot, in_flight: usize) -> Vec<MigrationPlan> {
        let shards = self.directory.all_shards();
        if shards.is_empty() {
            return Vec::new();
        }

        let mut maps = Vec::new();
        for table in self.registry.tables() {
            if self.registry.is_halted(table) {
                continue;
            }
            if let Ok(snap) = self.registry.snapshot(table) {
                maps.push((table, snap));
            }
        }

        let mut counts: BTreeMap<ReplicaLocation, usize> =
            shards.iter().map(|s| (*s, 0)).collect();
        let mut used = HashSet::new();
        for (table, map) in &maps {
            for t in &map.tablets {
                if t.migration.is_some() {
                    used.insert((*table, t.id));
                }
                for r in &t.replicas {
                    if let Some(c) = counts.get_mut(&r.location) {
                        *c += 1;
                    }
                }
            }
        }
        let total: usize = counts.values().sum();
        let avg = total as f64 / counts.len() as f64;

        let mut round = Round {
            maps,
            counts,
            avg,
            used,
            load,
        };

        let mut plans = Vec::new();
        let mut budget = self
            .config
            .max_concurrent_migrations
            .saturating_sub(in_flight);
        while budget > 0 && plans.len() < self.config.max_actions_per_round {
            match self.next_move(&round) {
                Some(plan) => {
                    if let PlanKind::Migrate { from, to } = plan.kind {
                        if let Some(c) = round.counts.get_mut(&from) {
                            *c -= 1;
                        }
                        if let Some(c) = round.counts.get_mut(&to) {
                            *c += 1;
                        }
                    }
                    round.used.insert((plan.table, plan.tablet));
                    budget -= 1;
                    tracing::debug!(
                        table = %plan.table,
                        tablet = %plan.tablet,
                        category = %plan.category,
                        "proposing migration"
                    );
                    plans.push(plan);
                }
                None => break,
            }
        }

        self.propose_resizes(&mut round, &mut plans);
        plans
    }

    // ── Move selection ──

    /// The single best move available right now, by category priority.
    fn next_move(&self, round: &Round<'_>) -> Option<MigrationPlan> {
        // Drain: evacuate decommissioning nodes unconditionally.
        let drain_sources = self.sources_desc(round, |loc, count| {
            count > 0 && self.directory.is_draining(loc.node)
        });
        if let Some(plan) =
            self.pick(round, &drain_sources, ProposalCategory::Drain, false)
        {
            return Some(plan);
        }

        // Fill: bootstrap shards far below average. Framed as a move
        // from the most loaded source, gated on gain like the rest.
        let has_fill_target = round.counts.iter().any(|(loc, &c)| {
            !self.directory.is_draining(loc.node)
                && (c as f64) < self.config.fill_fraction * round.avg
        });
        if has_fill_target {
            let sources = self.sources_desc(round, |loc, count| {
                count > 0 && !self.directory.is_draining(loc.node)
            });
            if let Some(plan) = self.pick(round, &sources, ProposalCategory::Fill, true) {
                return Some(plan);
            }
        }

        // Relieve: shards far above average.
        let relieve_sources = self.sources_desc(round, |loc, count| {
            !self.directory.is_draining(loc.node)
                && (count as f64) > self.config.relieve_fraction * round.avg
        });
        if let Some(plan) =
            self.pick(round, &relieve_sources, ProposalCategory::Relieve, true)
        {
            return Some(plan);
        }

        // General balancing.
        let sources = self.sources_desc(round, |loc, count| {
            count > 0 && !self.directory.is_draining(loc.node)
        });
        self.pick(round, &sources, ProposalCategory::Balance, true)
    }

    /// Shards matching `want`, most loaded first: replica count, then
    /// observed bytes, then lowest node/shard id.
    fn sources_desc<F>(&self, round: &Round<'_>, want: F) -> Vec<ReplicaLocation>
    where
        F: Fn(ReplicaLocation, usize) -> bool,
    {
        let mut sources: Vec<(usize, u64, ReplicaLocation)> = round
            .counts
            .iter()
            .filter(|(loc, &c)| want(**loc, c))
            .map(|(loc, &c)| (c, round.load.shard_bytes(*loc), *loc))
            .collect();
        sources.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));
        sources.into_iter().map(|(_, _, loc)| loc).collect()
    }

    /// Greedy: first workable (source, destination, tablet) triple in
    /// priority order. Destinations are tried least loaded first, with
    /// observed bytes breaking count ties.
    fn pick(
        &self,
        round: &Round<'_>,
        sources: &[ReplicaLocation],
        category: ProposalCategory,
        gated: bool,
    ) -> Option<MigrationPlan> {
        let mut dests: Vec<(usize, u64, ReplicaLocation)> = round
            .counts
            .iter()
            .filter(|(loc, _)| !self.directory.is_draining(loc.node))
            .map(|(loc, &c)| (c, round.load.shard_bytes(*loc), *loc))
            .collect();
        dests.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        for &src in sources {
            let src_count = *round.counts.get(&src)?;
            for &(dst_count, _, dst) in &dests {
                if dst.node == src.node {
                    continue;
                }
                if gated {
                    let gain =
                        (src_count as f64 - dst_count as f64 - 1.0) / round.avg.max(1.0);
                    if gain <= self.config.hysteresis_epsilon {
                        // Destinations only get more loaded from here.
                        break;
                    }
                }
                if let Some((table, tablet)) = self.movable_tablet(round, src, dst) {
                    return Some(MigrationPlan {
                        table,
                        tablet,
                        kind: PlanKind::Migrate { from: src, to: dst },
                        category,
                        size_estimate: round.load.tablet_bytes(table, tablet).unwrap_or(0),
                    });
                }
            }
        }
        None
    }

    /// First tablet with a replica on `src` that may move to `dst`:
    /// quiescent, unclaimed, and not already replicated on `dst`'s node.
    fn movable_tablet(
        &self,
        round: &Round<'_>,
        src: ReplicaLocation,
        dst: ReplicaLocation,
    ) -> Option<(TableId, TabletId)> {
        for (table, map) in &round.maps {
            for t in &map.tablets {
                if round.used.contains(&(*table, t.id)) {
                    continue;
                }
                if t.migration.is_none()
                    && t.has_replica_at(src)
                    && !t.has_replica_on_node(dst.node)
                {
                    return Some((*table, t.id));
                }
            }
        }
        None
    }

    // ── Split / merge ──

    fn propose_resizes(&self, round: &mut Round<'_>, plans: &mut Vec<MigrationPlan>) {
        for (table, map) in &round.maps {
            let mut i = 0;
            while i < map.tablets.len() {
                if plans.len() >= self.config.max_actions_per_round {
                    return;
                }
                let t = &map.tablets[i];
                if round.used.contains(&(*table, t.id)) || t.migration.is_some() {
                    i += 1;
                    continue;
                }
                let size = round.load.tablet_bytes(*table, t.id);

                if let Some(size) = size {
                    if size >= self.config.split_threshold_bytes
                        && t.range.midpoint().is_some()
                    {
                        tracing::info!(
                            table = %table,
                            tablet = %t.id,
                            size_bytes = size,
                            "proposing split of oversized tablet"
                        );
                        plans.push(MigrationPlan {
                            table: *table,
                            tablet: t.id,
                            kind: PlanKind::Split,
                            category: ProposalCategory::Balance,
                            size_estimate: size,
                        });
                        i += 1;
                        continue;
                    }
                }

                // Merge with the right neighbour when both are tiny,
                // quiescent, and identically placed.
                if i + 1 < map.tablets.len() {
                    let r = &map.tablets[i + 1];
                    let r_size = round.load.tablet_bytes(*table, r.id);
                    if let (Some(ls), Some(rs)) = (size, r_size) {
                        if r.migration.is_none()
                            && !round.used.contains(&(*table, r.id))
                            && t.replicas == r.replicas
                            && ls + rs <= self.config.merge_threshold_bytes
                        {
                            tracing::info!(
                                table = %table,
                                left = %t.id,
                                right = %r.id,
                                "proposing merge of adjacent small tablets"
                            );
                            plans.push(MigrationPlan {
                                table: *table,
                                tablet: t.id,
                                kind: PlanKind::Merge { right: r.id },
                                category: ProposalCategory::Balance,
                                size_estimate: ls + rs,
                            });
                            i += 2;
                            continue;
                        }
                    }
                }
                i += 1;
            }
        }
    }
}
