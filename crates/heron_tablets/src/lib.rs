//! Tablet-based data distribution and load balancing.
//!
//! Each table's key space is split into many independently placed
//! tablets. This crate tracks which node/shard holds each replica and
//! continuously rebalances that placement as the cluster grows, shrinks,
//! or becomes skewed, without interrupting the foreground read/write
//! path and without ever dropping below the configured replication
//! factor.
//!
//! # Architecture
//!
//! ```text
//!   LoadBalancer ──▶ MigrationPlan ──▶ MigrationCoordinator
//!        │                                   │ stage commits
//!        ▼                                   ▼
//!   PlacementRegistry ◀────────────── TopologyLog (linearizable)
//!                                            │
//!                                       Streamer (bulk transfer)
//! ```
//!
//! All placement mutations are serialized through the topology log's
//! epoch-guarded commit-or-conflict protocol; components hold only
//! immutable snapshots plus an epoch, never a live mutable reference.

pub mod admin;
pub mod balancer;
pub mod bandwidth;
pub mod directory;
pub mod events;
pub mod load;
pub mod migration;
pub mod model;
pub mod registry;
pub mod runner;
pub mod streamer;
pub mod topology;

pub use admin::{TabletAdmin, TableDescription, TabletView};
pub use balancer::{LoadBalancer, MigrationPlan, PlanKind, ProposalCategory};
pub use bandwidth::{BandwidthError, BandwidthLimiter, BandwidthSnapshot};
pub use directory::{NodeDirectory, NodeInfo, NodeState};
pub use events::{EventSeverity, TabletEvent, TabletEventKind, TabletEventLog};
pub use load::{LoadSnapshot, LoadTracker};
pub use migration::{MigrationCoordinator, MigrationOutcome};
pub use model::{
    MigrationStage, MigrationState, ReplicaLocation, ReplicaRole, Tablet, TabletMap,
    TabletReplica, TabletTransition, TokenRange,
};
pub use registry::PlacementRegistry;
pub use runner::{BalancerRunner, BalancerRunnerHandle};
pub use streamer::{NoopStreamer, ScriptedStreamer, Streamer, TransferError};
pub use topology::{InMemoryTopologyLog, TopologyLog};
