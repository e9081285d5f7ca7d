//! Configuration for the tablet subsystem.
//!
//! All numeric balancing policy values (hysteresis epsilon, split/merge
//! thresholds, concurrency and bandwidth limits, retry budgets) are
//! deployment policy, not design constants. They live here with
//! documented defaults and are read once at startup.

use serde::{Deserialize, Serialize};

/// Top-level tablet subsystem configuration (`[tablets]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletsConfig {
    /// Initial tablet count for a newly created table with tablet-based
    /// distribution enabled. Fixed at table creation; not
    /// re-interpretable mid-lifetime.
    pub initial_tablets_per_table: usize,
    /// Replication factor: replicas per tablet at quiescence.
    pub replication_factor: usize,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub bandwidth: BandwidthConfig,
}

impl Default for TabletsConfig {
    fn default() -> Self {
        Self {
            initial_tablets_per_table: 4,
            replication_factor: 3,
            balancer: BalancerConfig::default(),
            migration: MigrationConfig::default(),
            bandwidth: BandwidthConfig::default(),
        }
    }
}

/// Load balancer knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Interval between balancing rounds in milliseconds.
    pub interval_ms: u64,
    /// Minimum normalized imbalance gain a move must achieve before it
    /// is proposed. Prevents oscillation across adjacent rounds.
    pub hysteresis_epsilon: f64,
    /// A shard below this fraction of the cluster-wide average load is
    /// a fill target (new-node bootstrap).
    pub fill_fraction: f64,
    /// A shard above this fraction of the cluster-wide average load is
    /// relieved with priority over general balancing.
    pub relieve_fraction: f64,
    /// Estimated tablet size above which a split is proposed.
    pub split_threshold_bytes: u64,
    /// Estimated tablet size below which adjacent tablets become merge
    /// candidates. Kept well below half the split threshold so a
    /// split/merge pair cannot oscillate.
    pub merge_threshold_bytes: u64,
    /// Maximum migrations in flight at once, cluster-wide.
    pub max_concurrent_migrations: usize,
    /// Maximum actions (migrations, splits, merges) proposed per round.
    pub max_actions_per_round: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            hysteresis_epsilon: 0.05,
            fill_fraction: 0.5,
            relieve_fraction: 1.5,
            split_threshold_bytes: 10 * 1024 * 1024 * 1024, // 10 GiB
            merge_threshold_bytes: 1280 * 1024 * 1024,      // 1.25 GiB
            max_concurrent_migrations: 4,
            max_actions_per_round: 16,
        }
    }
}

/// Migration coordinator knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Bounded retries of a failed streaming transfer before the
    /// migration degrades to cancelled.
    pub max_transfer_retries: u32,
    /// Base back-off between transfer retries (doubles per attempt).
    pub retry_backoff_ms: u64,
    /// Timeout for a single streaming transfer; treated identically to
    /// a transfer failure. 0 = no timeout.
    pub transfer_timeout_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            max_transfer_retries: 3,
            retry_backoff_ms: 500,
            transfer_timeout_ms: 600_000,
        }
    }
}

/// Global bandwidth budget for bulk streaming, protecting foreground
/// latency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthConfig {
    /// Sustained streaming budget in bytes per second.
    pub bytes_per_sec: u64,
    /// Burst capacity in bytes.
    pub burst_bytes: u64,
    /// Maximum time a migration waits for bandwidth tokens before the
    /// wait is treated as a transient transfer failure.
    pub max_wait_ms: u64,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            bytes_per_sec: 64 * 1024 * 1024, // 64 MiB/s
            burst_bytes: 256 * 1024 * 1024,  // 256 MiB
            max_wait_ms: 30_000,
        }
    }
}
