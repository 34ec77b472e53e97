//! In-process metrics for the shardline core.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       CoreMetrics                          │
//! │  ┌──────────────┐  ┌───────────────┐  ┌────────────────┐  │
//! │  │    Lock      │  │   Sharding    │  │  Coordinator   │  │
//! │  │ - acquires   │  │ - installs    │  │ - commits      │  │
//! │  │ - recursion  │  │ - stale vers. │  │ - aborts       │  │
//! │  │ - timeouts   │  │               │  │ - broken       │  │
//! │  └──────────────┘  └───────────────┘  └────────────────┘  │
//! │                  ┌──────────────────┐                      │
//! │                  │    Topology      │                      │
//! │                  │ - stale obs.     │                      │
//! │                  │ - pool resets    │                      │
//! │                  └──────────────────┘                      │
//! └───────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;

pub use counters::Counter;
pub use gauges::{Gauge, GaugeGuard};

/// Metrics shared by every component of a shard node.
#[derive(Debug)]
pub struct CoreMetrics {
    // Lock
    /// Real (non-recursive) write lock acquisitions.
    pub lock_write_acquired: Counter,
    /// Real (non-recursive) read lock acquisitions.
    pub lock_read_acquired: Counter,
    /// Acquisitions satisfied by recursion on an existing hold.
    pub lock_recursive_acquired: Counter,
    /// Try-lock attempts that gave up after their timeout.
    pub lock_try_timeouts: Counter,

    // Sharding
    /// Chunk tables installed into the sharding state.
    pub chunk_tables_installed: Counter,
    /// Requests rejected because the router's shard version was stale.
    pub stale_shard_version: Counter,

    // Coordinator
    /// Transactions decided commit.
    pub txn_committed: Counter,
    /// Transactions decided abort.
    pub txn_aborted: Counter,
    /// Coordinators that ended in the broken state.
    pub txn_broken: Counter,
    /// Prepare/commit/abort sends that were retried.
    pub txn_send_retries: Counter,
    /// Coordinators currently running.
    pub coordinators_active: Gauge,

    // Topology
    /// Server observations discarded as stale.
    pub topology_stale_observations: Counter,
    /// Connection pool generations bumped.
    pub topology_pool_resets: Counter,
}

impl Default for CoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            lock_write_acquired: Counter::new(
                "shardline_lock_write_acquired_total",
                "Write lock acquisitions that reached the underlying primitive",
            ),
            lock_read_acquired: Counter::new(
                "shardline_lock_read_acquired_total",
                "Read lock acquisitions that reached the underlying primitive",
            ),
            lock_recursive_acquired: Counter::new(
                "shardline_lock_recursive_acquired_total",
                "Lock requests satisfied by an existing hold on the same thread",
            ),
            lock_try_timeouts: Counter::new(
                "shardline_lock_try_timeouts_total",
                "Try-lock attempts that timed out",
            ),
            chunk_tables_installed: Counter::new(
                "shardline_chunk_tables_installed_total",
                "Chunk range tables installed",
            ),
            stale_shard_version: Counter::new(
                "shardline_stale_shard_version_total",
                "Requests rejected with a stale shard version",
            ),
            txn_committed: Counter::new(
                "shardline_txn_committed_total",
                "Distributed transactions decided commit",
            ),
            txn_aborted: Counter::new(
                "shardline_txn_aborted_total",
                "Distributed transactions decided abort",
            ),
            txn_broken: Counter::new(
                "shardline_txn_broken_total",
                "Coordinators that entered the broken state",
            ),
            txn_send_retries: Counter::new(
                "shardline_txn_send_retries_total",
                "Participant sends that were retried",
            ),
            coordinators_active: Gauge::new(
                "shardline_coordinators_active",
                "Coordinators currently driving a transaction",
            ),
            topology_stale_observations: Counter::new(
                "shardline_topology_stale_observations_total",
                "Server observations discarded as stale",
            ),
            topology_pool_resets: Counter::new(
                "shardline_topology_pool_resets_total",
                "Connection pool generations bumped after errors",
            ),
        }
    }

    /// Get a point-in-time snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            lock_write_acquired: self.lock_write_acquired.get(),
            lock_read_acquired: self.lock_read_acquired.get(),
            lock_recursive_acquired: self.lock_recursive_acquired.get(),
            lock_try_timeouts: self.lock_try_timeouts.get(),
            chunk_tables_installed: self.chunk_tables_installed.get(),
            stale_shard_version: self.stale_shard_version.get(),
            txn_committed: self.txn_committed.get(),
            txn_aborted: self.txn_aborted.get(),
            txn_broken: self.txn_broken.get(),
            txn_send_retries: self.txn_send_retries.get(),
            coordinators_active: self.coordinators_active.get(),
            topology_stale_observations: self.topology_stale_observations.get(),
            topology_pool_resets: self.topology_pool_resets.get(),
        }
    }

    /// Format counters and gauges in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        macro_rules! add_metric {
            ($metric:expr, $kind:literal) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $metric.name(),
                    $metric.help(),
                    $metric.name(),
                    $kind,
                    $metric.name(),
                    $metric.get()
                ));
            };
        }

        add_metric!(self.lock_write_acquired, "counter");
        add_metric!(self.lock_read_acquired, "counter");
        add_metric!(self.lock_recursive_acquired, "counter");
        add_metric!(self.lock_try_timeouts, "counter");
        add_metric!(self.chunk_tables_installed, "counter");
        add_metric!(self.stale_shard_version, "counter");
        add_metric!(self.txn_committed, "counter");
        add_metric!(self.txn_aborted, "counter");
        add_metric!(self.txn_broken, "counter");
        add_metric!(self.txn_send_retries, "counter");
        add_metric!(self.coordinators_active, "gauge");
        add_metric!(self.topology_stale_observations, "counter");
        add_metric!(self.topology_pool_resets, "counter");

        output
    }
}

/// Point-in-time snapshot of [`CoreMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub lock_write_acquired: u64,
    pub lock_read_acquired: u64,
    pub lock_recursive_acquired: u64,
    pub lock_try_timeouts: u64,
    pub chunk_tables_installed: u64,
    pub stale_shard_version: u64,
    pub txn_committed: u64,
    pub txn_aborted: u64,
    pub txn_broken: u64,
    pub txn_send_retries: u64,
    pub coordinators_active: i64,
    pub topology_stale_observations: u64,
    pub topology_pool_resets: u64,
}

impl MetricsSnapshot {
    /// Fraction of decided transactions that committed.
    pub fn commit_rate(&self) -> f64 {
        let decided = self.txn_committed + self.txn_aborted;
        if decided == 0 {
            0.0
        } else {
            self.txn_committed as f64 / decided as f64
        }
    }
}
