//! Configuration types for the shardline core.

use crate::error::{Error, Result};
use crate::types::ShardId;
use std::time::Duration;

/// Main configuration for a shard node.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Name of the shard this node serves.
    pub shard_id: ShardId,

    /// Reentrant lock configuration.
    pub lock: LockConfig,

    /// Two-phase commit retry configuration.
    pub commit: CommitConfig,

    /// Topology tracking configuration.
    pub topology: TopologyConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            shard_id: ShardId::from("shard0000"),
            lock: LockConfig::default(),
            commit: CommitConfig::default(),
            topology: TopologyConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Create a new configuration for the given shard.
    pub fn new(shard_id: impl Into<ShardId>) -> Self {
        Self {
            shard_id: shard_id.into(),
            ..Default::default()
        }
    }

    /// Set lock configuration.
    pub fn with_lock_config(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Set commit configuration.
    pub fn with_commit_config(mut self, commit: CommitConfig) -> Self {
        self.commit = commit;
        self
    }

    /// Set topology configuration.
    pub fn with_topology_config(mut self, topology: TopologyConfig) -> Self {
        self.topology = topology;
        self
    }

    /// Check the configuration for settings that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.shard_id.as_str().is_empty() {
            return Err(Error::Config("shard_id must not be empty".into()));
        }
        self.commit.validate()?;
        if self.topology.seeds.is_empty() {
            return Err(Error::Config("topology needs at least one seed".into()));
        }
        if self.topology.direct_connection && self.topology.seeds.len() != 1 {
            return Err(Error::Config(format!(
                "direct connection needs exactly one seed, got {}",
                self.topology.seeds.len()
            )));
        }
        Ok(())
    }
}

/// Reentrant lock configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Timeout used by `try_write`/`try_read` callers that do not pass one.
    pub default_try_lock_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_try_lock_timeout: Duration::from_millis(500),
        }
    }
}

impl LockConfig {
    /// Set the default try-lock timeout.
    pub fn with_default_try_lock_timeout(mut self, timeout: Duration) -> Self {
        self.default_try_lock_timeout = timeout;
        self
    }
}

/// Retry policy for prepare, commit and abort sends.
#[derive(Debug, Clone)]
pub struct CommitConfig {
    /// Delay before the first resend.
    pub initial_backoff: Duration,

    /// Upper bound on the delay between resends.
    pub max_backoff: Duration,

    /// Maximum number of attempts per participant and command.
    pub max_send_attempts: u32,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_send_attempts: 20,
        }
    }
}

impl CommitConfig {
    /// Set the initial backoff.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Set the maximum backoff.
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set the maximum number of attempts.
    pub fn with_max_send_attempts(mut self, attempts: u32) -> Self {
        self.max_send_attempts = attempts;
        self
    }

    /// Backoff to wait after the given number of failed attempts (1-based).
    pub fn backoff_for(&self, failed_attempts: u32) -> Duration {
        let shift = failed_attempts.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    fn validate(&self) -> Result<()> {
        if self.max_send_attempts == 0 {
            return Err(Error::Config("max_send_attempts must be at least 1".into()));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(Error::Config(format!(
                "initial_backoff {:?} exceeds max_backoff {:?}",
                self.initial_backoff, self.max_backoff
            )));
        }
        Ok(())
    }
}

/// Topology tracking configuration.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Seed addresses ("host:port").
    pub seeds: Vec<String>,

    /// Expected replica set name, if any.
    pub set_name: Option<String>,

    /// Servers not heard from within this window are reported as stale.
    pub staleness_window: Duration,

    /// Talk to the single seed directly instead of discovering a topology.
    pub direct_connection: bool,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            seeds: vec!["localhost:27017".to_string()],
            set_name: None,
            staleness_window: Duration::from_secs(30),
            direct_connection: false,
        }
    }
}

impl TopologyConfig {
    /// Create a topology config from seed addresses.
    pub fn new(seeds: Vec<String>) -> Self {
        Self {
            seeds,
            ..Default::default()
        }
    }

    /// Set the expected replica set name.
    pub fn with_set_name(mut self, name: impl Into<String>) -> Self {
        self.set_name = Some(name.into());
        self
    }

    /// Set the staleness window.
    pub fn with_staleness_window(mut self, window: Duration) -> Self {
        self.staleness_window = window;
        self
    }

    /// Connect directly to the single seed.
    pub fn with_direct_connection(mut self, direct: bool) -> Self {
        self.direct_connection = direct;
        self
    }
}
