//! Shard node facade wiring the lock, chunk ownership, commit coordination and
//! topology tracking together.
//!
//! ```text
//!   route(ns, key, version)          read lock ── check version ── belongs_to_me?
//!   donate / receive / split chunk   write lock ── clone table ── install
//!   commit_transaction(txn, shards)  TransactionCoordinator ── executor + store
//!   on_server_description(obs)       TopologyTracker
//! ```

use crate::config::CoreConfig;
use crate::error::{ChunkError, Error, Result};
use crate::lock::ReentrantRwLock;
use crate::metrics::CoreMetrics;
use crate::sharding::{
    ChunkRangeTable, ChunkVersion, ConfigMetadataSource, Document, ShardKey, ShardingState,
};
use crate::topology::{ServerDescription, TopologyTracker};
use crate::txn::{CommitDecision, CoordinatorStore, ParticipantExecutor, TransactionCoordinator};
use crate::types::{ShardId, TxnId};
use std::sync::Arc;

/// Where a request for a key should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// This shard owns the key.
    Local { version: ChunkVersion },
    /// Another shard owns the key.
    Reroute { version: ChunkVersion },
}

impl RouteDecision {
    pub fn is_local(&self) -> bool {
        matches!(self, RouteDecision::Local { .. })
    }
}

/// One shard of the cluster.
#[derive(Debug)]
pub struct ShardNode {
    config: CoreConfig,
    lock: Arc<ReentrantRwLock>,
    sharding: ShardingState,
    topology: TopologyTracker,
    executor: Arc<dyn ParticipantExecutor>,
    store: Arc<dyn CoordinatorStore>,
    metrics: Arc<CoreMetrics>,
}

impl ShardNode {
    /// Create a node. Fails if the configuration is invalid.
    pub fn new(
        config: CoreConfig,
        executor: Arc<dyn ParticipantExecutor>,
        store: Arc<dyn CoordinatorStore>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(CoreMetrics::new());
        let lock = Arc::new(ReentrantRwLock::new().with_metrics(metrics.clone()));
        let sharding = ShardingState::new(config.shard_id.clone(), metrics.clone());
        let topology = TopologyTracker::new(&config.topology, metrics.clone());

        tracing::info!(
            shard = %config.shard_id,
            seeds = ?config.topology.seeds,
            "Shard node created"
        );

        Ok(Self {
            config,
            lock,
            sharding,
            topology,
            executor,
            store,
            metrics,
        })
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.config.shard_id
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The node-wide lock, shared with anything that must exclude chunk
    /// table changes.
    pub fn lock(&self) -> &Arc<ReentrantRwLock> {
        &self.lock
    }

    pub fn sharding(&self) -> &ShardingState {
        &self.sharding
    }

    pub fn topology(&self) -> &TopologyTracker {
        &self.topology
    }

    pub fn metrics(&self) -> &Arc<CoreMetrics> {
        &self.metrics
    }

    /// Load `ns` from the config metadata and install its table.
    pub fn load_collection(
        &self,
        ns: &str,
        source: &dyn ConfigMetadataSource,
    ) -> Result<Arc<ChunkRangeTable>> {
        let _guard = self.lock.write();
        Ok(self.sharding.refresh(ns, source)?)
    }

    /// Decide where a request for `key` runs.
    ///
    /// Fails with `StaleShardVersion` when the router's version is out of
    /// date, and with `Timeout` when the read lock cannot be taken.
    pub fn route(&self, ns: &str, key: &ShardKey, received: ChunkVersion) -> Result<RouteDecision> {
        let _guard = self
            .lock
            .try_read(self.config.lock.default_try_lock_timeout)
            .ok_or(Error::Timeout)?;

        let table = self.sharding.check_shard_version(ns, received)?;
        let version = table.version();
        if table.belongs_to_me(key) {
            Ok(RouteDecision::Local { version })
        } else {
            tracing::debug!(ns = ns, key = %key, "Key not owned, rerouting");
            Ok(RouteDecision::Reroute { version })
        }
    }

    /// [`route`](Self::route) for a whole document.
    pub fn route_doc(&self, ns: &str, doc: &Document, received: ChunkVersion) -> Result<RouteDecision> {
        let key = match self.sharding.table(ns) {
            Some(table) => table.pattern().extract(doc),
            None => return Err(ChunkError::NamespaceNotSharded(ns.to_string()).into()),
        };
        self.route(ns, &key, received)
    }

    /// Give away the chunk `[min, max)`.
    pub fn donate_chunk(
        &self,
        ns: &str,
        min: &ShardKey,
        max: &ShardKey,
        new_version: ChunkVersion,
    ) -> Result<Arc<ChunkRangeTable>> {
        self.mutate_table(ns, |table| table.clone_minus(min, max, new_version))
    }

    /// Take ownership of the chunk `[min, max)`.
    pub fn receive_chunk(
        &self,
        ns: &str,
        min: &ShardKey,
        max: &ShardKey,
        new_version: ChunkVersion,
    ) -> Result<Arc<ChunkRangeTable>> {
        self.mutate_table(ns, |table| table.clone_plus(min, max, new_version))
    }

    /// Split the owned chunk `[min, max)` at `split_keys`.
    pub fn split_chunk(
        &self,
        ns: &str,
        min: &ShardKey,
        max: &ShardKey,
        split_keys: &[ShardKey],
        new_version: ChunkVersion,
    ) -> Result<Arc<ChunkRangeTable>> {
        self.mutate_table(ns, |table| {
            table.clone_split(min, max, split_keys, new_version)
        })
    }

    fn mutate_table<F>(&self, ns: &str, mutate: F) -> Result<Arc<ChunkRangeTable>>
    where
        F: FnOnce(&ChunkRangeTable) -> std::result::Result<ChunkRangeTable, ChunkError>,
    {
        let _guard = self.lock.write();
        let current = self
            .sharding
            .table(ns)
            .ok_or_else(|| ChunkError::NamespaceNotSharded(ns.to_string()))?;
        let next = mutate(&current)?;
        Ok(self.sharding.install(ns, next)?)
    }

    /// Coordinate two-phase commit of `txn` across `participants`.
    pub async fn commit_transaction(
        &self,
        txn: TxnId,
        participants: Vec<ShardId>,
    ) -> Result<CommitDecision> {
        let coordinator = self.coordinator(txn);
        coordinator.run_commit(participants).await
    }

    /// Finish every transaction whose coordinator document survived a restart.
    pub async fn recover_transactions(&self) -> Result<Vec<(TxnId, Result<CommitDecision>)>> {
        TransactionCoordinator::recover_all(
            &self.config.commit,
            self.executor.clone(),
            self.store.clone(),
            self.metrics.clone(),
        )
        .await
    }

    fn coordinator(&self, txn: TxnId) -> TransactionCoordinator {
        TransactionCoordinator::new(
            txn,
            self.config.commit.clone(),
            self.executor.clone(),
            self.store.clone(),
            self.metrics.clone(),
        )
    }

    /// Feed a server observation to the topology tracker.
    pub fn on_server_description(&self, observation: ServerDescription) -> bool {
        self.topology.on_server_description(observation)
    }
}
