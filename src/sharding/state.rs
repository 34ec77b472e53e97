//! Per-namespace chunk table registry of a shard.

use super::chunk_table::ChunkRangeTable;
use super::metadata::ConfigMetadataSource;
use super::version::ChunkVersion;
use crate::error::ChunkError;
use crate::metrics::CoreMetrics;
use crate::types::ShardId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Current chunk table of every sharded namespace on this shard.
///
/// Tables are immutable and shared by `Arc`; only the pointer per namespace is
/// swapped under the lock, so readers keep using the table they loaded while a
/// newer one is installed.
#[derive(Debug)]
pub struct ShardingState {
    shard_id: ShardId,
    tables: RwLock<HashMap<String, Arc<ChunkRangeTable>>>,
    metrics: Arc<CoreMetrics>,
}

impl ShardingState {
    pub fn new(shard_id: ShardId, metrics: Arc<CoreMetrics>) -> Self {
        Self {
            shard_id,
            tables: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// The installed table for `ns`, if any.
    pub fn table(&self, ns: &str) -> Option<Arc<ChunkRangeTable>> {
        self.tables.read().get(ns).cloned()
    }

    /// The installed shard version for `ns`, if any.
    pub fn shard_version(&self, ns: &str) -> Option<ChunkVersion> {
        self.tables.read().get(ns).map(|t| t.version())
    }

    /// Namespaces with an installed table.
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Install `table` for `ns`.
    ///
    /// Fails with `VersionNotMonotonic` if the installed table is newer. An
    /// empty table at version zero is always accepted: a shard that owns no
    /// chunks of `ns` has no version to keep.
    pub fn install(
        &self,
        ns: &str,
        table: ChunkRangeTable,
    ) -> Result<Arc<ChunkRangeTable>, ChunkError> {
        let mut tables = self.tables.write();
        if let Some(current) = tables.get(ns) {
            let ownerless_reset = table.num_chunks() == 0 && !table.version().is_set();
            if table.version() < current.version() && !ownerless_reset {
                tracing::warn!(
                    ns = ns,
                    current = %current.version(),
                    requested = %table.version(),
                    "Rejecting chunk table version regression"
                );
                return Err(ChunkError::VersionNotMonotonic {
                    current: current.version(),
                    requested: table.version(),
                });
            }
        }

        let table = Arc::new(table);
        tables.insert(ns.to_string(), table.clone());
        self.metrics.chunk_tables_installed.inc();
        tracing::info!(
            ns = ns,
            shard = %self.shard_id,
            version = %table.version(),
            chunks = table.num_chunks(),
            "Installed chunk table"
        );
        Ok(table)
    }

    /// Reload `ns` from the config metadata and install the result.
    pub fn refresh(
        &self,
        ns: &str,
        source: &dyn ConfigMetadataSource,
    ) -> Result<Arc<ChunkRangeTable>, ChunkError> {
        let table = ChunkRangeTable::load(source, ns, &self.shard_id)?;
        self.install(ns, table)
    }

    /// Forget the table for `ns`.
    pub fn remove(&self, ns: &str) -> Option<Arc<ChunkRangeTable>> {
        self.tables.write().remove(ns)
    }

    /// Check the version a router attached to a request.
    ///
    /// Returns the installed table when the major versions agree.
    pub fn check_shard_version(
        &self,
        ns: &str,
        received: ChunkVersion,
    ) -> Result<Arc<ChunkRangeTable>, ChunkError> {
        let table = self
            .table(ns)
            .ok_or_else(|| ChunkError::NamespaceNotSharded(ns.to_string()))?;

        let wanted = table.version();
        if received.major != wanted.major {
            self.metrics.stale_shard_version.inc();
            tracing::debug!(
                ns = ns,
                received = %received,
                wanted = %wanted,
                "Stale shard version"
            );
            return Err(ChunkError::StaleShardVersion {
                ns: ns.to_string(),
                received,
                wanted,
            });
        }
        Ok(table)
    }
}
