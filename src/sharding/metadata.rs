//! Config metadata collaborator consumed when building chunk tables.

use super::key::{ShardKey, ShardKeyPattern};
use super::version::ChunkVersion;
use crate::error::ChunkError;
use crate::types::ShardId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Sharding metadata of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub pattern: ShardKeyPattern,
    pub dropped: bool,
}

/// One chunk document from the config metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub min: ShardKey,
    pub max: ShardKey,
    pub shard: ShardId,
    pub lastmod: ChunkVersion,
}

impl ChunkMetadata {
    pub fn new(min: ShardKey, max: ShardKey, shard: ShardId, lastmod: ChunkVersion) -> Self {
        Self {
            min,
            max,
            shard,
            lastmod,
        }
    }
}

/// Source of collection and chunk metadata, typically the config servers.
pub trait ConfigMetadataSource: Send + Sync + std::fmt::Debug {
    /// Look up a collection's shard key pattern and dropped flag.
    ///
    /// Fails with `CollectionNotFound` when the collection is not sharded.
    fn collection(&self, ns: &str) -> Result<CollectionMetadata, ChunkError>;

    /// Chunks of `ns` owned by `shard`, sorted by `min`.
    fn chunks(&self, ns: &str, shard: &ShardId) -> Result<Vec<ChunkMetadata>, ChunkError>;
}

#[derive(Debug, Default)]
struct CollectionEntry {
    meta: Option<CollectionMetadata>,
    chunks: Vec<ChunkMetadata>,
}

/// In-memory config metadata for tests and single-process setups.
#[derive(Debug, Default)]
pub struct InMemoryConfigMetadata {
    collections: RwLock<HashMap<String, CollectionEntry>>,
    unavailable: RwLock<bool>,
}

impl InMemoryConfigMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `ns` as sharded on `pattern`.
    pub fn shard_collection(&self, ns: &str, pattern: ShardKeyPattern) {
        let mut collections = self.collections.write();
        let entry = collections.entry(ns.to_string()).or_default();
        entry.meta = Some(CollectionMetadata {
            pattern,
            dropped: false,
        });
    }

    pub fn add_chunk(&self, ns: &str, chunk: ChunkMetadata) {
        let mut collections = self.collections.write();
        let entry = collections.entry(ns.to_string()).or_default();
        entry.chunks.retain(|c| c.min != chunk.min);
        entry.chunks.push(chunk);
        entry.chunks.sort_by(|a, b| a.min.cmp(&b.min));
    }

    /// Reassign the chunk starting at `min` to `shard` at `lastmod`.
    ///
    /// Returns false when no such chunk exists.
    pub fn move_chunk(&self, ns: &str, min: &ShardKey, shard: ShardId, lastmod: ChunkVersion) -> bool {
        let mut collections = self.collections.write();
        let Some(chunk) = collections
            .get_mut(ns)
            .and_then(|entry| entry.chunks.iter_mut().find(|c| &c.min == min))
        else {
            return false;
        };
        chunk.shard = shard;
        chunk.lastmod = lastmod;
        true
    }

    /// Mark `ns` as dropped.
    pub fn drop_collection(&self, ns: &str) {
        if let Some(meta) = self
            .collections
            .write()
            .get_mut(ns)
            .and_then(|entry| entry.meta.as_mut())
        {
            meta.dropped = true;
        }
    }

    /// Make every query fail with `MetadataUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write() = unavailable;
    }

    fn check_available(&self) -> Result<(), ChunkError> {
        if *self.unavailable.read() {
            return Err(ChunkError::MetadataUnavailable(
                "config metadata source offline".to_string(),
            ));
        }
        Ok(())
    }
}

impl ConfigMetadataSource for InMemoryConfigMetadata {
    fn collection(&self, ns: &str) -> Result<CollectionMetadata, ChunkError> {
        self.check_available()?;
        self.collections
            .read()
            .get(ns)
            .and_then(|entry| entry.meta.clone())
            .ok_or_else(|| ChunkError::CollectionNotFound(ns.to_string()))
    }

    fn chunks(&self, ns: &str, shard: &ShardId) -> Result<Vec<ChunkMetadata>, ChunkError> {
        self.check_available()?;
        Ok(self
            .collections
            .read()
            .get(ns)
            .map(|entry| {
                entry
                    .chunks
                    .iter()
                    .filter(|c| &c.shard == shard)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
