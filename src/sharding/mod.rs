//! Chunk ownership for sharded collections.
//!
//! A shard owns a set of half-open key ranges (chunks) of each sharded
//! collection. [`ChunkRangeTable`] answers "does this key live here" and
//! produces new tables on migrations and splits. [`ShardingState`] holds the
//! current table per namespace and checks router shard versions against it.

mod chunk_table;
mod key;
mod metadata;
mod state;
mod version;

pub use chunk_table::ChunkRangeTable;
pub use key::{Document, KeyValue, ShardKey, ShardKeyPattern};
pub use metadata::{ChunkMetadata, CollectionMetadata, ConfigMetadataSource, InMemoryConfigMetadata};
pub use state::ShardingState;
pub use version::ChunkVersion;
