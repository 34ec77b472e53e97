//! Concurrency and consistency core of a sharded, replicated document store.
//!
//! The crate provides the pieces a shard node needs to serve requests safely
//! while chunks move between shards and transactions span several of them:
//!
//! - **[`lock`]**: a reentrant reader/writer lock with per-thread recursion
//!   tracking, used as the node-wide lock.
//! - **[`sharding`]**: immutable chunk range tables answering "does this key
//!   live here", with copy-producing migrations and splits.
//! - **[`capped`]**: traversal of capped (wraparound) record stores that never
//!   revisits overwritten records.
//! - **[`txn`]**: two-phase commit coordination with a durable decision and
//!   retrying participant delivery.
//! - **[`topology`]**: server observation intake with topology-version
//!   staleness checks and immutable snapshot publication.
//!
//! # Example
//!
//! ```rust,no_run
//! use shardline::{CoreConfig, ShardNode};
//! use shardline::sharding::{ChunkVersion, InMemoryConfigMetadata, ShardKey};
//! use shardline::testing::ScriptedExecutor;
//! use shardline::txn::InMemoryCoordinatorStore;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = ShardNode::new(
//!         CoreConfig::new("shard0000"),
//!         Arc::new(ScriptedExecutor::new()),
//!         Arc::new(InMemoryCoordinatorStore::new()),
//!     )?;
//!
//!     let source = InMemoryConfigMetadata::new();
//!     // ... populate collections and chunks ...
//!     node.load_collection("db.users", &source)?;
//!
//!     let decision = node.route("db.users", &ShardKey::from(42i64), ChunkVersion::new(1, 0))?;
//!     println!("{:?}", decision);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        ShardNode                          │
//! │  route / donate_chunk / receive_chunk / split_chunk       │
//! │  commit_transaction / on_server_description               │
//! └──────────────────────────────────────────────────────────┘
//!        │                 │                  │           │
//!        ▼                 ▼                  ▼           ▼
//! ┌─────────────┐  ┌───────────────┐  ┌─────────────┐ ┌──────────┐
//! │ReentrantRw- │  │ ShardingState │  │ Transaction │ │ Topology │
//! │Lock         │  │ Arc<ChunkRange│  │ Coordinator │ │ Tracker  │
//! │             │  │ Table> per ns │  │             │ │          │
//! └─────────────┘  └───────────────┘  └─────────────┘ └──────────┘
//! ```

pub mod capped;
pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod node;
pub mod sharding;
pub mod testing;
pub mod topology;
pub mod txn;
pub mod types;

// Re-export main types for convenience
pub use config::{CommitConfig, CoreConfig, LockConfig, TopologyConfig};
pub use error::{Error, Result};
pub use node::{RouteDecision, ShardNode};
pub use types::{ShardId, Timestamp, TxnId};

pub use lock::{LockObserver, LockState, ReentrantRwLock};
pub use metrics::{CoreMetrics, Counter, Gauge, MetricsSnapshot};
pub use sharding::{ChunkRangeTable, ChunkVersion, ShardKey, ShardKeyPattern, ShardingState};
pub use txn::{CommitDecision, CoordinatorState, TransactionCoordinator};
pub use topology::{ServerDescription, TopologyDescription, TopologyTracker};
