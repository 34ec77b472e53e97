//! Testing utilities.
//!
//! [`ScriptedExecutor`] stands in for the remote participants of a two-phase
//! commit: each shard answers prepare, commit and abort from a per-shard
//! script, and every command received is logged for assertions.
//!
//! # Example
//!
//! ```rust,ignore
//! use shardline::testing::ScriptedExecutor;
//! use shardline::error::ExecutorError;
//!
//! let executor = Arc::new(ScriptedExecutor::new());
//! executor.script_prepare(&"shardB".into(), vec![Err(ExecutorError::VoteAbort("conflict".into()))]);
//!
//! let decision = node.commit_transaction(txn, participants).await?;
//! assert_eq!(executor.aborts(), 2);
//! ```

mod scripted;

#[cfg(test)]
mod scenarios;

pub use scripted::{ExecutorCall, ScriptedExecutor};
