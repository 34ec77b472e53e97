//! Remote command collaborator used by the coordinator.

use crate::error::ExecutorError;
use crate::types::{ShardId, Timestamp, TxnId};

/// Reply of a participant to a prepare command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareResponse {
    /// Prepare timestamp; a reply without one is treated as a vote to abort.
    pub prepare_timestamp: Option<Timestamp>,
}

impl PrepareResponse {
    /// A successful prepare at `ts`.
    pub fn prepared(ts: Timestamp) -> Self {
        Self {
            prepare_timestamp: Some(ts),
        }
    }
}

/// Sends 2PC commands to participant shards.
///
/// Every call eventually resolves. Transient failures are reported as
/// [`ExecutorError::Retryable`]; the coordinator owns the retry policy.
#[async_trait::async_trait]
pub trait ParticipantExecutor: Send + Sync + std::fmt::Debug {
    /// Ask `shard` to prepare `txn`.
    async fn send_prepare(
        &self,
        txn: TxnId,
        shard: &ShardId,
    ) -> Result<PrepareResponse, ExecutorError>;

    /// Tell `shard` to commit `txn` at `commit_timestamp`.
    async fn send_commit(
        &self,
        txn: TxnId,
        shard: &ShardId,
        commit_timestamp: Timestamp,
    ) -> Result<(), ExecutorError>;

    /// Tell `shard` to abort `txn`.
    async fn send_abort(&self, txn: TxnId, shard: &ShardId) -> Result<(), ExecutorError>;
}
