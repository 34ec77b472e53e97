//! Scripted participant executor for driving the coordinator in tests.

use crate::error::ExecutorError;
use crate::txn::{ParticipantExecutor, PrepareResponse};
use crate::types::{ShardId, Timestamp, TxnId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// A command received by [`ScriptedExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorCall {
    Prepare(ShardId),
    Commit(ShardId, Timestamp),
    Abort(ShardId),
}

#[derive(Debug, Default)]
struct Scripts {
    prepare: HashMap<ShardId, VecDeque<Result<PrepareResponse, ExecutorError>>>,
    commit: HashMap<ShardId, VecDeque<Result<(), ExecutorError>>>,
    abort: HashMap<ShardId, VecDeque<Result<(), ExecutorError>>>,
    prepare_timestamps: HashMap<ShardId, Timestamp>,
    prepare_delays: HashMap<ShardId, Duration>,
    calls: Vec<ExecutorCall>,
}

/// Participant executor answering from per-shard scripts.
///
/// Each shard replies with its scripted responses in order, then with the
/// default: prepared at `Timestamp(1, 0)` (or the timestamp set through
/// [`set_prepare_timestamp`](Self::set_prepare_timestamp)), and plain acks for
/// commit and abort.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<Scripts>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue prepare responses for `shard`.
    pub fn script_prepare(
        &self,
        shard: &ShardId,
        responses: Vec<Result<PrepareResponse, ExecutorError>>,
    ) {
        self.scripts
            .lock()
            .prepare
            .entry(shard.clone())
            .or_default()
            .extend(responses);
    }

    /// Queue commit responses for `shard`.
    pub fn script_commit(&self, shard: &ShardId, responses: Vec<Result<(), ExecutorError>>) {
        self.scripts
            .lock()
            .commit
            .entry(shard.clone())
            .or_default()
            .extend(responses);
    }

    /// Queue abort responses for `shard`.
    pub fn script_abort(&self, shard: &ShardId, responses: Vec<Result<(), ExecutorError>>) {
        self.scripts
            .lock()
            .abort
            .entry(shard.clone())
            .or_default()
            .extend(responses);
    }

    /// Default prepare timestamp of `shard` once its script is used up.
    pub fn set_prepare_timestamp(&self, shard: &ShardId, ts: Timestamp) {
        self.scripts
            .lock()
            .prepare_timestamps
            .insert(shard.clone(), ts);
    }

    /// Delay every prepare reply of `shard`.
    pub fn set_prepare_delay(&self, shard: &ShardId, delay: Duration) {
        self.scripts.lock().prepare_delays.insert(shard.clone(), delay);
    }

    /// Every command received so far, in arrival order.
    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.scripts.lock().calls.clone()
    }

    pub fn prepares_to(&self, shard: &ShardId) -> usize {
        self.count(|call| matches!(call, ExecutorCall::Prepare(s) if s == shard))
    }

    pub fn commits(&self) -> usize {
        self.count(|call| matches!(call, ExecutorCall::Commit(..)))
    }

    pub fn aborts(&self) -> usize {
        self.count(|call| matches!(call, ExecutorCall::Abort(_)))
    }

    fn count(&self, pred: impl Fn(&ExecutorCall) -> bool) -> usize {
        self.scripts.lock().calls.iter().filter(|c| pred(c)).count()
    }
}

#[async_trait::async_trait]
impl ParticipantExecutor for ScriptedExecutor {
    async fn send_prepare(
        &self,
        _txn: TxnId,
        shard: &ShardId,
    ) -> Result<PrepareResponse, ExecutorError> {
        let (response, delay) = {
            let mut scripts = self.scripts.lock();
            scripts.calls.push(ExecutorCall::Prepare(shard.clone()));
            let default_ts = scripts
                .prepare_timestamps
                .get(shard)
                .copied()
                .unwrap_or(Timestamp::new(1, 0));
            let response = scripts
                .prepare
                .get_mut(shard)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(PrepareResponse::prepared(default_ts)));
            (response, scripts.prepare_delays.get(shard).copied())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        response
    }

    async fn send_commit(
        &self,
        _txn: TxnId,
        shard: &ShardId,
        commit_timestamp: Timestamp,
    ) -> Result<(), ExecutorError> {
        let mut scripts = self.scripts.lock();
        scripts
            .calls
            .push(ExecutorCall::Commit(shard.clone(), commit_timestamp));
        scripts
            .commit
            .get_mut(shard)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()))
    }

    async fn send_abort(&self, _txn: TxnId, shard: &ShardId) -> Result<(), ExecutorError> {
        let mut scripts = self.scripts.lock();
        scripts.calls.push(ExecutorCall::Abort(shard.clone()));
        scripts
            .abort
            .get_mut(shard)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripts_then_defaults() {
        let executor = ScriptedExecutor::new();
        let a = ShardId::from("a");
        let txn = TxnId::generate(1);
        executor.script_prepare(&a, vec![Err(ExecutorError::Retryable("busy".into()))]);
        executor.set_prepare_timestamp(&a, Timestamp::new(7, 0));

        assert!(executor.send_prepare(txn, &a).await.is_err());
        assert_eq!(
            executor.send_prepare(txn, &a).await.unwrap(),
            PrepareResponse::prepared(Timestamp::new(7, 0))
        );
        executor.send_commit(txn, &a, Timestamp::new(7, 0)).await.unwrap();

        assert_eq!(executor.prepares_to(&a), 2);
        assert_eq!(executor.commits(), 1);
        assert_eq!(
            executor.calls().last(),
            Some(&ExecutorCall::Commit(a, Timestamp::new(7, 0)))
        );
    }
}
