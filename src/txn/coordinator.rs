//! Two-phase commit driver.
//!
//! ```text
//!   run_commit(participants)
//!     │ record + persist participant list      ── RecvParticipantList
//!     │ prepare on every participant (fan-out)
//!     │   any abort ──────────────────────────── RecvVoteAbort
//!     │   all commit ─────────────────────────── RecvFinalVoteCommit
//!     │ persist decision
//!     │ send commit / abort to every participant
//!     │   all acked (commit) ─────────────────── RecvFinalCommitAck
//!     ▼ delete coordinator document
//! ```

use super::executor::{ParticipantExecutor, PrepareResponse};
use super::participant_list::{CommitDecision, ParticipantList, Vote};
use super::state_machine::{CoordinatorEvent, CoordinatorState, CoordinatorStateMachine};
use super::store::{CoordinatorDocument, CoordinatorStore};
use crate::config::CommitConfig;
use crate::error::{CoordinatorError, Error, ExecutorError, Result};
use crate::metrics::CoreMetrics;
use crate::types::{ShardId, TxnId};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Send one command, retrying transient failures with exponential backoff.
///
/// Non-retryable executor errors come back as `Error::Executor`; an exhausted
/// retry budget as `CoordinatorError::RetriesExhausted`.
async fn send_with_retry<T, F, Fut>(
    config: &CommitConfig,
    metrics: &CoreMetrics,
    command: &'static str,
    shard: &ShardId,
    mut send: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ExecutorError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match send().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_send_attempts => {
                let backoff = config.backoff_for(attempt);
                metrics.txn_send_retries.inc();
                tracing::warn!(
                    command = command,
                    shard = %shard,
                    attempt = attempt,
                    ?backoff,
                    error = %e,
                    "Retrying participant command"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) if e.is_retryable() => {
                return Err(CoordinatorError::RetriesExhausted {
                    command,
                    shard: shard.clone(),
                    attempts: attempt,
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Drives one distributed transaction through two-phase commit.
#[derive(Debug)]
pub struct TransactionCoordinator {
    txn: TxnId,
    config: CommitConfig,
    executor: Arc<dyn ParticipantExecutor>,
    store: Arc<dyn CoordinatorStore>,
    participants: ParticipantList,
    state: CoordinatorStateMachine,
    metrics: Arc<CoreMetrics>,
}

impl TransactionCoordinator {
    /// Create a coordinator for `txn`.
    pub fn new(
        txn: TxnId,
        config: CommitConfig,
        executor: Arc<dyn ParticipantExecutor>,
        store: Arc<dyn CoordinatorStore>,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        Self {
            txn,
            config,
            executor,
            store,
            participants: ParticipantList::new(),
            state: CoordinatorStateMachine::new(),
            metrics,
        }
    }

    pub fn txn(&self) -> TxnId {
        self.txn
    }

    pub fn state_machine(&self) -> &CoordinatorStateMachine {
        &self.state
    }

    pub fn participant_list(&self) -> &ParticipantList {
        &self.participants
    }

    /// Run the full protocol over `participants` and return the decision.
    #[tracing::instrument(skip(self, participants), fields(txn = %self.txn))]
    pub async fn run_commit(&self, participants: Vec<ShardId>) -> Result<CommitDecision> {
        let active = self.metrics.coordinators_active.track();
        let result = self.drive(participants, None).await;
        drop(active);
        self.finish(result)
    }

    /// Continue a coordinator from its persisted document.
    ///
    /// With a recorded decision only the decision is re-sent; without one the
    /// full protocol runs again over the stored participant list.
    #[tracing::instrument(skip(self, doc), fields(txn = %self.txn))]
    pub async fn resume(&self, doc: CoordinatorDocument) -> Result<CommitDecision> {
        if doc.txn != self.txn {
            return Err(Error::Internal(format!(
                "document for {} handed to coordinator for {}",
                doc.txn, self.txn
            )));
        }
        let active = self.metrics.coordinators_active.track();
        let result = self.drive(doc.participants, doc.decision).await;
        drop(active);
        self.finish(result)
    }

    /// Abort a transaction whose participant list was never delivered.
    pub fn abort_before_participants(&self) -> Result<CommitDecision> {
        let result = self
            .state
            .on_event(CoordinatorEvent::RecvVoteAbort)
            .map(|_| CommitDecision::Abort)
            .map_err(Error::from);
        self.finish(result)
    }

    fn finish(&self, result: Result<CommitDecision>) -> Result<CommitDecision> {
        match &result {
            Ok(CommitDecision::Commit(ts)) => {
                self.metrics.txn_committed.inc();
                tracing::info!(txn = %self.txn, commit_timestamp = %ts, "Transaction committed");
            }
            Ok(CommitDecision::Abort) => {
                self.metrics.txn_aborted.inc();
                tracing::info!(txn = %self.txn, "Transaction aborted");
            }
            Err(e) => {
                if self.state.fail() == CoordinatorState::Broken {
                    self.metrics.txn_broken.inc();
                }
                tracing::error!(txn = %self.txn, error = %e, "Transaction coordinator failed");
            }
        }
        result
    }

    async fn drive(
        &self,
        participants: Vec<ShardId>,
        known_decision: Option<CommitDecision>,
    ) -> Result<CommitDecision> {
        let mut list = participants;
        list.sort();
        list.dedup();
        if list.is_empty() {
            return Err(Error::Internal("empty participant list".to_string()));
        }

        self.participants.record_full_list(list.iter().cloned())?;
        self.store.persist_participant_list(self.txn, &list).await?;
        self.state.on_event(CoordinatorEvent::RecvParticipantList)?;

        let decision = match known_decision {
            Some(decision) => decision,
            None => self.collect_votes(&list).await?,
        };
        tracing::info!(txn = %self.txn, decision = %decision, "Coordinator reached decision");

        match decision {
            CommitDecision::Commit(_) => self.state.on_event(CoordinatorEvent::RecvFinalVoteCommit)?,
            CommitDecision::Abort => self.state.on_event(CoordinatorEvent::RecvVoteAbort)?,
        };

        self.store
            .persist_decision(self.txn, &list, decision)
            .await?;
        self.send_decision(&list, decision).await?;

        if decision.is_commit() {
            self.state.on_event(CoordinatorEvent::RecvFinalCommitAck)?;
        }

        if let Err(e) = self.store.delete(self.txn).await {
            tracing::warn!(txn = %self.txn, error = %e, "Failed to delete coordinator document");
        }
        Ok(decision)
    }

    /// Send prepare to every participant and aggregate the votes.
    ///
    /// The first abort decides; outstanding prepares are cancelled.
    async fn collect_votes(&self, list: &[ShardId]) -> Result<CommitDecision> {
        let mut tasks = JoinSet::new();
        for shard in list {
            let shard = shard.clone();
            let txn = self.txn;
            let executor = self.executor.clone();
            let config = self.config.clone();
            let metrics = self.metrics.clone();
            tasks.spawn(async move {
                let response = send_with_retry(&config, &metrics, "prepare", &shard, || {
                    executor.send_prepare(txn, &shard)
                })
                .await;
                let vote = match response {
                    Ok(PrepareResponse {
                        prepare_timestamp: Some(ts),
                    }) => Vote::Commit(ts),
                    Ok(_) => {
                        tracing::warn!(shard = %shard, "Prepare reply without timestamp, voting abort");
                        Vote::Abort
                    }
                    Err(e) => {
                        tracing::warn!(shard = %shard, error = %e, "Prepare failed, voting abort");
                        Vote::Abort
                    }
                };
                (shard, vote)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (shard, vote) =
                joined.map_err(|e| Error::Internal(format!("prepare task failed: {}", e)))?;
            match vote {
                Vote::Commit(ts) => {
                    self.participants.record_vote_commit(&shard, ts)?;
                }
                Vote::Abort => {
                    self.participants.record_vote_abort(&shard)?;
                    tasks.abort_all();
                    break;
                }
                Vote::Unknown => {}
            }
        }

        self.participants
            .decision()
            .ok_or_else(|| Error::Internal("prepare phase ended without a decision".to_string()))
    }

    /// Deliver the decision to every participant until each acknowledges.
    async fn send_decision(&self, list: &[ShardId], decision: CommitDecision) -> Result<()> {
        let mut tasks = JoinSet::new();
        for shard in list {
            let shard = shard.clone();
            let txn = self.txn;
            let executor = self.executor.clone();
            let config = self.config.clone();
            let metrics = self.metrics.clone();
            tasks.spawn(async move {
                let result = match decision {
                    CommitDecision::Commit(ts) => {
                        send_with_retry(&config, &metrics, "commit", &shard, || {
                            executor.send_commit(txn, &shard, ts)
                        })
                        .await
                    }
                    CommitDecision::Abort => {
                        send_with_retry(&config, &metrics, "abort", &shard, || {
                            executor.send_abort(txn, &shard)
                        })
                        .await
                    }
                };
                match result {
                    // The participant already gave up on the transaction.
                    Err(Error::Executor(ExecutorError::VoteAbort(_))) => Ok(()),
                    other => other,
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|e| Error::Internal(format!("decision task failed: {}", e)))??;
        }
        Ok(())
    }

    /// Resume every coordinator left in `store`, e.g. after a restart.
    pub async fn recover_all(
        config: &CommitConfig,
        executor: Arc<dyn ParticipantExecutor>,
        store: Arc<dyn CoordinatorStore>,
        metrics: Arc<CoreMetrics>,
    ) -> Result<Vec<(TxnId, Result<CommitDecision>)>> {
        let docs = store.read_all().await?;
        tracing::info!(documents = docs.len(), "Recovering transaction coordinators");

        let mut outcomes = Vec::with_capacity(docs.len());
        for doc in docs {
            let txn = doc.txn;
            let coordinator = TransactionCoordinator::new(
                txn,
                config.clone(),
                executor.clone(),
                store.clone(),
                metrics.clone(),
            );
            outcomes.push((txn, coordinator.resume(doc).await));
        }
        Ok(outcomes)
    }
}
