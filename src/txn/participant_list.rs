//! Append-only participant list and vote ledger of one transaction.

use crate::error::ParticipantError;
use crate::types::{ShardId, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A participant's prepare vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    Unknown,
    /// Prepared at the given timestamp.
    Commit(Timestamp),
    Abort,
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vote::Unknown => write!(f, "unknown"),
            Vote::Commit(ts) => write!(f, "commit at {}", ts),
            Vote::Abort => write!(f, "abort"),
        }
    }
}

/// Outcome of a distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitDecision {
    /// Commit at the maximum prepare timestamp.
    Commit(Timestamp),
    Abort,
}

impl CommitDecision {
    pub fn is_commit(&self) -> bool {
        matches!(self, CommitDecision::Commit(_))
    }
}

impl fmt::Display for CommitDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitDecision::Commit(ts) => write!(f, "commit at {}", ts),
            CommitDecision::Abort => write!(f, "abort"),
        }
    }
}

#[derive(Debug, Default)]
struct Ledger {
    votes: BTreeMap<ShardId, Vote>,
    full_list: Option<BTreeSet<ShardId>>,
}

/// Participant list and votes of a transaction.
///
/// Once recorded, neither the full list nor a vote can change. Identical
/// re-deliveries are accepted as no-ops.
#[derive(Debug, Default)]
pub struct ParticipantList {
    inner: Mutex<Ledger>,
}

impl ParticipantList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the full set of participants.
    ///
    /// Returns `true` if the list was newly recorded.
    pub fn record_full_list<I>(&self, shards: I) -> Result<bool, ParticipantError>
    where
        I: IntoIterator<Item = ShardId>,
    {
        let proposed: BTreeSet<ShardId> = shards.into_iter().collect();
        let mut ledger = self.inner.lock();

        if let Some(existing) = &ledger.full_list {
            if *existing == proposed {
                return Ok(false);
            }
            return Err(ParticipantError::ConflictingParticipantList {
                existing: existing.iter().cloned().collect(),
                proposed: proposed.into_iter().collect(),
            });
        }

        if let Some(voter) = ledger.votes.keys().find(|s| !proposed.contains(*s)) {
            return Err(ParticipantError::ParticipantListMissingVoter(voter.clone()));
        }

        for shard in &proposed {
            ledger.votes.entry(shard.clone()).or_insert(Vote::Unknown);
        }
        tracing::debug!(participants = proposed.len(), "Recorded participant list");
        ledger.full_list = Some(proposed);
        Ok(true)
    }

    /// Record a vote to abort from `shard`.
    pub fn record_vote_abort(&self, shard: &ShardId) -> Result<bool, ParticipantError> {
        self.record_vote(shard, Vote::Abort)
    }

    /// Record a vote to commit from `shard`, prepared at `prepare_timestamp`.
    pub fn record_vote_commit(
        &self,
        shard: &ShardId,
        prepare_timestamp: Timestamp,
    ) -> Result<bool, ParticipantError> {
        self.record_vote(shard, Vote::Commit(prepare_timestamp))
    }

    fn record_vote(&self, shard: &ShardId, vote: Vote) -> Result<bool, ParticipantError> {
        let mut ledger = self.inner.lock();

        if let Some(full) = &ledger.full_list {
            if !full.contains(shard) {
                return Err(ParticipantError::UnknownParticipant(shard.clone()));
            }
        }

        match ledger.votes.get(shard).copied() {
            None | Some(Vote::Unknown) => {
                ledger.votes.insert(shard.clone(), vote);
                tracing::debug!(shard = %shard, vote = %vote, "Recorded vote");
                Ok(true)
            }
            Some(existing) if existing == vote => Ok(false),
            Some(existing) => {
                tracing::warn!(
                    shard = %shard,
                    existing = %existing,
                    proposed = %vote,
                    "Participant tried to change its vote"
                );
                Err(ParticipantError::VoteConflict {
                    shard: shard.clone(),
                    existing,
                    proposed: vote,
                })
            }
        }
    }

    /// Recorded vote of `shard`, if it is known to the ledger.
    pub fn vote(&self, shard: &ShardId) -> Option<Vote> {
        self.inner.lock().votes.get(shard).copied()
    }

    /// The full participant list, once recorded.
    pub fn full_list(&self) -> Option<Vec<ShardId>> {
        self.inner
            .lock()
            .full_list
            .as_ref()
            .map(|l| l.iter().cloned().collect())
    }

    /// Decision implied by the votes so far.
    ///
    /// Any abort decides abort. Commit requires the full list and a commit vote
    /// from every member, and commits at the maximum prepare timestamp.
    pub fn decision(&self) -> Option<CommitDecision> {
        let ledger = self.inner.lock();
        if ledger.votes.values().any(|v| *v == Vote::Abort) {
            return Some(CommitDecision::Abort);
        }
        let full = ledger.full_list.as_ref()?;

        let mut max_ts: Option<Timestamp> = None;
        for shard in full {
            match ledger.votes.get(shard) {
                Some(Vote::Commit(ts)) => {
                    max_ts = Some(max_ts.map_or(*ts, |m| m.max(*ts)));
                }
                _ => return None,
            }
        }
        max_ts.map(CommitDecision::Commit)
    }
}
