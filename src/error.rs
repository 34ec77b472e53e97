//! Error types for the shardline core.

use crate::sharding::{ChunkVersion, ShardKey};
use crate::txn::{CoordinatorEvent, CoordinatorState, Vote};
use crate::types::{ShardId, TxnId};
use thiserror::Error;

/// Result type alias for shardline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the shardline core.
#[derive(Error, Debug)]
pub enum Error {
    /// Chunk ownership errors.
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),

    /// Participant list and vote ledger errors.
    #[error("participant error: {0}")]
    Participant(#[from] ParticipantError),

    /// Coordinator state machine errors.
    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    /// Errors reported by the participant executor.
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Coordinator document store errors.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Precondition failures on chunk table construction and mutation.
///
/// The source table is never modified when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    /// The new version does not move forward.
    #[error("version {requested} not greater than {current}")]
    VersionNotMonotonic {
        current: ChunkVersion,
        requested: ChunkVersion,
    },

    /// Bumping the version would overflow one of its components.
    #[error("version {version} cannot be incremented")]
    VersionOverflow { version: ChunkVersion },

    /// No owned chunk starts at the given min key.
    #[error("no chunk starting at {min} (requested range [{min}, {max}))")]
    ChunkNotFound { min: ShardKey, max: ShardKey },

    /// A chunk starts at the given min key but ends somewhere else.
    #[error("chunk at {min} ends at {found_max}, not {expected_max}")]
    RangeMismatch {
        min: ShardKey,
        expected_max: ShardKey,
        found_max: ShardKey,
    },

    /// The candidate range intersects an owned chunk.
    #[error("range [{min}, {max}) overlaps owned chunk [{existing_min}, {existing_max})")]
    RangeOverlap {
        min: ShardKey,
        max: ShardKey,
        existing_min: ShardKey,
        existing_max: ShardKey,
    },

    /// The range is empty or inverted.
    #[error("invalid range [{min}, {max})")]
    InvalidRange { min: ShardKey, max: ShardKey },

    /// A split key is not strictly inside the chunk or keys are not increasing.
    #[error("cannot split [{min}, {max}) on {key}")]
    InvalidSplitKey {
        min: ShardKey,
        max: ShardKey,
        key: ShardKey,
    },

    /// The key does not match the shard key pattern.
    #[error("key {0} does not match the shard key pattern")]
    KeyPatternMismatch(ShardKey),

    /// The collection has no sharding metadata.
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    /// The collection is marked dropped in the config metadata.
    #[error("collection dropped: {0}")]
    CollectionDropped(String),

    /// No chunk table is installed for the namespace.
    #[error("namespace not sharded on this shard: {0}")]
    NamespaceNotSharded(String),

    /// The router's shard version differs from this shard's.
    #[error("stale shard version for {ns}: received {received}, wanted {wanted}")]
    StaleShardVersion {
        ns: String,
        received: ChunkVersion,
        wanted: ChunkVersion,
    },

    /// The config metadata source failed.
    #[error("config metadata unavailable: {0}")]
    MetadataUnavailable(String),
}

/// Violations of the append-only participant list and vote ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParticipantError {
    /// A different participant list was already recorded.
    #[error("conflicting participant list: recorded {existing:?}, received {proposed:?}")]
    ConflictingParticipantList {
        existing: Vec<ShardId>,
        proposed: Vec<ShardId>,
    },

    /// The participant list omits a shard that already voted.
    #[error("participant list omits shard {0} which already voted")]
    ParticipantListMissingVoter(ShardId),

    /// A vote arrived from a shard outside the recorded participant list.
    #[error("unknown participant: {0}")]
    UnknownParticipant(ShardId),

    /// A shard tried to change its vote.
    #[error("vote conflict for {shard}: recorded {existing}, received {proposed}")]
    VoteConflict {
        shard: ShardId,
        existing: Vote,
        proposed: Vote,
    },
}

/// Coordinator state machine errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    /// The event is not valid in the current state; the machine is now broken.
    #[error("invalid transition from {from} on {event}")]
    InvalidTransition {
        from: CoordinatorState,
        event: CoordinatorEvent,
    },

    /// The state machine is broken and accepts no more events.
    #[error("coordinator state machine is broken")]
    Broken,

    /// The machine settled in a state from which no requested target is reachable.
    #[error("no requested state reachable from {current}")]
    TargetUnreachable { current: CoordinatorState },

    /// The state machine was dropped before the waiter resolved.
    #[error("state machine dropped before transition")]
    WaiterDropped,

    /// A participant could not be reached within the retry budget.
    #[error("gave up sending {command} to {shard} after {attempts} attempts")]
    RetriesExhausted {
        command: &'static str,
        shard: ShardId,
        attempts: u32,
    },
}

/// Errors returned by a participant executor for one remote command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// Transient failure; the command may be resent.
    #[error("retryable failure: {0}")]
    Retryable(String),

    /// The participant shard is not known to the cluster.
    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    /// The participant refused, which counts as a vote to abort.
    #[error("vote abort: {0}")]
    VoteAbort(String),

    /// Permanent failure.
    #[error("failed: {0}")]
    Failed(String),
}

impl ExecutorError {
    /// Whether resending the same command may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutorError::Retryable(_))
    }
}

/// Coordinator document store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A document exists with a different participant list or decision.
    #[error("conflicting coordinator document for {txn}: {reason}")]
    DocumentConflict { txn: TxnId, reason: String },

    /// No document exists for the transaction.
    #[error("no coordinator document for {0}")]
    DocumentNotFound(TxnId),

    /// The document has no decision yet.
    #[error("coordinator document for {0} has no decision")]
    MissingDecision(TxnId),

    /// The document could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(String),
}

/// Internal-consistency violations of the reentrant lock.
///
/// These indicate a caller bug and are raised as panics, never returned.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStateError {
    /// Unlock called by a thread that holds nothing.
    #[error("LockStateError: unlock_{mode} without a held lock")]
    NotHeld { mode: &'static str },

    /// Write unlock called while holding a read lock.
    #[error("LockStateError: unlock_write while read-locked (depth {depth})")]
    ReadHeld { depth: u32 },

    /// Read unlock would release a write lock.
    #[error("LockStateError: unlock_read would release the write lock")]
    WriteHeld,

    /// Write lock requested while holding a read lock.
    #[error("LockStateError: cannot upgrade read lock (depth {depth}) to write")]
    UpgradeNotSupported { depth: u32 },

    /// Early release requested for a recursive or non-write hold.
    #[error("LockStateError: release_early requires a single write hold, state is {state}")]
    ReleaseEarly { state: i32 },
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Encoding(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
