//! Core types used throughout the shardline core.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a shard in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(String);

impl ShardId {
    /// Create a shard identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the shard name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for ShardId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Logical cluster timestamp: seconds plus an increment within the second.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Seconds component.
    pub secs: u32,
    /// Ordinal within the second.
    pub inc: u32,
}

impl Timestamp {
    /// Create a timestamp.
    pub const fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    /// Whether this is the null timestamp.
    pub fn is_null(&self) -> bool {
        self.secs == 0 && self.inc == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

/// Identity of a distributed transaction: logical session plus transaction number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId {
    /// Logical session id.
    pub session: Uuid,
    /// Transaction number within the session.
    pub txn_number: u64,
}

impl TxnId {
    /// Create a transaction id.
    pub fn new(session: Uuid, txn_number: u64) -> Self {
        Self {
            session,
            txn_number,
        }
    }

    /// Create a transaction id on a fresh random session.
    pub fn generate(txn_number: u64) -> Self {
        Self::new(Uuid::new_v4(), txn_number)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session, self.txn_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_ordering() {
        assert!(Timestamp::new(1, 5) < Timestamp::new(2, 0));
        assert!(Timestamp::new(2, 1) > Timestamp::new(2, 0));
        assert!(Timestamp::default().is_null());
        assert!(!Timestamp::new(0, 1).is_null());
    }

    #[test]
    fn test_shard_id_display() {
        let shard = ShardId::from("shard0001");
        assert_eq!(shard.to_string(), "shard0001");
        assert_eq!(shard.as_str(), "shard0001");
    }

    #[test]
    fn test_txn_id_distinct_sessions() {
        let a = TxnId::generate(1);
        let b = TxnId::generate(1);
        assert_ne!(a, b);
        assert_eq!(a, TxnId::new(a.session, 1));
    }
}
