//! Chunk versions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical clock over a shard's chunk ownership.
///
/// Orders exactly as the packed `(major << 32) | minor` value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ChunkVersion {
    /// Bumped on ownership changes (migrations, splits).
    pub major: u32,
    /// Bumped on same-owner metadata changes.
    pub minor: u32,
}

impl ChunkVersion {
    pub const ZERO: ChunkVersion = ChunkVersion { major: 0, minor: 0 };

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Packed 64-bit representation.
    pub fn to_u64(self) -> u64 {
        (u64::from(self.major) << 32) | u64::from(self.minor)
    }

    pub fn from_u64(packed: u64) -> Self {
        Self {
            major: (packed >> 32) as u32,
            minor: packed as u32,
        }
    }

    pub fn is_set(&self) -> bool {
        *self != Self::ZERO
    }

    /// Next minor version under the same major, `None` on overflow.
    pub fn inc_minor(self) -> Option<Self> {
        self.minor.checked_add(1).map(|minor| Self::new(self.major, minor))
    }

    /// First version of the next major, `None` on overflow.
    pub fn inc_major(self) -> Option<Self> {
        self.major.checked_add(1).map(|major| Self::new(major, 0))
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.major, self.minor)
    }
}
