//! Traversal of capped (fixed-size, wraparound) record stores.
//!
//! Once a capped store has looped, its oldest records live at the front of the
//! cap extent, followed by every other extent, and its newest records sit at
//! the back of the cap extent:
//!
//! ```text
//!            cap extent                    other extents
//!   ┌──────────────┬──────────────┐   ┌────────┐   ┌────────┐
//!   │ old records  │ new records  │ → │        │ → │        │ ─┐
//!   └──────────────┴──────────────┘   └────────┘   └────────┘  │
//!     ▲ first        ▲ cap_first_new                           │
//!     └──────────────────────────── wrap ──────────────────────┘
//!
//!   forward order: old part → other extents → new part
//! ```

mod cursor;
mod store;

pub use cursor::{advance, start_position, CappedCursor, CappedIter, Direction};
pub use store::{InMemoryCappedStore, RecordId, MAX_CAPPED_RECORDS};

/// Linked record layout of a store.
///
/// `next_record`/`prev_record` are the plain linear successor and
/// predecessor, crossing extent boundaries but never wrapping.
pub trait RecordStore {
    /// Opaque record position.
    type Loc: Copy + Eq + std::fmt::Debug;

    fn first_record(&self) -> Option<Self::Loc>;
    fn last_record(&self) -> Option<Self::Loc>;
    fn next_record(&self, loc: Self::Loc) -> Option<Self::Loc>;
    fn prev_record(&self, loc: Self::Loc) -> Option<Self::Loc>;

    /// Whether `loc` still refers to a live record.
    fn is_live(&self, loc: Self::Loc) -> bool;
}

/// Capped-specific layout fields.
pub trait CappedRecordStore: RecordStore {
    /// First record of the extent currently receiving inserts.
    fn cap_extent_first(&self) -> Option<Self::Loc>;
    /// Last record of the extent currently receiving inserts.
    fn cap_extent_last(&self) -> Option<Self::Loc>;
    /// Oldest record inserted into the cap extent since it became the cap extent.
    fn cap_first_new_record(&self) -> Option<Self::Loc>;
    /// Whether inserts have wrapped around and started overwriting.
    fn looped(&self) -> bool;
}
