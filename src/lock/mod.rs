//! Reentrant reader/writer locking.
//!
//! The node-wide lock is an explicitly constructed [`ReentrantRwLock`] shared by
//! `Arc` with every component that needs it. Each thread keeps its own recursion
//! state per lock instance:
//!
//! ```text
//!   state   meaning
//!   ─────   ──────────────────────────────────
//!     0     unlocked
//!    +N     write-locked, recursion depth N
//!    -N     read-locked, recursion depth N
//! ```
//!
//! A thread holding the write lock may take more read or write holds without
//! blocking; those are counted against the write depth. A read hold can never be
//! upgraded to a write hold.

mod reentrant;

pub use reentrant::{LockObserver, LockState, ReadGuard, ReentrantRwLock, WriteGuard};
