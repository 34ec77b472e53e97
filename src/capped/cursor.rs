//! Forward and reverse cursors over capped record stores.

use super::{CappedRecordStore, RecordStore};

/// Traversal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Oldest to newest.
    Forward,
    /// Newest to oldest.
    Reverse,
}

fn next_loop<S: RecordStore>(store: &S, loc: S::Loc) -> Option<S::Loc> {
    store.next_record(loc).or_else(|| store.first_record())
}

fn prev_loop<S: RecordStore>(store: &S, loc: S::Loc) -> Option<S::Loc> {
    store.prev_record(loc).or_else(|| store.last_record())
}

/// Position a fresh cursor starts at, or `None` for an empty store.
pub fn start_position<S: CappedRecordStore>(store: &S, direction: Direction) -> Option<S::Loc> {
    match direction {
        Direction::Forward => {
            if !store.looped() {
                return store.first_record();
            }
            let first = store.cap_extent_first()?;
            if Some(first) == store.cap_first_new_record() {
                // The cap extent holds only new records; the oldest live
                // records start in the next extent.
                let last = store.cap_extent_last()?;
                return next_loop(store, last);
            }
            Some(first)
        }
        Direction::Reverse => {
            if !store.looped() {
                store.last_record()
            } else {
                store.cap_extent_last()
            }
        }
    }
}

/// Position after `prev` in `direction`, or `None` at the end.
///
/// A position that no longer refers to a live record ends the traversal.
pub fn advance<S: CappedRecordStore>(
    store: &S,
    direction: Direction,
    prev: S::Loc,
) -> Option<S::Loc> {
    if !store.is_live(prev) {
        return None;
    }
    match direction {
        Direction::Forward => advance_forward(store, prev),
        Direction::Reverse => advance_reverse(store, prev),
    }
}

fn advance_forward<S: CappedRecordStore>(store: &S, prev: S::Loc) -> Option<S::Loc> {
    if !store.looped() {
        return store.next_record(prev);
    }

    let cap_first = store.cap_extent_first();
    let cap_last = store.cap_extent_last();
    let first_new = store.cap_first_new_record();

    if Some(prev) == cap_last {
        return None;
    }
    let mut i = next_loop(store, prev);
    // Reached the new part of the cap extent from its old part: continue with
    // the next extent.
    if i.is_some() && i == first_new && i != cap_first {
        i = cap_last.and_then(|last| next_loop(store, last));
    }
    // Wrapped around to the start of the cap extent: its old part was already
    // visited, continue with the new part.
    if i.is_some() && i == cap_first {
        i = first_new;
    }
    i
}

fn advance_reverse<S: CappedRecordStore>(store: &S, prev: S::Loc) -> Option<S::Loc> {
    if !store.looped() {
        return store.prev_record(prev);
    }

    let cap_first = store.cap_extent_first();
    let cap_last = store.cap_extent_last();
    let first_new = store.cap_first_new_record();

    let oldest = if first_new == cap_first {
        cap_last.and_then(|last| next_loop(store, last))
    } else {
        cap_first
    };
    if Some(prev) == oldest {
        return None;
    }

    let mut i = if Some(prev) == first_new {
        cap_first.and_then(|first| prev_loop(store, first))
    } else {
        prev_loop(store, prev)
    };
    // Came back around to the cap extent's new part: skip to its old part.
    if i.is_some() && i == cap_last {
        i = first_new.and_then(|loc| store.prev_record(loc));
    }
    i
}

/// A cursor holding its current position between calls.
///
/// The store is borrowed only for the duration of each step, so inserts may
/// happen between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CappedCursor<L> {
    direction: Direction,
    current: Option<L>,
    started: bool,
}

impl<L: Copy + Eq + std::fmt::Debug> CappedCursor<L> {
    /// A cursor that starts at the store's start position on the first step.
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            current: None,
            started: false,
        }
    }

    /// A cursor positioned at `loc`; the first step moves past it.
    pub fn at(direction: Direction, loc: L) -> Self {
        Self {
            direction,
            current: Some(loc),
            started: true,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn current(&self) -> Option<L> {
        self.current
    }

    /// Whether the cursor ran off the end.
    pub fn is_exhausted(&self) -> bool {
        self.started && self.current.is_none()
    }

    /// Step to the next position and return it.
    pub fn step<S>(&mut self, store: &S) -> Option<L>
    where
        S: CappedRecordStore<Loc = L>,
    {
        if !self.started {
            self.started = true;
            self.current = start_position(store, self.direction);
        } else if let Some(current) = self.current {
            self.current = advance(store, self.direction, current);
        }
        self.current
    }

    /// Iterate the remaining positions against `store`.
    pub fn iter<S>(self, store: &S) -> CappedIter<'_, S>
    where
        S: CappedRecordStore<Loc = L>,
    {
        CappedIter {
            store,
            cursor: self,
        }
    }
}

/// Iterator over positions of a capped store.
#[derive(Debug)]
pub struct CappedIter<'a, S: CappedRecordStore> {
    store: &'a S,
    cursor: CappedCursor<S::Loc>,
}

impl<S: CappedRecordStore> Iterator for CappedIter<'_, S> {
    type Item = S::Loc;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.step(self.store)
    }
}
