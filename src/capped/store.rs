//! Arena-backed capped record store.

use super::{CappedRecordStore, RecordStore};
use crate::error::{Error, Result};
use bytes::Bytes;
use std::fmt;

/// Handle to a record slot.
///
/// The generation changes whenever the slot is recycled, so a handle to an
/// overwritten record never aliases the record that replaced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    slot: u32,
    generation: u32,
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.slot, self.generation)
    }
}

#[derive(Debug)]
struct Record {
    data: Bytes,
    extent: usize,
    next: Option<u32>,
    prev: Option<u32>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    record: Option<Record>,
}

#[derive(Debug)]
struct Extent {
    capacity: usize,
    len: usize,
    first: Option<u32>,
    last: Option<u32>,
}

impl Extent {
    fn is_full(&self) -> bool {
        self.len >= self.capacity
    }
}

/// Largest total capacity of a store; slots are addressed by `u32`.
pub const MAX_CAPPED_RECORDS: usize = u32::MAX as usize;

/// Fixed-capacity record store that overwrites its oldest records once full.
///
/// Records are linked within their extent in insertion order; extents are
/// traversed in index order.
#[derive(Debug)]
pub struct InMemoryCappedStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    extents: Vec<Extent>,
    cap_extent: usize,
    cap_first_new: Option<u32>,
    looped: bool,
    len: usize,
}

impl InMemoryCappedStore {
    /// Create a store of `num_extents` extents holding `records_per_extent` each.
    pub fn new(num_extents: usize, records_per_extent: usize) -> Result<Self> {
        Self::with_extents(&vec![records_per_extent; num_extents])
    }

    /// Create a store with one extent per entry of `capacities`.
    pub fn with_extents(capacities: &[usize]) -> Result<Self> {
        if capacities.is_empty() {
            return Err(Error::Config("capped store needs at least one extent".into()));
        }
        if capacities.iter().any(|&c| c == 0) {
            return Err(Error::Config("capped extents need a non-zero capacity".into()));
        }
        let total = capacities
            .iter()
            .try_fold(0usize, |acc, &c| acc.checked_add(c))
            .filter(|&total| total <= MAX_CAPPED_RECORDS);
        if total.is_none() {
            return Err(Error::Config(format!(
                "capped store capacity exceeds {} records",
                MAX_CAPPED_RECORDS
            )));
        }
        Ok(Self {
            slots: Vec::new(),
            free: Vec::new(),
            extents: capacities
                .iter()
                .map(|&capacity| Extent {
                    capacity,
                    len: 0,
                    first: None,
                    last: None,
                })
                .collect(),
            cap_extent: 0,
            cap_first_new: None,
            looped: false,
            len: 0,
        })
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total record capacity.
    pub fn capacity(&self) -> usize {
        self.extents.iter().map(|e| e.capacity).sum()
    }

    /// Data of a live record.
    pub fn get(&self, id: RecordId) -> Option<&Bytes> {
        self.record(id).map(|r| &r.data)
    }

    /// Append a record, overwriting the oldest one when the store is full.
    pub fn insert(&mut self, data: impl Into<Bytes>) -> RecordId {
        let data = data.into();
        if !self.looped {
            while self.extents[self.cap_extent].is_full() {
                if self.cap_extent + 1 < self.extents.len() {
                    self.cap_extent += 1;
                } else {
                    self.looped = true;
                    self.cap_extent = 0;
                    self.cap_first_new = None;
                    tracing::debug!(capacity = self.capacity(), "capped store looped");
                    break;
                }
            }
        }

        if self.looped {
            let extent = &self.extents[self.cap_extent];
            if self.cap_first_new.is_some() && self.cap_first_new == extent.first {
                // Every record in the cap extent is new; start overwriting the next one.
                self.cap_extent = (self.cap_extent + 1) % self.extents.len();
                self.cap_first_new = None;
            }
            if let Some(oldest) = self.extents[self.cap_extent].first {
                self.remove(oldest);
            }
        }

        let slot = self.append(self.cap_extent, data);
        if self.looped && self.cap_first_new.is_none() {
            self.cap_first_new = Some(slot);
        }
        self.id(slot)
    }

    fn id(&self, slot: u32) -> RecordId {
        RecordId {
            slot,
            generation: self.slots[slot as usize].generation,
        }
    }

    fn record(&self, id: RecordId) -> Option<&Record> {
        let slot = self.slots.get(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.record.as_ref()
    }

    fn record_at(&self, slot: u32) -> Option<&Record> {
        self.slots.get(slot as usize)?.record.as_ref()
    }

    fn append(&mut self, extent_idx: usize, data: Bytes) -> u32 {
        let prev = self.extents[extent_idx].last;
        let record = Record {
            data,
            extent: extent_idx,
            next: None,
            prev,
        };

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize].record = Some(record);
                slot
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    record: Some(record),
                });
                // The oldest record is freed before each append, so the arena
                // never outgrows the capacity bounded in `with_extents`.
                (self.slots.len() - 1) as u32
            }
        };

        if let Some(prev) = prev {
            if let Some(r) = self.slots[prev as usize].record.as_mut() {
                r.next = Some(slot);
            }
        }
        let extent = &mut self.extents[extent_idx];
        if extent.first.is_none() {
            extent.first = Some(slot);
        }
        extent.last = Some(slot);
        extent.len += 1;
        self.len += 1;
        slot
    }

    fn remove(&mut self, slot: u32) {
        let Some(record) = self.slots[slot as usize].record.take() else {
            return;
        };
        self.slots[slot as usize].generation = self.slots[slot as usize].generation.wrapping_add(1);
        self.free.push(slot);

        if let Some(prev) = record.prev {
            if let Some(r) = self.slots[prev as usize].record.as_mut() {
                r.next = record.next;
            }
        }
        if let Some(next) = record.next {
            if let Some(r) = self.slots[next as usize].record.as_mut() {
                r.prev = record.prev;
            }
        }
        let extent = &mut self.extents[record.extent];
        if extent.first == Some(slot) {
            extent.first = record.next;
        }
        if extent.last == Some(slot) {
            extent.last = record.prev;
        }
        extent.len -= 1;
        self.len -= 1;
    }

    fn first_in_extents_from(&self, start: usize) -> Option<u32> {
        self.extents[start..].iter().find_map(|e| e.first)
    }

    fn last_in_extents_before(&self, end: usize) -> Option<u32> {
        self.extents[..end].iter().rev().find_map(|e| e.last)
    }
}

impl RecordStore for InMemoryCappedStore {
    type Loc = RecordId;

    fn first_record(&self) -> Option<RecordId> {
        self.first_in_extents_from(0).map(|s| self.id(s))
    }

    fn last_record(&self) -> Option<RecordId> {
        self.last_in_extents_before(self.extents.len())
            .map(|s| self.id(s))
    }

    fn next_record(&self, loc: RecordId) -> Option<RecordId> {
        let record = self.record(loc)?;
        record
            .next
            .or_else(|| self.first_in_extents_from(record.extent + 1))
            .map(|s| self.id(s))
    }

    fn prev_record(&self, loc: RecordId) -> Option<RecordId> {
        let record = self.record(loc)?;
        record
            .prev
            .or_else(|| self.last_in_extents_before(record.extent))
            .map(|s| self.id(s))
    }

    fn is_live(&self, loc: RecordId) -> bool {
        self.record(loc).is_some()
    }
}

impl CappedRecordStore for InMemoryCappedStore {
    fn cap_extent_first(&self) -> Option<RecordId> {
        self.extents[self.cap_extent].first.map(|s| self.id(s))
    }

    fn cap_extent_last(&self) -> Option<RecordId> {
        self.extents[self.cap_extent].last.map(|s| self.id(s))
    }

    fn cap_first_new_record(&self) -> Option<RecordId> {
        self.cap_first_new
            .filter(|&s| self.record_at(s).is_some())
            .map(|s| self.id(s))
    }

    fn looped(&self) -> bool {
        self.looped
    }
}
