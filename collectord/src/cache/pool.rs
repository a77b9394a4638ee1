//! Fixed-capacity slot arrays addressed by index.
//!
//! A pool never grows after construction. Reuse goes through
//! [`SlotPool::next_eviction_target`]: the first vacant slot after the
//! starting index wins, otherwise the occupant with the fewest hits seen in
//! one full circular sweep.

use shared::types::{CopyMode, MacAddress, Record};

/// One entry of a [`SlotPool`].
pub trait Slot: Default {
    type Key: ?Sized;

    fn matches(&self, key: &Self::Key) -> bool;
    fn is_vacant(&self) -> bool;
    fn hits(&self) -> u32;
    fn reset(&mut self);
}

impl Slot for Record {
    type Key = MacAddress;

    fn matches(&self, key: &MacAddress) -> bool {
        !self.address.is_vacant() && self.address == *key
    }

    fn is_vacant(&self) -> bool {
        self.address.is_vacant()
    }

    fn hits(&self) -> u32 {
        self.hits
    }

    fn reset(&mut self) {
        Record::reset(self);
    }
}

pub struct SlotPool<T> {
    slots: Vec<T>,
    // Last slot handed out; sweeps start right after it.
    cursor: usize,
    evictions: u64,
}

impl<T: Slot> SlotPool<T> {
    /// Allocate `requested` slots, halving on allocation failure so the
    /// caller gets a smaller working pool instead of an abort.
    pub fn with_capacity(requested: usize) -> Self {
        let mut capacity = requested.max(1);
        let slots = loop {
            let mut slots: Vec<T> = Vec::new();
            match slots.try_reserve_exact(capacity) {
                Ok(()) => {
                    slots.resize_with(capacity, T::default);
                    break slots;
                }
                Err(e) if capacity > 1 => {
                    tracing::warn!(
                        "Could not allocate {} slots ({}), retrying with {}",
                        capacity,
                        e,
                        capacity / 2
                    );
                    capacity /= 2;
                }
                Err(e) => {
                    tracing::error!("Slot allocation failed ({}), running with a single slot", e);
                    break vec![T::default()];
                }
            }
        };
        if slots.len() < requested {
            tracing::warn!("Pool running at reduced capacity {}/{}", slots.len(), requested);
        }
        let cursor = slots.len() - 1;
        Self {
            slots,
            cursor,
            evictions: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_vacant()).count()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)
    }

    pub fn iter_occupied(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter(|s| !s.is_vacant())
    }

    pub fn find(&self, key: &T::Key) -> Option<usize> {
        self.slots.iter().position(|s| s.matches(key))
    }

    /// First vacant slot after `after` (wrapping), else the least-hit occupant
    /// of the sweep. Ties go to the first one encountered.
    pub fn next_eviction_target(&self, after: usize) -> usize {
        let n = self.slots.len();
        let mut victim: Option<(usize, u32)> = None;
        for step in 1..=n {
            let index = (after % n + step) % n;
            let slot = &self.slots[index];
            if slot.is_vacant() {
                return index;
            }
            match victim {
                Some((_, fewest)) if fewest <= slot.hits() => {}
                _ => victim = Some((index, slot.hits())),
            }
        }
        victim.map(|(index, _)| index).unwrap_or(0)
    }

    /// Plain circular advance, ignoring occupancy and popularity.
    pub fn next_round_robin(&mut self) -> usize {
        self.cursor = (self.cursor + 1) % self.slots.len();
        self.cursor
    }

    /// Pick the eviction target after the last handed-out slot and reset it.
    pub fn claim(&mut self) -> usize {
        let index = self.next_eviction_target(self.cursor);
        let slot = &mut self.slots[index];
        if !slot.is_vacant() {
            self.evictions += 1;
        }
        slot.reset();
        self.cursor = index;
        index
    }

    pub fn reset_all(&mut self) {
        for slot in &mut self.slots {
            slot.reset();
        }
        self.cursor = self.slots.len() - 1;
    }
}

impl SlotPool<Record> {
    /// Merge into the slot holding the same address, or claim a slot and
    /// copy the record in wholesale.
    pub fn insert_or_update(&mut self, record: &Record) -> usize {
        let (index, mode) = match self.find(&record.address) {
            Some(index) => (index, CopyMode::Merge),
            None => (self.claim(), CopyMode::Overwrite),
        };
        if let Err(e) = self.slots[index].copy_from(record, mode) {
            tracing::error!("Pool slot {}: {}", index, e);
        }
        index
    }
}
