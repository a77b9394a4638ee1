use shared::types::FieldValue;
use super::pool::{Slot, SlotPool};

pub struct LookupEntry<K> {
    key: Option<K>,
    value: FieldValue,
    hits: u32,
}

impl<K> Default for LookupEntry<K> {
    fn default() -> Self {
        Self {
            key: None,
            value: FieldValue::Unpopulated,
            hits: 0,
        }
    }
}

impl<K: PartialEq> Slot for LookupEntry<K> {
    type Key = K;

    fn matches(&self, key: &K) -> bool {
        self.key.as_ref() == Some(key)
    }

    fn is_vacant(&self) -> bool {
        self.key.is_none()
    }

    fn hits(&self) -> u32 {
        self.hits
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Bounded key -> display name cache with round-robin replacement.
///
/// Entries are written once and read uniformly, so popularity is tracked
/// but never used to pick a victim.
pub struct LookupCache<K> {
    pool: SlotPool<LookupEntry<K>>,
}

impl<K: PartialEq> LookupCache<K> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pool: SlotPool::with_capacity(capacity),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<FieldValue> {
        let index = self.pool.find(key)?;
        let entry = self.pool.get_mut(index)?;
        entry.hits = entry.hits.saturating_add(1);
        Some(entry.value.clone())
    }

    pub fn put(&mut self, key: K, value: FieldValue) {
        let index = self.pool.next_round_robin();
        if let Some(entry) = self.pool.get_mut(index) {
            entry.reset();
            entry.key = Some(key);
            entry.value = value;
        }
    }

    pub fn len(&self) -> usize {
        self.pool.occupied()
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }
}
