use chrono::{DateTime, Utc};
use shared::types::{FieldValue, Record};
use crate::cache::DevicePool;
use crate::radio::Advertisement;

/// Per-scan staging area. Filled in arrival order while the radio scans,
/// drained by the pipeline, then emptied before the next scan.
pub struct StagingPool {
    pool: DevicePool,
    count: usize,
    overflowed: u64,
}

impl StagingPool {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pool: DevicePool::with_capacity(capacity),
            count: 0,
            overflowed: 0,
        }
    }

    /// Stage one advertisement. Repeated sightings within the scan bump the
    /// staged hit count; new devices beyond capacity are dropped and counted.
    pub fn store(&mut self, advert: Advertisement, now: Option<DateTime<Utc>>) -> bool {
        if let Some(staged) = self
            .pool
            .find(&advert.address)
            .and_then(|index| self.pool.get_mut(index))
        {
            staged.hits = staged.hits.saturating_add(1);
            staged.rssi = advert.rssi;
            if now.is_some() {
                staged.updated_at = now;
            }
            return true;
        }

        if self.count >= self.pool.capacity() || advert.address.is_vacant() {
            self.overflowed += 1;
            return false;
        }
        if let Some(slot) = self.pool.get_mut(self.count) {
            *slot = to_record(&advert, now);
            self.count += 1;
        }
        true
    }

    /// Number of staged devices; the pipeline cursor runs over `0..len()`.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Advertisements dropped for lack of room since the last drain.
    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }

    pub fn get(&self, index: usize) -> Option<&Record> {
        self.pool.get(index).filter(|_| index < self.count)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Record> {
        if index >= self.count {
            return None;
        }
        self.pool.get_mut(index)
    }

    pub fn reset_slot(&mut self, index: usize) {
        if let Some(slot) = self.pool.get_mut(index) {
            slot.reset();
        }
    }

    /// Empty every slot and clear the overflow counter.
    pub fn drain_reset(&mut self) {
        self.pool.reset_all();
        self.count = 0;
        self.overflowed = 0;
    }
}

fn to_record(advert: &Advertisement, now: Option<DateTime<Utc>>) -> Record {
    let optional = |value: &Option<String>| {
        value
            .as_deref()
            .map(|s| FieldValue::text(s.trim()))
            .unwrap_or(FieldValue::Empty)
    };

    let mut record = Record::new(advert.address);
    record.address_kind = advert.kind;
    record.rssi = advert.rssi;
    record.name = optional(&advert.name);
    record.service_id = optional(&advert.service_id);
    record.appearance = advert.appearance.unwrap_or(0);
    record.manufacturer_id = advert.manufacturer_id();
    record.hits = 1;
    record.created_at = now;
    record.updated_at = now;
    record
}
