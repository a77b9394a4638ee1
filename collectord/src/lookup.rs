//! Vendor and organization name resolution: a bounded cache in front of a
//! read-only reference table.

use serde::Serialize;
use shared::types::{FieldValue, Record};
use crate::cache::lookup::LookupCache;
use crate::store::ReferenceSource;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LookupStats {
    pub cache_hits: u64,
    pub queries: u64,
    pub misses: u64,
    pub failures: u64,
    /// Entries currently cached
    pub cached: usize,
    pub capacity: usize,
}

pub struct LookupClient<K> {
    cache: LookupCache<K>,
    source: Box<dyn ReferenceSource<Key = K>>,
    /// Cached and returned when the table has no entry
    miss: FieldValue,
    stats: LookupStats,
}

impl<K: PartialEq + Clone + std::fmt::Debug> LookupClient<K> {
    pub fn new(
        capacity: usize,
        source: Box<dyn ReferenceSource<Key = K>>,
        miss: FieldValue,
    ) -> Self {
        Self {
            cache: LookupCache::with_capacity(capacity),
            source,
            miss,
            stats: LookupStats::default(),
        }
    }

    /// Resolve `key` to a display name. Misses are cached as the miss
    /// sentinel; a failing table yields the sentinel without caching it.
    pub fn resolve(&mut self, key: &K) -> FieldValue {
        if let Some(value) = self.cache.get(key) {
            self.stats.cache_hits += 1;
            return value;
        }

        self.stats.queries += 1;
        let value = match self.source.lookup(key) {
            Ok(Some(name)) if !name.trim().is_empty() => FieldValue::text(name.trim()),
            Ok(_) => {
                self.stats.misses += 1;
                self.miss.clone()
            }
            Err(e) => {
                self.stats.failures += 1;
                tracing::warn!("Reference lookup for {:?} failed: {}", key, e);
                return self.miss.clone();
            }
        };
        self.cache.put(key.clone(), value.clone());
        value
    }

    pub fn stats(&self) -> LookupStats {
        LookupStats {
            cached: self.cache.len(),
            capacity: self.cache.capacity(),
            ..self.stats
        }
    }
}

/// Vendor name by Bluetooth company id
pub type VendorClient = LookupClient<u16>;
/// Organization name by address prefix
pub type OuiClient = LookupClient<String>;

/// Fill an unresolved organization: random and private addresses carry no
/// registered prefix, public ones go through the OUI table.
pub fn resolve_organization(oui: &mut OuiClient, record: &mut Record) {
    if record.organization != FieldValue::Unpopulated {
        return;
    }
    record.organization = match record.address_kind.organization_sentinel() {
        Some(sentinel) => sentinel,
        None => oui.resolve(&record.address.oui()),
    };
}

/// Fill an unresolved vendor from the manufacturer id, if there is one.
pub fn resolve_vendor(vendors: &mut VendorClient, record: &mut Record) {
    if record.vendor != FieldValue::Unpopulated {
        return;
    }
    record.vendor = match record.manufacturer_id {
        Some(id) => vendors.resolve(&id),
        None => FieldValue::Unknown,
    };
}

pub fn needs_resolution(record: &Record) -> bool {
    record.organization == FieldValue::Unpopulated || record.vendor == FieldValue::Unpopulated
}

#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use crate::store::ReferenceSource;
    use crate::store::error::StoreError;

    /// In-memory reference table counting the queries it answers.
    pub struct MapSource<K> {
        pub entries: HashMap<K, String>,
        pub queries: Arc<AtomicU64>,
        pub failing: bool,
    }

    impl<K> MapSource<K> {
        pub fn new(entries: impl IntoIterator<Item = (K, &'static str)>) -> Self
        where
            K: std::hash::Hash + Eq,
        {
            Self {
                entries: entries.into_iter().map(|(k, v)| (k, v.to_string())).collect(),
                queries: Arc::new(AtomicU64::new(0)),
                failing: false,
            }
        }
    }

    impl<K: std::hash::Hash + Eq + Send> ReferenceSource for MapSource<K> {
        type Key = K;

        fn lookup(&self, key: &K) -> Result<Option<String>, StoreError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.failing {
                return Err(StoreError::Io("unable to open database file".to_string()));
            }
            Ok(self.entries.get(key).cloned())
        }
    }
}
