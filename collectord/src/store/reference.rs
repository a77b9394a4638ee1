use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use rusqlite::{Connection, OpenFlags, OptionalExtension, ToSql};
use crate::bus::Bus;
use super::error::StoreError;

/// Read-only key -> name table used to resolve display names.
pub trait ReferenceSource: Send {
    type Key;

    fn lookup(&self, key: &Self::Key) -> Result<Option<String>, StoreError>;
}

/// One SQLite reference table, opened read-only around each query.
pub struct ReferenceTable<K> {
    path: PathBuf,
    bus: Bus,
    query: &'static str,
    _key: PhantomData<fn() -> K>,
}

impl ReferenceTable<u16> {
    /// Bluetooth SIG company identifiers: `vendors(id INTEGER, name TEXT)`
    pub fn vendors(path: impl AsRef<Path>, bus: Bus) -> Self {
        Self::new(path, bus, "SELECT name FROM vendors WHERE id = ?1")
    }
}

impl ReferenceTable<String> {
    /// IEEE MA-L assignments: `oui(prefix TEXT, organization TEXT)`
    pub fn oui(path: impl AsRef<Path>, bus: Bus) -> Self {
        Self::new(path, bus, "SELECT organization FROM oui WHERE prefix = ?1")
    }
}

impl<K> ReferenceTable<K> {
    fn new(path: impl AsRef<Path>, bus: Bus, query: &'static str) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            bus,
            query,
            _key: PhantomData,
        }
    }
}

impl<K: ToSql> ReferenceSource for ReferenceTable<K> {
    type Key = K;

    fn lookup(&self, key: &K) -> Result<Option<String>, StoreError> {
        let _bus = self.bus.lock();
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let name = conn
            .query_row(self.query, [key], |row| row.get::<_, String>(0))
            .optional()?;
        Ok(name)
    }
}
