use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::Serialize;
use shared::types::{AddressKind, FieldValue, MacAddress, Record};
use crate::bus::Bus;
use crate::cache::DevicePool;
use super::error::{RestartReason, StoreError};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS devices (
        address         TEXT PRIMARY KEY,
        name            TEXT NOT NULL,
        organization    TEXT NOT NULL,
        vendor          TEXT NOT NULL,
        service_id      TEXT NOT NULL,
        manufacturer_id INTEGER NOT NULL DEFAULT -1,
        appearance      INTEGER NOT NULL DEFAULT 0,
        rssi            INTEGER NOT NULL DEFAULT 0,
        address_kind    INTEGER NOT NULL DEFAULT 0,
        hits            INTEGER NOT NULL DEFAULT 1,
        created_at      TEXT,
        updated_at      TEXT
    );
"#;

const COLUMNS: &str = "address, name, organization, vendor, service_id, manufacturer_id,
                       appearance, rssi, address_kind, hits, created_at, updated_at";

/// Rows that say nothing beyond "some phone walked by".
const PRUNE_SQL: &str = r#"
    DELETE FROM devices
    WHERE name IN ('', '[unpopulated]')
      AND appearance = 0
      AND service_id IN ('', '[unpopulated]')
      AND organization = '[private]'
      AND (vendor LIKE 'Apple%' OR vendor = '[unknown]')
"#;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreStats {
    pub resets: u64,
    pub inserts: u64,
    pub insert_failures: u64,
    /// Inserts that landed on an existing row
    pub refreshes: u64,
    pub touches: u64,
    pub pruned: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The address already had a row; its counters were refreshed
    Refreshed,
    Rejected(RejectReason),
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// A previous out-of-memory error disabled writes until restart
    OutOfMemory,
    /// Store is waiting for the restart it requested
    RestartPending,
    /// Nothing distinguishing to store
    Featureless,
    Anonymous,
}

/// The authoritative table of non-anonymous devices.
///
/// Every operation holds the bus for its whole open/query/close sequence.
/// Errors never leave this type: they are classified and recovered from
/// here, and callers only see an outcome plus, for unrecoverable
/// conditions, a pending [`RestartReason`].
pub struct DeviceStore {
    path: PathBuf,
    bus: Bus,
    out_of_memory: bool,
    corrupted: bool,
    restart: Option<RestartReason>,
    stats: StoreStats,
}

impl DeviceStore {
    /// Open or create the database file and its schema
    pub fn open(path: impl AsRef<Path>, bus: Bus) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        {
            let _bus = bus.lock();
            match create_schema(path) {
                Err(StoreError::Malformed(e)) => {
                    tracing::warn!("{} is malformed ({}), starting a new one", path.display(), e);
                    remove_database(path)?;
                    create_schema(path)
                }
                other => other,
            }
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            bus,
            out_of_memory: false,
            corrupted: false,
            restart: None,
            stats: StoreStats::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    pub fn is_out_of_memory(&self) -> bool {
        self.out_of_memory
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    /// Hand over the pending restart request, if any. Yields it once.
    pub fn take_restart(&mut self) -> Option<RestartReason> {
        self.restart.take()
    }

    /// Look `address` up and, on a hit, load the row into `pool`.
    /// Returns the pool index of the loaded entry.
    pub fn exists(&mut self, address: &MacAddress, pool: &mut DevicePool) -> Option<usize> {
        let row = self.lookup(address)?;
        Some(pool.insert_or_update(&row))
    }

    pub fn lookup(&mut self, address: &MacAddress) -> Option<Record> {
        if self.restart.is_some() {
            return None;
        }
        let sql = format!("SELECT {COLUMNS} FROM devices WHERE address = ?1");
        let key = address.to_string();
        let result = self.run(true, |conn| {
            conn.query_row(&sql, params![key], row_to_record).optional()
        });
        match result {
            Ok(row) => row,
            Err(e) => {
                self.recover("lookup", e);
                None
            }
        }
    }

    /// Write a new row, or refresh rssi/updated_at if the address is already
    /// present. A stored hit count never goes down. Marks the record as
    /// stored on success.
    pub fn insert(&mut self, record: &mut Record) -> InsertOutcome {
        if self.out_of_memory {
            return InsertOutcome::Rejected(RejectReason::OutOfMemory);
        }
        if self.restart.is_some() || self.corrupted {
            return InsertOutcome::Rejected(RejectReason::RestartPending);
        }
        if record.is_anonymous {
            return InsertOutcome::Rejected(RejectReason::Anonymous);
        }
        if record.is_featureless() {
            return InsertOutcome::Rejected(RejectReason::Featureless);
        }

        let sql = format!(
            "INSERT INTO devices ({COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(address) DO UPDATE SET
                 rssi = excluded.rssi,
                 hits = MAX(devices.hits, excluded.hits),
                 updated_at = COALESCE(excluded.updated_at, devices.updated_at)"
        );
        let row: &Record = record;
        let key = row.address.to_string();
        let result = self.run(false, |conn| {
            let existed = conn
                .query_row("SELECT 1 FROM devices WHERE address = ?1", params![key], |_| Ok(()))
                .optional()?
                .is_some();
            conn.execute(
                &sql,
                params![
                    key,
                    row.name.as_str(),
                    row.organization.as_str(),
                    row.vendor.as_str(),
                    row.service_id.as_str(),
                    row.manufacturer_id.map_or(-1, i64::from),
                    row.appearance,
                    row.rssi,
                    row.address_kind.as_u8(),
                    row.hits.max(1),
                    row.created_at.map(|t| t.to_rfc3339()),
                    row.updated_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(existed)
        });

        match result {
            Ok(existed) => {
                record.in_store = true;
                if existed {
                    self.stats.refreshes += 1;
                    InsertOutcome::Refreshed
                } else {
                    self.stats.inserts += 1;
                    InsertOutcome::Inserted
                }
            }
            Err(e) => {
                self.stats.insert_failures += 1;
                self.recover("insert", e);
                InsertOutcome::Failed
            }
        }
    }

    /// Refresh the hit count and last-seen time of an existing row.
    pub fn touch(&mut self, record: &Record) -> bool {
        if self.restart.is_some() || self.corrupted || self.out_of_memory {
            return false;
        }
        let key = record.address.to_string();
        let updated_at = record.updated_at.map(|t| t.to_rfc3339());
        let result = self.run(false, |conn| {
            conn.execute(
                "UPDATE devices SET hits = ?1, rssi = ?2, updated_at = COALESCE(?3, updated_at)
                 WHERE address = ?4",
                params![record.hits, record.rssi, updated_at, key],
            )
        });
        match result {
            Ok(changed) => {
                self.stats.touches += changed as u64;
                changed > 0
            }
            Err(e) => {
                self.recover("touch", e);
                false
            }
        }
    }

    pub fn count(&mut self) -> Option<u64> {
        if self.restart.is_some() {
            return None;
        }
        let result = self.run(true, |conn| {
            conn.query_row("SELECT COUNT(*) FROM devices", [], |row| row.get::<_, i64>(0))
        });
        match result {
            Ok(count) => Some(count.max(0) as u64),
            Err(e) => {
                self.recover("count", e);
                None
            }
        }
    }

    /// Delete maximally uninformative rows. Returns the number removed.
    pub fn prune(&mut self) -> Option<usize> {
        if self.restart.is_some() || self.corrupted {
            return None;
        }
        match self.run(false, |conn| conn.execute(PRUNE_SQL, [])) {
            Ok(removed) => {
                self.stats.pruned += removed as u64;
                if removed > 0 {
                    tracing::info!("Pruned {} uninformative rows", removed);
                }
                Some(removed)
            }
            Err(e) => {
                self.recover("prune", e);
                None
            }
        }
    }

    /// Most recently updated rows, newest first.
    pub fn samples(&mut self, limit: usize) -> Option<Vec<Record>> {
        if self.restart.is_some() {
            return None;
        }
        let sql = format!(
            "SELECT {COLUMNS} FROM devices ORDER BY updated_at DESC, hits DESC LIMIT ?1"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let result = self.run(true, |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![limit], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        });
        match result {
            Ok(rows) => Some(rows),
            Err(e) => {
                self.recover("samples", e);
                None
            }
        }
    }

    /// Drop and recreate the device table, then ask for a restart since the
    /// in-memory caches no longer match the store.
    pub fn reset(&mut self) {
        if let Err(e) = self.reset_table() {
            tracing::error!("Device table reset failed: {}", e);
        }
        self.request_restart(RestartReason::Reset);
    }

    fn reset_table(&mut self) -> Result<(), StoreError> {
        self.stats.resets += 1;
        tracing::warn!("Resetting device table in {}", self.path.display());

        let recreated = self.run(false, |conn| {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS devices;\n{SCHEMA}"))
        });
        if recreated.is_ok() {
            return Ok(());
        }

        // The file itself is unreadable: start over from an empty one
        let _bus = self.bus.lock();
        remove_database(&self.path)?;
        create_schema(&self.path)
    }

    /// Move the database file aside so the next boot starts clean.
    fn quarantine(&mut self) {
        let _bus = self.bus.lock();
        let mut aside = self.path.clone().into_os_string();
        aside.push(format!(".corrupt-{}", Utc::now().timestamp()));
        match std::fs::rename(&self.path, &aside) {
            Ok(()) => tracing::warn!(
                "Moved {} aside to {}",
                self.path.display(),
                Path::new(&aside).display()
            ),
            Err(e) => tracing::error!("Could not move {} aside: {}", self.path.display(), e),
        }
    }

    fn request_restart(&mut self, reason: RestartReason) {
        if self.restart.is_none() {
            tracing::warn!("Store requests restart: {}", reason);
            self.restart = Some(reason);
        }
    }

    fn recover(&mut self, operation: &str, err: StoreError) {
        self.stats.errors += 1;
        tracing::error!("Store {} failed: {}", operation, err);
        match err {
            StoreError::Malformed(_) | StoreError::MissingTable(_) if self.restart.is_none() => {
                let reason = match err {
                    StoreError::Malformed(_) => RestartReason::Malformed,
                    _ => RestartReason::MissingTable,
                };
                if let Err(e) = self.reset_table() {
                    tracing::error!("Recovery reset failed: {}", e);
                }
                self.request_restart(reason);
            }
            StoreError::Malformed(_) | StoreError::MissingTable(_) => {}
            StoreError::OutOfMemory => {
                if !self.out_of_memory {
                    tracing::error!("Out of memory: store writes disabled until restart");
                }
                self.out_of_memory = true;
            }
            StoreError::Io(_) => {
                if !self.corrupted {
                    self.corrupted = true;
                    self.quarantine();
                }
                self.request_restart(RestartReason::Quarantined);
            }
            StoreError::Other(_) => {}
        }
    }

    /// Scoped acquisition: bus lock, open, run, close.
    fn run<T>(
        &self,
        read_only: bool,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let _bus = self.bus.lock();
        let flags = if read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX
        };
        let conn = Connection::open_with_flags(&self.path, flags)?;
        let out = f(&conn)?;
        conn.close().map_err(|(_, e)| StoreError::from(e))?;
        Ok(out)
    }
}

fn create_schema(path: &Path) -> Result<(), StoreError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Remove the database file and its rollback journal.
fn remove_database(path: &Path) -> Result<(), StoreError> {
    let mut journal = path.to_path_buf().into_os_string();
    journal.push("-journal");
    for file in [path.to_path_buf(), PathBuf::from(journal)] {
        match std::fs::remove_file(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Helper to convert a database row to a Record
fn row_to_record(row: &rusqlite::Row) -> Result<Record, rusqlite::Error> {
    let address_str: String = row.get(0)?;
    let address = address_str.parse::<MacAddress>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let manufacturer_id: i64 = row.get(5)?;
    let kind: u8 = row.get(8)?;

    Ok(Record {
        address,
        name: FieldValue::text(&row.get::<_, String>(1)?),
        organization: FieldValue::text(&row.get::<_, String>(2)?),
        vendor: FieldValue::text(&row.get::<_, String>(3)?),
        service_id: FieldValue::text(&row.get::<_, String>(4)?),
        manufacturer_id: u16::try_from(manufacturer_id).ok(),
        appearance: row.get(6)?,
        rssi: row.get(7)?,
        address_kind: AddressKind::from_u8(kind).unwrap_or_default(),
        hits: row.get(9)?,
        is_anonymous: false,
        in_store: true,
        created_at: parse_timestamp(row.get(10)?),
        updated_at: parse_timestamp(row.get(11)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::new_bus;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, DeviceStore) {
        let dir = TempDir::new().unwrap();
        let store = DeviceStore::open(dir.path().join("blemacs.db"), new_bus()).unwrap();
        (dir, store)
    }

    fn test_record(last: u8) -> Record {
        let mut record = Record::new(MacAddress([0xb4, 0x99, 0xba, 0x10, 0x20, last]));
        record.name = FieldValue::text("Joe's \"quoted\" beacon");
        record.organization = FieldValue::text("Hewlett Packard");
        record.vendor = FieldValue::Unknown;
        record.manufacturer_id = Some(0x0006);
        record.rssi = -70;
        record.hits = 1;
        record.created_at = Some(Utc::now());
        record.updated_at = record.created_at;
        record
    }

    #[test]
    fn test_insert_and_lookup() {
        let (_dir, mut store) = open_store();
        let mut record = test_record(1);

        assert_eq!(store.insert(&mut record), InsertOutcome::Inserted);
        assert!(record.in_store);

        let row = store.lookup(&record.address).unwrap();
        assert_eq!(row.name.as_str(), "Joe's \"quoted\" beacon");
        assert_eq!(row.vendor, FieldValue::Unknown);
        assert_eq!(row.manufacturer_id, Some(0x0006));
        assert!(row.in_store);
        assert_eq!(store.count(), Some(1));
        assert!(store.lookup(&test_record(2).address).is_none());
    }

    #[test]
    fn test_insert_over_existing_row_keeps_higher_hits() {
        let (_dir, mut store) = open_store();
        let mut stored = test_record(9);
        stored.hits = 50;
        assert_eq!(store.insert(&mut stored), InsertOutcome::Inserted);

        let mut resighted = test_record(9);
        resighted.hits = 2;
        resighted.rssi = -40;
        assert_eq!(store.insert(&mut resighted), InsertOutcome::Refreshed);
        assert!(resighted.in_store);

        let row = store.lookup(&resighted.address).unwrap();
        assert_eq!(row.hits, 50);
        assert_eq!(row.rssi, -40);
        assert_eq!(store.count(), Some(1));
        assert_eq!(store.stats().inserts, 1);
        assert_eq!(store.stats().refreshes, 1);
    }

    #[test]
    fn test_absent_manufacturer_round_trips() {
        let (_dir, mut store) = open_store();
        let mut record = test_record(3);
        record.manufacturer_id = None;
        record.created_at = None;
        record.updated_at = None;
        store.insert(&mut record);

        let row = store.lookup(&record.address).unwrap();
        assert_eq!(row.manufacturer_id, None);
        assert_eq!(row.created_at, None);
    }

    #[test]
    fn test_exists_loads_into_pool() {
        let (_dir, mut store) = open_store();
        let mut record = test_record(4);
        record.hits = 5;
        store.insert(&mut record);

        let mut pool = DevicePool::with_capacity(4);
        let index = store.exists(&record.address, &mut pool).unwrap();
        let entry = pool.get(index).unwrap();
        assert_eq!(entry.address, record.address);
        assert_eq!(entry.hits, 5);
        assert!(entry.in_store);

        assert!(store.exists(&test_record(5).address, &mut pool).is_none());
    }

    #[test]
    fn test_insert_rejects_featureless_and_anonymous() {
        let (_dir, mut store) = open_store();
        let mut empty = Record::new(MacAddress([0x02, 0, 0, 0, 0, 1]));
        assert_eq!(
            store.insert(&mut empty),
            InsertOutcome::Rejected(RejectReason::Featureless)
        );

        let mut anonymous = test_record(6);
        anonymous.is_anonymous = true;
        assert_eq!(
            store.insert(&mut anonymous),
            InsertOutcome::Rejected(RejectReason::Anonymous)
        );
        assert_eq!(store.count(), Some(0));
    }

    #[test]
    fn test_touch_updates_hits() {
        let (_dir, mut store) = open_store();
        let mut record = test_record(7);
        store.insert(&mut record);

        record.hits = 9;
        assert!(store.touch(&record));
        assert_eq!(store.lookup(&record.address).unwrap().hits, 9);
        assert!(!store.touch(&test_record(8)));
    }

    #[test]
    fn test_prune_removes_uninformative_rows() {
        let (_dir, mut store) = open_store();

        let mut apple = Record::new(MacAddress([0x4a, 0, 0, 0, 0, 1]));
        apple.organization = FieldValue::Private;
        apple.vendor = FieldValue::text("Apple, Inc.");
        store.insert(&mut apple);

        let mut unknown = Record::new(MacAddress([0x4a, 0, 0, 0, 0, 2]));
        unknown.organization = FieldValue::Private;
        unknown.vendor = FieldValue::Unknown;
        store.insert(&mut unknown);

        let mut named = apple.clone();
        named.address = MacAddress([0x4a, 0, 0, 0, 0, 3]);
        named.name = FieldValue::text("AirPods");
        store.insert(&mut named);

        assert_eq!(store.prune(), Some(2));
        assert_eq!(store.count(), Some(1));
        assert!(store.lookup(&named.address).is_some());
    }

    #[test]
    fn test_samples_limit() {
        let (_dir, mut store) = open_store();
        for last in 10..15 {
            store.insert(&mut test_record(last));
        }
        assert_eq!(store.samples(3).unwrap().len(), 3);
    }

    #[test]
    fn test_malformed_database_resets_once_and_requests_restart() {
        let (_dir, mut store) = open_store();
        std::fs::write(store.path(), vec![b'x'; 4096]).unwrap();

        assert_eq!(store.count(), None);
        // further calls fail fast instead of resetting again
        assert_eq!(store.count(), None);
        assert!(store.insert(&mut test_record(20)) != InsertOutcome::Inserted);

        assert_eq!(store.stats().resets, 1);
        assert_eq!(store.take_restart(), Some(RestartReason::Malformed));
        assert_eq!(store.take_restart(), None);
        // the recreated table is usable
        assert_eq!(store.count(), Some(0));
    }

    #[test]
    fn test_open_replaces_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blemacs.db");
        std::fs::write(&path, vec![b'x'; 4096]).unwrap();

        let mut store = DeviceStore::open(&path, new_bus()).unwrap();
        assert_eq!(store.count(), Some(0));
    }

    #[test]
    fn test_missing_table_is_recreated() {
        let (_dir, mut store) = open_store();
        Connection::open(store.path())
            .unwrap()
            .execute_batch("DROP TABLE devices;")
            .unwrap();

        assert!(store.lookup(&test_record(1).address).is_none());
        assert_eq!(store.stats().resets, 1);
        assert_eq!(store.take_restart(), Some(RestartReason::MissingTable));
        assert_eq!(store.count(), Some(0));
    }

    #[test]
    fn test_out_of_memory_is_sticky() {
        let (_dir, mut store) = open_store();
        store.recover("insert", StoreError::OutOfMemory);

        assert!(store.is_out_of_memory());
        assert_eq!(
            store.insert(&mut test_record(30)),
            InsertOutcome::Rejected(RejectReason::OutOfMemory)
        );
        assert_eq!(store.take_restart(), None);
        assert_eq!(store.count(), Some(0));
    }

    #[test]
    fn test_io_error_quarantines_file() {
        let (dir, mut store) = open_store();
        store.recover("lookup", StoreError::Io("disk I/O error".to_string()));

        assert!(store.is_corrupted());
        assert!(!store.path().exists());
        let moved = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("blemacs.db.corrupt-"));
        assert!(moved);
        assert_eq!(store.take_restart(), Some(RestartReason::Quarantined));
    }

    #[test]
    fn test_reset_clears_rows_and_requests_restart() {
        let (_dir, mut store) = open_store();
        store.insert(&mut test_record(40));
        store.reset();

        assert_eq!(store.take_restart(), Some(RestartReason::Reset));
        assert_eq!(store.count(), Some(0));
    }
}
