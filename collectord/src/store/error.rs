//! Store error taxonomy and the restart reasons it can produce.

use rusqlite::ErrorCode;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database malformed: {0}")]
    Malformed(String),

    #[error("table missing: {0}")]
    MissingTable(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("disk I/O error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, message) => match err.code {
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => Self::Malformed(e.to_string()),
                ErrorCode::OutOfMemory => Self::OutOfMemory,
                ErrorCode::SystemIoFailure | ErrorCode::CannotOpen => Self::Io(e.to_string()),
                _ if message
                    .as_deref()
                    .is_some_and(|m| m.starts_with("no such table")) =>
                {
                    Self::MissingTable(e.to_string())
                }
                _ => Self::Other(e.to_string()),
            },
            _ => Self::Other(e.to_string()),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Why the store asked for all in-memory state to be rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartReason {
    /// Malformed database, table recreated
    Malformed,
    /// Device table missing, table recreated
    MissingTable,
    /// I/O failure, database file moved aside
    Quarantined,
    /// Explicit reset requested
    Reset,
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Malformed => "malformed database",
            Self::MissingTable => "missing device table",
            Self::Quarantined => "database quarantined after I/O error",
            Self::Reset => "device table reset",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn failure(code: i32, message: &str) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(code), Some(message.to_string()))
    }

    #[test]
    fn test_classification() {
        assert!(matches!(
            StoreError::from(failure(ffi::SQLITE_CORRUPT, "database disk image is malformed")),
            StoreError::Malformed(_)
        ));
        assert!(matches!(
            StoreError::from(failure(ffi::SQLITE_NOTADB, "file is not a database")),
            StoreError::Malformed(_)
        ));
        assert!(matches!(
            StoreError::from(failure(ffi::SQLITE_NOMEM, "out of memory")),
            StoreError::OutOfMemory
        ));
        assert!(matches!(
            StoreError::from(failure(ffi::SQLITE_IOERR, "disk I/O error")),
            StoreError::Io(_)
        ));
        assert!(matches!(
            StoreError::from(failure(ffi::SQLITE_ERROR, "no such table: devices")),
            StoreError::MissingTable(_)
        ));
        assert!(matches!(
            StoreError::from(failure(ffi::SQLITE_CONSTRAINT, "UNIQUE constraint failed")),
            StoreError::Other(_)
        ));
    }
}
