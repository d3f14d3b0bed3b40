//! SQLite storage bootstrap, schema migrations and online backup.
//!
//! # Responsibility
//! - Open and configure SQLite connections for the reconciliation store.
//! - Apply schema migrations in deterministic order.
//! - Copy a live database to a backup file.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - No instrument or session data is read/written before migrations succeed.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

mod backup;
pub mod migrations;
mod open;

pub use backup::backup_database;
pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
    /// Backups never overwrite an existing file.
    BackupTargetExists(PathBuf),
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "database schema version {db_version} is newer than supported {latest_supported}"
            ),
            Self::BackupTargetExists(path) => {
                write!(f, "backup target already exists: {}", path.display())
            }
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::UnsupportedSchemaVersion { .. } => None,
            Self::BackupTargetExists(_) => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
