//! Reconciliation store contracts and SQLite implementation.
//!
//! # Responsibility
//! - Own persisted instruments, calibration history, sync sessions and the
//!   audit trail.
//! - Keep SQL details behind the `ReconciliationStore`,
//!   `SessionRepository` and `LockRepository` contracts.
//!
//! # Invariants
//! - Every apply call runs in its own immediate transaction that either
//!   commits data change, revision bump and audit entry together, or rolls
//!   everything back.
//! - Constraint violations surface as `StoreError::Constraint`, never as raw
//!   transport errors.

use crate::db::migrations::latest_version;
use crate::db::DbError;
use crate::model::instrument::InstrumentValidationError;
use crate::model::session::SessionId;
use chrono::NaiveDate;
use rusqlite::{Connection, ErrorCode};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

mod audit;
mod codec;
pub mod instrument_repo;
pub mod lock_repo;
pub mod session_repo;

pub use instrument_repo::{ReconciliationStore, SqliteReconciliationStore};
pub use lock_repo::{LeaseHolder, LeaseOutcome, LockRepository};
pub use session_repo::SessionRepository;

const REQUIRED_TABLES: [&str; 5] = [
    "instruments",
    "calibration_records",
    "sync_sessions",
    "audit_entries",
    "session_lock",
];

pub type StoreResult<T> = Result<T, StoreError>;

/// Store-level failures.
#[derive(Debug)]
pub enum StoreError {
    Db(DbError),
    Validation(InstrumentValidationError),
    /// Target row does not exist.
    NotFound { entity: &'static str, id: Uuid },
    /// The row changed since the snapshot the operation was derived from.
    RevisionConflict {
        id: Uuid,
        expected: i64,
        actual: i64,
    },
    /// A schema constraint or trigger rejected the write.
    Constraint(String),
    /// The session is in a terminal state and cannot be written.
    SessionSealed(SessionId),
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    MissingRequiredTable(&'static str),
    /// Persisted data cannot be converted to a valid read model.
    InvalidData(String),
}

impl StoreError {
    /// Whether the failure concerns one record only, so the batch may go on.
    pub fn is_record_scoped(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::NotFound { .. }
                | Self::RevisionConflict { .. }
                | Self::Constraint(_)
        )
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::RevisionConflict {
                id,
                expected,
                actual,
            } => write!(
                f,
                "revision conflict on {id}: expected {expected}, found {actual}"
            ),
            Self::Constraint(message) => write!(f, "constraint violated: {message}"),
            Self::SessionSealed(id) => write!(f, "sync session is sealed: {id}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "reconciliation store requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "reconciliation store requires table `{table}`")
            }
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Validation(err) => Some(err),
            Self::NotFound { .. } => None,
            Self::RevisionConflict { .. } => None,
            Self::Constraint(_) => None,
            Self::SessionSealed(_) => None,
            Self::UninitializedConnection { .. } => None,
            Self::MissingRequiredTable(_) => None,
            Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        match value {
            DbError::Sqlite(err) => Self::from(err),
            other => Self::Db(other),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, message) = &value {
            if failure.code == ErrorCode::ConstraintViolation {
                return Self::Constraint(
                    message.clone().unwrap_or_else(|| failure.to_string()),
                );
            }
        }
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<InstrumentValidationError> for StoreError {
    fn from(value: InstrumentValidationError) -> Self {
        Self::Validation(value)
    }
}

/// Per-session context of an apply call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyContext {
    pub session_id: SessionId,
    /// Calibration date used when the source reports none.
    pub today: NaiveDate,
}

fn ensure_store_connection_ready(conn: &Connection) -> StoreResult<()> {
    let expected_version = latest_version();
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if actual_version != expected_version {
        return Err(StoreError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    for table in REQUIRED_TABLES {
        if !table_exists(conn, table)? {
            return Err(StoreError::MissingRequiredTable(table));
        }
    }
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> StoreResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}
