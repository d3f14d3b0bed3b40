//! Sync session orchestration.
//!
//! # Responsibility
//! - Drive one session end to end: fetch, normalize, diff, apply, seal.
//! - Serialize sessions, manual status edits and backups behind one lock,
//!   within a process and across processes sharing the database.
//!
//! # Invariants
//! - Invocation-level rejections are returned as `SyncError`; everything that
//!   happens inside a started session is recorded in the sealed session.

use crate::db::DbError;
use crate::model::instrument::ExternalId;
use crate::repo::StoreError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod lock;
mod orchestrator;
pub mod retry;

pub use lock::{AcquireError, CancelToken, OperationGuard, SessionLock};
pub use orchestrator::SyncOrchestrator;
pub use retry::RetryPolicy;

pub type SyncResult<T> = Result<T, SyncError>;

/// Rejections of an orchestrator invocation.
#[derive(Debug)]
pub enum SyncError {
    /// Another session, manual edit or backup holds the lock.
    SessionInProgress { holder: String },
    /// No live instrument carries the requested external id.
    UnknownInstrument(ExternalId),
    /// The store refused this one operation.
    Rejected(StoreError),
    /// The store could not be reached or is in an unusable state.
    StoreUnavailable(StoreError),
}

impl SyncError {
    pub(crate) fn from_store(err: StoreError) -> Self {
        if err.is_record_scoped() || matches!(err, StoreError::Db(DbError::BackupTargetExists(_))) {
            Self::Rejected(err)
        } else {
            Self::StoreUnavailable(err)
        }
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionInProgress { holder } => {
                write!(f, "another operation is in progress: {holder}")
            }
            Self::UnknownInstrument(id) => write!(f, "no live instrument with external id {id}"),
            Self::Rejected(err) => write!(f, "operation rejected: {err}"),
            Self::StoreUnavailable(err) => write!(f, "store unavailable: {err}"),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::SessionInProgress { .. } => None,
            Self::UnknownInstrument(_) => None,
            Self::Rejected(err) => Some(err),
            Self::StoreUnavailable(err) => Some(err),
        }
    }
}
