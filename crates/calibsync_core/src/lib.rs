//! Instrument calibration sync engine.
//! Mirrors a remote instrument list into a local SQLite store with audited,
//! per-instrument transactions.

pub mod config;
pub mod db;
pub mod diff;
pub mod logging;
pub mod model;
pub mod normalize;
pub mod repo;
pub mod source;
pub mod stats;
pub mod sync;

pub use config::{ConfigError, HttpSourceConfig, SyncConfig};
pub use db::{backup_database, open_db, open_db_in_memory, DbError, DbResult};
pub use diff::{ChangeOp, ChangeSet, DiffEngine, InstrumentUpdate, StatusConflictPolicy};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::audit::{AuditEntry, AuditOperation, FieldChange};
pub use model::calibration::{CalibrationEvidence, CalibrationRecord, CalibrationResult};
pub use model::instrument::{ExternalId, Instrument, InstrumentId, InstrumentStatus};
pub use model::session::{
    SessionCounts, SessionError, SessionErrorKind, SessionId, SessionStatus, SyncSession,
};
pub use normalize::{normalize, NormalizationError};
pub use repo::{
    ApplyContext, LeaseHolder, LeaseOutcome, LockRepository, ReconciliationStore,
    SessionRepository, SqliteReconciliationStore, StoreError, StoreResult,
};
pub use source::{
    HttpAuth, HttpListSource, HttpOptions, JsonFileSource, RawRecord, SourceConnector, SourceError,
    SourcePage,
};
pub use stats::{CategoryStats, Statistics, StatisticsEngine};
pub use sync::{CancelToken, RetryPolicy, SyncError, SyncOrchestrator, SyncResult};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
