//! Online backup of a live connection into a new database file.

use super::{DbError, DbResult};
use log::{error, info};
use rusqlite::{Connection, DatabaseName};
use std::path::Path;
use std::time::Instant;

/// Copies the `main` database of `conn` into a fresh file at `dest`.
///
/// Callers are responsible for excluding concurrent sync sessions; the
/// orchestrator runs this under its session lock.
///
/// # Errors
/// - `BackupTargetExists` when `dest` already exists.
/// - `Sqlite` when the backup API fails.
pub fn backup_database(conn: &Connection, dest: impl AsRef<Path>) -> DbResult<()> {
    let dest = dest.as_ref();
    if dest.exists() {
        return Err(DbError::BackupTargetExists(dest.to_path_buf()));
    }

    let started_at = Instant::now();
    info!("event=db_backup module=db status=start");
    match conn.backup(DatabaseName::Main, dest, None) {
        Ok(()) => {
            info!(
                "event=db_backup module=db status=ok duration_ms={}",
                started_at.elapsed().as_millis()
            );
            Ok(())
        }
        Err(err) => {
            error!(
                "event=db_backup module=db status=error duration_ms={} error={}",
                started_at.elapsed().as_millis(),
                err
            );
            Err(err.into())
        }
    }
}
