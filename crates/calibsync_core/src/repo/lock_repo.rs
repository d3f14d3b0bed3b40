//! Cross-process session lease.
//!
//! # Invariants
//! - The `session_lock` table holds at most one row; its owner is the only
//!   caller allowed to run a session, manual edit or backup on this database.
//! - A lease may be taken over only when its process is gone or its
//!   heartbeat is older than the stale threshold.

use super::codec::parse_uuid;
use super::instrument_repo::SqliteReconciliationStore;
use super::StoreResult;
use log::warn;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use uuid::Uuid;

const LEASE_SELECT_SQL: &str = "SELECT
    owner_uuid,
    operation,
    pid,
    acquired_at,
    heartbeat_at
FROM session_lock
WHERE lock_id = 1;";

/// Current owner of the session lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseHolder {
    pub owner: Uuid,
    pub operation: String,
    pub pid: u32,
    /// Epoch milliseconds.
    pub acquired_at: i64,
    pub heartbeat_at: i64,
}

impl LeaseHolder {
    /// Whether the holder may be replaced at `now_ms`.
    pub fn is_stale(&self, now_ms: i64, stale_after_ms: i64) -> bool {
        !pid_is_alive(self.pid) || now_ms.saturating_sub(self.heartbeat_at) > stale_after_ms
    }
}

/// Result of a lease acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired,
    Held(LeaseHolder),
}

/// Lease bookkeeping shared by every process using one database.
pub trait LockRepository {
    /// Takes the lease for `owner` unless a live holder has it.
    fn try_acquire_lease(
        &self,
        owner: Uuid,
        operation: &str,
        now_ms: i64,
        stale_after_ms: i64,
    ) -> StoreResult<LeaseOutcome>;
    /// Moves the heartbeat forward; `false` when `owner` lost the lease.
    fn refresh_lease(&self, owner: Uuid, now_ms: i64) -> StoreResult<bool>;
    /// Drops the lease if `owner` still holds it.
    fn release_lease(&self, owner: Uuid) -> StoreResult<()>;
    fn current_lease(&self) -> StoreResult<Option<LeaseHolder>>;
}

impl LockRepository for SqliteReconciliationStore<'_> {
    fn try_acquire_lease(
        &self,
        owner: Uuid,
        operation: &str,
        now_ms: i64,
        stale_after_ms: i64,
    ) -> StoreResult<LeaseOutcome> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        if let Some(holder) = load_lease(&tx)? {
            if !holder.is_stale(now_ms, stale_after_ms) {
                return Ok(LeaseOutcome::Held(holder));
            }
            warn!(
                "event=session_lease module=store status=takeover stale_owner={} stale_operation={} stale_pid={} heartbeat_at={}",
                holder.owner, holder.operation, holder.pid, holder.heartbeat_at
            );
        }

        tx.execute(
            "INSERT OR REPLACE INTO session_lock (
                lock_id,
                owner_uuid,
                operation,
                pid,
                acquired_at,
                heartbeat_at
            ) VALUES (1, ?1, ?2, ?3, ?4, ?4);",
            params![
                owner.to_string(),
                operation,
                i64::from(std::process::id()),
                now_ms
            ],
        )?;
        tx.commit()?;
        Ok(LeaseOutcome::Acquired)
    }

    fn refresh_lease(&self, owner: Uuid, now_ms: i64) -> StoreResult<bool> {
        let changed = self.conn.execute(
            "UPDATE session_lock
             SET heartbeat_at = ?2
             WHERE lock_id = 1 AND owner_uuid = ?1;",
            params![owner.to_string(), now_ms],
        )?;
        Ok(changed == 1)
    }

    fn release_lease(&self, owner: Uuid) -> StoreResult<()> {
        self.conn.execute(
            "DELETE FROM session_lock WHERE lock_id = 1 AND owner_uuid = ?1;",
            [owner.to_string()],
        )?;
        Ok(())
    }

    fn current_lease(&self) -> StoreResult<Option<LeaseHolder>> {
        load_lease(self.conn)
    }
}

fn load_lease(conn: &Connection) -> StoreResult<Option<LeaseHolder>> {
    let Some((owner, operation, pid, acquired_at, heartbeat_at)) = conn
        .query_row(LEASE_SELECT_SQL, [], read_lease_columns)
        .optional()?
    else {
        return Ok(None);
    };
    Ok(Some(LeaseHolder {
        owner: parse_uuid(&owner, "session_lock.owner_uuid")?,
        operation,
        pid: u32::try_from(pid).unwrap_or(0),
        acquired_at,
        heartbeat_at,
    }))
}

type LeaseColumns = (String, String, i64, i64, i64);

fn read_lease_columns(row: &Row<'_>) -> rusqlite::Result<LeaseColumns> {
    Ok((
        row.get("owner_uuid")?,
        row.get("operation")?,
        row.get("pid")?,
        row.get("acquired_at")?,
        row.get("heartbeat_at")?,
    ))
}

#[cfg(target_os = "linux")]
fn pid_is_alive(pid: u32) -> bool {
    pid != 0 && std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_is_alive(pid: u32) -> bool {
    pid != 0
}
