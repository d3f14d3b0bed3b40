//! Sync session persistence.
//!
//! # Invariants
//! - A session row is inserted once, updated while in flight, and becomes
//!   read-only as soon as a terminal status is written.
//! - Listing order is newest first.

use super::codec::parse_uuid;
use super::instrument_repo::SqliteReconciliationStore;
use super::{StoreError, StoreResult};
use crate::model::session::{
    SessionCounts, SessionError, SessionErrorKind, SessionId, SessionStatus, SyncSession,
};
use log::warn;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};

const SESSION_SELECT_SQL: &str = "SELECT
    session_uuid,
    status,
    started_at,
    finished_at,
    since_ms,
    fetch_complete,
    source_record_count,
    created_count,
    updated_count,
    deleted_count,
    unchanged_count,
    skipped_count,
    failed_count,
    deferred_delete_count,
    cancel_reason,
    errors_json
FROM sync_sessions";

const SESSIONS_LIMIT_MAX: u32 = 500;

/// Session bookkeeping contract.
pub trait SessionRepository {
    /// Inserts a freshly created session.
    fn begin_session(&self, session: &SyncSession) -> StoreResult<()>;
    /// Persists the current stage and counters of an in-flight session.
    fn save_session_progress(&self, session: &SyncSession) -> StoreResult<()>;
    /// Writes the terminal state; the row is immutable afterwards.
    fn seal_session(&self, session: &SyncSession) -> StoreResult<()>;
    fn get_session(&self, id: SessionId) -> StoreResult<Option<SyncSession>>;
    /// Most recent sessions first, at most `limit` (clamped to 500).
    fn list_sessions(&self, limit: u32) -> StoreResult<Vec<SyncSession>>;
    fn last_succeeded_session(&self) -> StoreResult<Option<SyncSession>>;
    /// Seals every non-terminal session as `failed` with an `abandoned`
    /// error. Only valid while holding the session lease.
    fn seal_abandoned_sessions(&self, finished_at: i64) -> StoreResult<Vec<SessionId>>;
}

impl SessionRepository for SqliteReconciliationStore<'_> {
    fn begin_session(&self, session: &SyncSession) -> StoreResult<()> {
        if session.is_sealed() {
            return Err(StoreError::SessionSealed(session.id));
        }
        self.conn.execute(
            "INSERT INTO sync_sessions (
                session_uuid,
                status,
                started_at,
                since_ms
            ) VALUES (?1, ?2, ?3, ?4);",
            params![
                session.id.to_string(),
                session.status.as_str(),
                session.started_at,
                session.since,
            ],
        )?;
        write_session(self.conn, session)
    }

    fn save_session_progress(&self, session: &SyncSession) -> StoreResult<()> {
        if session.is_sealed() {
            return Err(StoreError::InvalidData(format!(
                "progress write with terminal status {} for session {}",
                session.status, session.id
            )));
        }
        ensure_not_sealed(self.conn, session.id)?;
        write_session(self.conn, session)
    }

    fn seal_session(&self, session: &SyncSession) -> StoreResult<()> {
        if !session.is_sealed() {
            return Err(StoreError::InvalidData(format!(
                "cannot seal session {} with non-terminal status {}",
                session.id, session.status
            )));
        }
        ensure_not_sealed(self.conn, session.id)?;
        write_session(self.conn, session)
    }

    fn get_session(&self, id: SessionId) -> StoreResult<Option<SyncSession>> {
        let sql = format!("{SESSION_SELECT_SQL} WHERE session_uuid = ?1;");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_session_row(row)?)),
            None => Ok(None),
        }
    }

    fn list_sessions(&self, limit: u32) -> StoreResult<Vec<SyncSession>> {
        let sql = format!("{SESSION_SELECT_SQL} ORDER BY started_at DESC, rowid DESC LIMIT ?1;");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([i64::from(limit.min(SESSIONS_LIMIT_MAX))])?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next()? {
            sessions.push(parse_session_row(row)?);
        }
        Ok(sessions)
    }

    fn last_succeeded_session(&self) -> StoreResult<Option<SyncSession>> {
        let sql = format!(
            "{SESSION_SELECT_SQL}
             WHERE status = 'succeeded'
             ORDER BY started_at DESC, rowid DESC
             LIMIT 1;"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_session_row(row)?)),
            None => Ok(None),
        }
    }

    fn seal_abandoned_sessions(&self, finished_at: i64) -> StoreResult<Vec<SessionId>> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let abandoned = {
            let sql = format!(
                "{SESSION_SELECT_SQL}
                 WHERE status IN ('pending', 'fetching', 'diffing', 'applying')
                 ORDER BY started_at ASC, rowid ASC;"
            );
            let mut stmt = tx.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(parse_session_row(row)?);
            }
            sessions
        };

        let mut sealed = Vec::with_capacity(abandoned.len());
        for mut session in abandoned {
            let stage = session.status;
            session.record_error(
                SessionErrorKind::Abandoned,
                None,
                format!("session stopped during {stage} without being sealed"),
            );
            session.status = SessionStatus::Failed;
            session.finished_at = Some(finished_at);
            write_session(&tx, &session)?;
            warn!(
                "event=sync_session module=store status=abandoned session={} stage={stage}",
                session.id
            );
            sealed.push(session.id);
        }
        tx.commit()?;
        Ok(sealed)
    }
}

fn ensure_not_sealed(conn: &Connection, id: SessionId) -> StoreResult<()> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM sync_sessions WHERE session_uuid = ?1;",
            [id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    match status.as_deref().map(SessionStatus::parse) {
        None => Err(StoreError::NotFound {
            entity: "sync session",
            id,
        }),
        Some(Some(status)) if status.is_terminal() => Err(StoreError::SessionSealed(id)),
        Some(Some(_)) => Ok(()),
        Some(None) => Err(StoreError::InvalidData(format!(
            "invalid status in sync_sessions.status for {id}"
        ))),
    }
}

fn write_session(conn: &Connection, session: &SyncSession) -> StoreResult<()> {
    let errors_json = serde_json::to_string(&session.errors)
        .map_err(|err| StoreError::InvalidData(format!("cannot encode session errors: {err}")))?;
    let counts = &session.counts;
    conn.execute(
        "UPDATE sync_sessions
         SET status = ?2,
             finished_at = ?3,
             fetch_complete = ?4,
             source_record_count = ?5,
             created_count = ?6,
             updated_count = ?7,
             deleted_count = ?8,
             unchanged_count = ?9,
             skipped_count = ?10,
             failed_count = ?11,
             deferred_delete_count = ?12,
             cancel_reason = ?13,
             errors_json = ?14
         WHERE session_uuid = ?1;",
        params![
            session.id.to_string(),
            session.status.as_str(),
            session.finished_at,
            i64::from(session.fetch_complete),
            count_to_db(session.source_record_count),
            count_to_db(counts.created),
            count_to_db(counts.updated),
            count_to_db(counts.deleted),
            count_to_db(counts.unchanged),
            count_to_db(counts.skipped),
            count_to_db(counts.failed),
            count_to_db(counts.deferred_deletes),
            session.cancel_reason.as_deref(),
            errors_json,
        ],
    )?;
    Ok(())
}

fn count_to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn count_from_db(row: &Row<'_>, column: &'static str) -> StoreResult<u64> {
    let value: i64 = row.get(column)?;
    u64::try_from(value)
        .map_err(|_| StoreError::InvalidData(format!("negative value {value} in sync_sessions.{column}")))
}

fn parse_session_row(row: &Row<'_>) -> StoreResult<SyncSession> {
    let id_text: String = row.get("session_uuid")?;
    let status_text: String = row.get("status")?;
    let errors_text: String = row.get("errors_json")?;
    let fetch_complete: i64 = row.get("fetch_complete")?;

    let status = SessionStatus::parse(&status_text).ok_or_else(|| {
        StoreError::InvalidData(format!(
            "invalid status `{status_text}` in sync_sessions.status"
        ))
    })?;
    let errors: Vec<SessionError> = serde_json::from_str(&errors_text).map_err(|err| {
        StoreError::InvalidData(format!("invalid sync_sessions.errors_json: {err}"))
    })?;

    Ok(SyncSession {
        id: parse_uuid(&id_text, "sync_sessions.session_uuid")?,
        status,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        since: row.get("since_ms")?,
        fetch_complete: fetch_complete != 0,
        source_record_count: count_from_db(row, "source_record_count")?,
        counts: SessionCounts {
            created: count_from_db(row, "created_count")?,
            updated: count_from_db(row, "updated_count")?,
            deleted: count_from_db(row, "deleted_count")?,
            unchanged: count_from_db(row, "unchanged_count")?,
            skipped: count_from_db(row, "skipped_count")?,
            failed: count_from_db(row, "failed_count")?,
            deferred_deletes: count_from_db(row, "deferred_delete_count")?,
        },
        errors,
        cancel_reason: row.get("cancel_reason")?,
    })
}
