//! Session state machine.
//!
//! `Pending -> Fetching -> Diffing -> Applying -> {Succeeded | Partial | Failed}`,
//! with a jump to `Failed` from any stage on a session-scoped error.
//!
//! # Invariants
//! - The session lock and the database lease are held from before the
//!   session row is created until after it is sealed.
//! - Sessions left unsealed by a dead process are sealed `Failed` before a
//!   new session starts.
//! - Nothing is written to instrument tables before `Applying`, so a session
//!   that fails earlier leaves the snapshot untouched.
//! - Soft deletes are applied only when every page of a full fetch arrived.
//! - Cancellation is observed between pages and between applies.
//! - A store failure after the first commit ends the session `Partial`;
//!   committed work is never reported as `Failed`.

use super::lock::{AcquireError, CancelToken, OperationGuard, SessionLock};
use super::retry::retry;
use super::{SyncError, SyncResult};
use crate::config::SyncConfig;
use crate::diff::{ChangeOp, ChangeSet, DiffEngine};
use crate::model::instrument::{ExternalId, Instrument, InstrumentStatus};
use crate::model::session::{SessionErrorKind, SessionStatus, SyncSession};
use crate::normalize::{normalize, peek_external_id};
use crate::repo::{
    ApplyContext, LockRepository, ReconciliationStore, SessionRepository, StoreError,
};
use crate::source::{FetchOptions, RawRecord, SourceConnector, SourceError};
use chrono::{Local, Utc};
use log::{error, info, warn};
use std::collections::HashSet;
use std::path::Path;
use std::time::Instant;

/// External ids listed in a "not applied" error before the list is cut.
const MAX_LISTED_NOT_APPLIED: usize = 20;

/// Session-scoped failure that ends the session as `Failed`.
struct Abort {
    kind: SessionErrorKind,
    message: String,
}

impl Abort {
    fn new(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<StoreError> for Abort {
    fn from(value: StoreError) -> Self {
        Self::new(SessionErrorKind::StoreUnavailable, value.to_string())
    }
}

/// Entry point for sync sessions and the commands that must not overlap
/// with them.
///
/// Callers in one process should share one orchestrator. Orchestrators in
/// other processes are kept out by the lease row in the database.
#[derive(Debug, Default)]
pub struct SyncOrchestrator {
    config: SyncConfig,
    lock: SessionLock,
}

impl SyncOrchestrator {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            lock: SessionLock::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Name of the operation holding this orchestrator's lock, if any.
    pub fn active_operation(&self) -> Option<&'static str> {
        self.lock.current_holder()
    }

    /// Runs one sync session and returns it sealed.
    ///
    /// # Errors
    /// - `SessionInProgress` when the lock or the lease is held; nothing is
    ///   recorded.
    /// - `StoreUnavailable` when the session row cannot be created or sealed.
    ///
    /// Every other failure is reported through the returned session's status
    /// and error list.
    pub fn run<S, C>(&self, store: &S, source: &C, cancel: &CancelToken) -> SyncResult<SyncSession>
    where
        S: ReconciliationStore + SessionRepository + LockRepository,
        C: SourceConnector,
    {
        let guard = self.acquire(store, "sync")?;
        let started_at = Instant::now();

        let abandoned = store
            .seal_abandoned_sessions(now_ms())
            .map_err(SyncError::StoreUnavailable)?;
        if !abandoned.is_empty() {
            warn!(
                "event=sync_session module=sync status=abandoned_sealed count={}",
                abandoned.len()
            );
        }

        let since = if self.config.incremental {
            store
                .last_succeeded_session()
                .map_err(SyncError::StoreUnavailable)?
                .map(|previous| previous.started_at)
        } else {
            None
        };
        let mut session = SyncSession::new(now_ms(), since);
        store
            .begin_session(&session)
            .map_err(SyncError::StoreUnavailable)?;
        info!(
            "event=sync_session module=sync status=start session={} source={} incremental={}",
            session.id,
            source.source_id(),
            since.is_some()
        );

        if let Err(abort) = self.drive(store, source, cancel, &guard, &mut session) {
            if abort.kind.is_session_scoped() {
                error!(
                    "event=sync_session module=sync status=abort session={} stage={} kind={} error={}",
                    session.id,
                    session.status,
                    abort.kind.as_str(),
                    abort.message
                );
            } else {
                warn!(
                    "event=sync_session module=sync status=stopped session={} stage={} kind={} reason={}",
                    session.id,
                    session.status,
                    abort.kind.as_str(),
                    abort.message
                );
            }
            session.record_error(abort.kind, None, abort.message);
            session.status = SessionStatus::Failed;
        }

        session.finished_at = Some(now_ms());
        store
            .seal_session(&session)
            .map_err(SyncError::StoreUnavailable)?;

        let counts = session.counts;
        info!(
            "event=sync_session module=sync status={} session={} source_records={} created={} updated={} deleted={} unchanged={} skipped={} failed={} deferred_deletes={} duration_ms={}",
            session.status,
            session.id,
            session.source_record_count,
            counts.created,
            counts.updated,
            counts.deleted,
            counts.unchanged,
            counts.skipped,
            counts.failed,
            counts.deferred_deletes,
            started_at.elapsed().as_millis()
        );
        Ok(session)
    }

    /// Sets a manual status on the live instrument with `external_id`.
    ///
    /// The status is flagged as a local override; under
    /// `ProtectManualMaintenance` a manual `in_maintenance` survives remote
    /// `active` values.
    pub fn set_manual_status<S>(
        &self,
        store: &S,
        external_id: &ExternalId,
        status: InstrumentStatus,
    ) -> SyncResult<Instrument>
    where
        S: ReconciliationStore + LockRepository,
    {
        let _guard = self.acquire(store, "set_manual_status")?;
        let instrument = store
            .find_live_instrument(external_id)
            .map_err(SyncError::from_store)?
            .ok_or_else(|| SyncError::UnknownInstrument(external_id.clone()))?;
        store
            .set_manual_status(instrument.uuid, status)
            .map_err(SyncError::from_store)?;
        info!(
            "event=manual_status module=sync status=ok external_id={external_id} new_status={status}"
        );
        store
            .get_instrument(instrument.uuid)
            .map_err(SyncError::from_store)?
            .ok_or(SyncError::UnknownInstrument(external_id.clone()))
    }

    /// Writes an online backup while no session is running.
    pub fn run_backup<S>(&self, store: &S, dest: &Path) -> SyncResult<()>
    where
        S: ReconciliationStore + LockRepository,
    {
        let _guard = self.acquire(store, "backup")?;
        store.backup_to(dest).map_err(SyncError::from_store)
    }

    fn acquire<'a, S>(
        &'a self,
        store: &'a S,
        operation: &'static str,
    ) -> SyncResult<OperationGuard<'a, S>>
    where
        S: LockRepository,
    {
        OperationGuard::acquire(&self.lock, store, operation, self.config.lock_stale_after())
            .map_err(|err| match err {
                AcquireError::Held(holder) => {
                    warn!(
                        "event=session_lock module=sync status=rejected operation={operation} holder={holder}"
                    );
                    SyncError::SessionInProgress { holder }
                }
                AcquireError::Store(err) => SyncError::StoreUnavailable(err),
            })
    }

    fn drive<S, C>(
        &self,
        store: &S,
        source: &C,
        cancel: &CancelToken,
        guard: &OperationGuard<'_, S>,
        session: &mut SyncSession,
    ) -> Result<(), Abort>
    where
        S: ReconciliationStore + SessionRepository + LockRepository,
        C: SourceConnector,
    {
        advance(store, guard, session, SessionStatus::Fetching)?;
        let raw_records = self.fetch_records(source, cancel, guard, session)?;
        let (remote, rejected) = normalize_batch(&raw_records, session);

        advance(store, guard, session, SessionStatus::Diffing)?;
        let local = store.snapshot()?;
        let mut change_set = DiffEngine::new(self.config.status_conflict).diff(&remote, &local);
        let deferred = if session.fetch_complete {
            change_set.defer_deletions_of(&rejected)
        } else {
            change_set.defer_deletions()
        };
        session.counts.deferred_deletes = count(deferred);
        session.counts.unchanged = count(change_set.no_ops());
        for external_id in &change_set.protected_overrides {
            info!(
                "event=status_override module=sync status=kept session={} external_id={external_id}",
                session.id
            );
        }

        advance(store, guard, session, SessionStatus::Applying)?;
        apply_change_set(store, &change_set, cancel, guard, session)
    }

    fn fetch_records<S, C>(
        &self,
        source: &C,
        cancel: &CancelToken,
        guard: &OperationGuard<'_, S>,
        session: &mut SyncSession,
    ) -> Result<Vec<RawRecord>, Abort>
    where
        S: LockRepository,
        C: SourceConnector,
    {
        let options = FetchOptions {
            since: session.since,
            page_size: self.config.page_size,
            timeout: self.config.page_timeout(),
        };
        let mut pages = source.fetch_all(options);
        let mut records = Vec::new();
        loop {
            if cancel.is_cancelled() {
                let reason = cancellation_reason(cancel);
                session.cancel_reason = Some(reason.clone());
                return Err(Abort::new(
                    SessionErrorKind::Cancelled,
                    format!("cancelled while fetching: {reason}"),
                ));
            }

            let page_number = pages.pages_fetched() + 1;
            let fetched = retry(
                "fetch_page",
                &self.config.retry,
                SourceError::is_retryable,
                || pages.next_page(),
            );
            match fetched {
                Ok(Some(page)) => {
                    records.extend(page.records);
                    keep_lease(guard)?;
                }
                Ok(None) => break,
                Err(exhausted) => {
                    let kind = if exhausted.last_error.is_retryable() {
                        SessionErrorKind::SourceUnavailable
                    } else {
                        SessionErrorKind::SourceMalformed
                    };
                    return Err(Abort::new(
                        kind,
                        format!(
                            "page {page_number} failed after {} attempt(s): {}",
                            exhausted.attempts, exhausted.last_error
                        ),
                    ));
                }
            }
        }

        session.source_record_count = count(records.len());
        session.fetch_complete = session.since.is_none();
        Ok(records)
    }
}

/// Normalizes every record, skipping invalid ones and later duplicates.
///
/// Returns the accepted instruments and the external ids of rejected
/// records, which must not be treated as missing remotely.
fn normalize_batch(
    raw_records: &[RawRecord],
    session: &mut SyncSession,
) -> (Vec<Instrument>, HashSet<String>) {
    let mut accepted = Vec::with_capacity(raw_records.len());
    let mut seen: HashSet<ExternalId> = HashSet::with_capacity(raw_records.len());
    let mut rejected = HashSet::new();

    for raw in raw_records {
        match normalize(raw) {
            Ok(instrument) => {
                if seen.insert(instrument.external_id.clone()) {
                    accepted.push(instrument);
                } else {
                    session.counts.skipped += 1;
                    session.record_error(
                        SessionErrorKind::DuplicateRecord,
                        Some(instrument.external_id.as_str()),
                        "duplicate external id in remote batch; first record kept",
                    );
                }
            }
            Err(err) => {
                let external_id = peek_external_id(raw);
                session.counts.skipped += 1;
                session.record_error(
                    SessionErrorKind::Normalization,
                    external_id.as_deref(),
                    err.to_string(),
                );
                if let Some(external_id) = external_id {
                    rejected.insert(external_id);
                }
            }
        }
    }
    if session.counts.skipped > 0 {
        warn!(
            "event=normalize module=sync status=skipped session={} skipped={}",
            session.id, session.counts.skipped
        );
    }
    (accepted, rejected)
}

/// Applies every mutating operation in its own transaction and sets the
/// terminal status.
fn apply_change_set<S>(
    store: &S,
    change_set: &ChangeSet,
    cancel: &CancelToken,
    guard: &OperationGuard<'_, S>,
    session: &mut SyncSession,
) -> Result<(), Abort>
where
    S: ReconciliationStore + LockRepository,
{
    let context = ApplyContext {
        session_id: session.id,
        today: Local::now().date_naive(),
    };
    let pending: Vec<&ChangeOp> = change_set
        .ops
        .iter()
        .filter(|op| !matches!(op, ChangeOp::NoOp { .. }))
        .collect();

    for (index, op) in pending.iter().enumerate() {
        if cancel.is_cancelled() {
            let reason = cancellation_reason(cancel);
            session.record_error(
                SessionErrorKind::Cancelled,
                None,
                format!(
                    "cancelled with {} operation(s) not applied: {reason}",
                    pending.len() - index
                ),
            );
            session.cancel_reason = Some(reason);
            session.status = if session.counts.committed() > 0 {
                SessionStatus::Partial
            } else {
                SessionStatus::Failed
            };
            return Ok(());
        }
        if let Err(abort) = keep_lease(guard) {
            return stop_after_fatal(session, abort, None, &pending[index..]);
        }

        let outcome = match op {
            ChangeOp::Create(instrument) => store.apply_create(instrument, &context).map(|_| ()),
            ChangeOp::Update(update) => store.apply_update(update, &context).map(|_| ()),
            ChangeOp::SoftDelete {
                uuid,
                expected_revision,
                ..
            } => store
                .apply_soft_delete(*uuid, *expected_revision, &context)
                .map(|_| ()),
            ChangeOp::NoOp { .. } => Ok(()),
        };

        match outcome {
            Ok(()) => match op {
                ChangeOp::Create(_) => session.counts.created += 1,
                ChangeOp::Update(_) => session.counts.updated += 1,
                ChangeOp::SoftDelete { .. } => session.counts.deleted += 1,
                ChangeOp::NoOp { .. } => {}
            },
            Err(err) if err.is_record_scoped() => {
                warn!(
                    "event=sync_apply module=sync status=error session={} operation={} external_id={} error={err}",
                    session.id,
                    op.kind(),
                    op.external_id()
                );
                session.counts.failed += 1;
                session.record_error(
                    SessionErrorKind::ApplyConflict,
                    Some(op.external_id().as_str()),
                    format!("{} failed: {err}", op.kind()),
                );
            }
            Err(err) => {
                return stop_after_fatal(session, err.into(), Some(*op), &pending[index..]);
            }
        }
    }

    session.status = match (session.counts.failed, session.counts.committed()) {
        (0, _) => SessionStatus::Succeeded,
        (_, 0) => SessionStatus::Failed,
        _ => SessionStatus::Partial,
    };
    Ok(())
}

/// Ends the apply phase after a store failure.
///
/// With nothing committed the failure aborts the session. Otherwise the
/// session ends `Partial` with one error naming the operations that were
/// not applied, `failed_op` first.
fn stop_after_fatal(
    session: &mut SyncSession,
    abort: Abort,
    failed_op: Option<&ChangeOp>,
    not_applied: &[&ChangeOp],
) -> Result<(), Abort> {
    if session.counts.committed() == 0 {
        return Err(abort);
    }

    let mut names = not_applied
        .iter()
        .take(MAX_LISTED_NOT_APPLIED)
        .map(|op| op.external_id().as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let hidden = not_applied.len().saturating_sub(MAX_LISTED_NOT_APPLIED);
    if hidden > 0 {
        names.push_str(&format!(" and {hidden} more"));
    }
    error!(
        "event=sync_apply module=sync status=stopped session={} kind={} committed={} not_applied={} error={}",
        session.id,
        abort.kind.as_str(),
        session.counts.committed(),
        not_applied.len(),
        abort.message
    );
    session.record_error(
        abort.kind,
        failed_op.map(|op| op.external_id().as_str()),
        format!(
            "{}; {} operation(s) not applied: {}",
            abort.message,
            not_applied.len(),
            names
        ),
    );
    session.status = SessionStatus::Partial;
    Ok(())
}

fn advance<S>(
    store: &S,
    guard: &OperationGuard<'_, S>,
    session: &mut SyncSession,
    status: SessionStatus,
) -> Result<(), Abort>
where
    S: SessionRepository + LockRepository,
{
    keep_lease(guard)?;
    session.status = status;
    store.save_session_progress(session)?;
    Ok(())
}

fn keep_lease<S: LockRepository>(guard: &OperationGuard<'_, S>) -> Result<(), Abort> {
    if guard.heartbeat()? {
        Ok(())
    } else {
        Err(Abort::new(
            SessionErrorKind::StoreUnavailable,
            "session lease was taken over by another process",
        ))
    }
}

fn cancellation_reason(cancel: &CancelToken) -> String {
    cancel
        .reason()
        .unwrap_or_else(|| "cancellation requested".to_string())
}

fn count(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
