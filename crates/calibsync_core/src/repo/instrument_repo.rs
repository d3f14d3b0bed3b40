//! Instrument, calibration history and audit persistence.
//!
//! # Responsibility
//! - Serve the reconciliation snapshot and history read models.
//! - Apply one change per transaction with optimistic revision checks.
//!
//! # Invariants
//! - Successful writes bump `revision` by exactly one and append exactly one
//!   audit entry in the same transaction.
//! - Whenever a due date is set (create or change) a calibration record with
//!   `next_due = due_date` is appended, so the latest record always matches
//!   the instrument.

use super::audit::{list_audit_entries, record_audit};
use super::codec::{
    bool_to_int, date_to_db, parse_date, parse_instrument_row, parse_result, parse_uuid,
    INSTRUMENT_SELECT_SQL,
};
use super::{ensure_store_connection_ready, ApplyContext, StoreError, StoreResult};
use crate::db::backup_database;
use crate::diff::InstrumentUpdate;
use crate::model::audit::{AuditEntry, AuditOperation, FieldChange, NewAuditEntry};
use crate::model::calibration::{CalibrationEvidence, CalibrationRecord};
use crate::model::instrument::{
    ExternalId, Instrument, InstrumentId, InstrumentStatus, TrackedField,
};
use crate::model::session::SessionId;
use log::debug;
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use std::path::Path;

/// Durable store contract used by the orchestrator and read-only callers.
pub trait ReconciliationStore {
    /// All instruments, retired ones included, ordered by external id.
    fn snapshot(&self) -> StoreResult<Vec<Instrument>>;
    fn get_instrument(&self, id: InstrumentId) -> StoreResult<Option<Instrument>>;
    /// The non-retired instrument with `external_id`, if any.
    fn find_live_instrument(&self, external_id: &ExternalId) -> StoreResult<Option<Instrument>>;
    /// Calibration records of one instrument, oldest first.
    fn calibration_history(&self, id: InstrumentId) -> StoreResult<Vec<CalibrationRecord>>;
    /// Inserts a new instrument at revision 1 and returns the stored row.
    fn apply_create(&self, instrument: &Instrument, context: &ApplyContext)
        -> StoreResult<Instrument>;
    /// Applies a field diff and returns the new revision.
    fn apply_update(&self, update: &InstrumentUpdate, context: &ApplyContext) -> StoreResult<i64>;
    /// Retires an instrument and returns the new revision.
    fn apply_soft_delete(
        &self,
        id: InstrumentId,
        expected_revision: i64,
        context: &ApplyContext,
    ) -> StoreResult<i64>;
    /// Sets a locally owned status and returns the new revision.
    fn set_manual_status(&self, id: InstrumentId, status: InstrumentStatus) -> StoreResult<i64>;
    /// Appends one audit entry in its own transaction.
    fn record_audit(&self, entry: &NewAuditEntry) -> StoreResult<i64>;
    fn audit_for_instrument(&self, id: InstrumentId) -> StoreResult<Vec<AuditEntry>>;
    fn audit_for_session(&self, id: SessionId) -> StoreResult<Vec<AuditEntry>>;
    /// Writes an online backup to a new file at `dest`.
    fn backup_to(&self, dest: &Path) -> StoreResult<()>;
}

/// SQLite-backed reconciliation store.
pub struct SqliteReconciliationStore<'conn> {
    pub(super) conn: &'conn Connection,
}

impl<'conn> SqliteReconciliationStore<'conn> {
    /// Constructs a store from a migrated connection.
    pub fn try_new(conn: &'conn Connection) -> StoreResult<Self> {
        ensure_store_connection_ready(conn)?;
        Ok(Self { conn })
    }
}

impl ReconciliationStore for SqliteReconciliationStore<'_> {
    fn snapshot(&self) -> StoreResult<Vec<Instrument>> {
        let sql = format!("{INSTRUMENT_SELECT_SQL} ORDER BY i.external_id ASC, i.created_at ASC;");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut instruments = Vec::new();
        while let Some(row) = rows.next()? {
            instruments.push(parse_instrument_row(row)?);
        }
        Ok(instruments)
    }

    fn get_instrument(&self, id: InstrumentId) -> StoreResult<Option<Instrument>> {
        load_instrument(self.conn, id)
    }

    fn find_live_instrument(&self, external_id: &ExternalId) -> StoreResult<Option<Instrument>> {
        let sql = format!(
            "{INSTRUMENT_SELECT_SQL} WHERE i.external_id = ?1 AND i.status <> 'retired';"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([external_id.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_instrument_row(row)?)),
            None => Ok(None),
        }
    }

    fn calibration_history(&self, id: InstrumentId) -> StoreResult<Vec<CalibrationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                record_id,
                instrument_uuid,
                performed_on,
                result,
                next_due,
                session_uuid,
                recorded_at
             FROM calibration_records
             WHERE instrument_uuid = ?1
             ORDER BY record_id ASC;",
        )?;
        let mut rows = stmt.query([id.to_string()])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let instrument_text: String = row.get("instrument_uuid")?;
            let performed_text: String = row.get("performed_on")?;
            let next_due_text: String = row.get("next_due")?;
            let session_text: Option<String> = row.get("session_uuid")?;
            records.push(CalibrationRecord {
                record_id: row.get("record_id")?,
                instrument_uuid: parse_uuid(&instrument_text, "calibration_records.instrument_uuid")?,
                performed_on: parse_date(&performed_text, "calibration_records.performed_on")?,
                result: parse_result(row.get("result")?, "calibration_records.result")?,
                next_due: parse_date(&next_due_text, "calibration_records.next_due")?,
                session_id: session_text
                    .map(|text| parse_uuid(&text, "calibration_records.session_uuid"))
                    .transpose()?,
                recorded_at: row.get("recorded_at")?,
            });
        }
        Ok(records)
    }

    fn apply_create(
        &self,
        instrument: &Instrument,
        context: &ApplyContext,
    ) -> StoreResult<Instrument> {
        instrument.validate()?;
        let mut stored = instrument.clone();
        stored.revision = 1;
        stored.status_override = false;

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO instruments (
                instrument_uuid,
                external_id,
                tag,
                category,
                location,
                owner,
                due_date,
                status,
                status_override,
                remote_modified_at,
                revision
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11);",
            params![
                stored.uuid.to_string(),
                stored.external_id.as_str(),
                stored.tag.as_str(),
                stored.category.as_deref(),
                stored.location.as_deref(),
                stored.owner.as_deref(),
                date_to_db(stored.due_date),
                stored.status.as_str(),
                bool_to_int(stored.status_override),
                stored.remote_modified_at,
                stored.revision,
            ],
        )?;
        stored.last_calibration = Some(append_calibration(
            &tx,
            &stored,
            instrument.last_calibration,
            context,
        )?);

        let changes = TrackedField::ALL
            .into_iter()
            .filter_map(|field| {
                stored.field_text(field).map(|after| FieldChange {
                    field,
                    before: None,
                    after: Some(after),
                })
            })
            .collect();
        record_audit(
            &tx,
            &NewAuditEntry {
                session_id: Some(context.session_id),
                instrument_uuid: stored.uuid,
                external_id: stored.external_id.clone(),
                operation: AuditOperation::Create,
                revision: stored.revision,
                changes,
            },
        )?;
        tx.commit()?;

        debug!(
            "event=store_apply module=store status=ok operation=create external_id={} revision={}",
            stored.external_id, stored.revision
        );
        Ok(stored)
    }

    fn apply_update(&self, update: &InstrumentUpdate, context: &ApplyContext) -> StoreResult<i64> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let mut current = load_for_write(&tx, update.uuid, update.expected_revision)?;

        let mut changes = Vec::with_capacity(update.changes.len());
        for change in &update.changes {
            let field = change.field();
            let before = current.field_text(field);
            change.apply_to(&mut current);
            changes.push(FieldChange {
                field,
                before,
                after: current.field_text(field),
            });
        }
        current.validate()?;
        if update.remote_modified_at.is_some() {
            current.remote_modified_at = update.remote_modified_at;
        }
        current.revision += 1;
        write_instrument(&tx, &current)?;

        if update.changes_due_date() {
            append_calibration(&tx, &current, update.calibration, context)?;
        }
        record_audit(
            &tx,
            &NewAuditEntry {
                session_id: Some(context.session_id),
                instrument_uuid: current.uuid,
                external_id: current.external_id.clone(),
                operation: AuditOperation::Update,
                revision: current.revision,
                changes,
            },
        )?;
        tx.commit()?;

        debug!(
            "event=store_apply module=store status=ok operation=update external_id={} revision={} fields={}",
            current.external_id,
            current.revision,
            update.changes.len()
        );
        Ok(current.revision)
    }

    fn apply_soft_delete(
        &self,
        id: InstrumentId,
        expected_revision: i64,
        context: &ApplyContext,
    ) -> StoreResult<i64> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let mut current = load_for_write(&tx, id, expected_revision)?;
        let before = current.field_text(TrackedField::Status);
        current.status = InstrumentStatus::Retired;
        current.status_override = false;
        current.revision += 1;
        write_instrument(&tx, &current)?;

        record_audit(
            &tx,
            &NewAuditEntry {
                session_id: Some(context.session_id),
                instrument_uuid: current.uuid,
                external_id: current.external_id.clone(),
                operation: AuditOperation::SoftDelete,
                revision: current.revision,
                changes: vec![FieldChange {
                    field: TrackedField::Status,
                    before,
                    after: current.field_text(TrackedField::Status),
                }],
            },
        )?;
        tx.commit()?;

        debug!(
            "event=store_apply module=store status=ok operation=soft_delete external_id={} revision={}",
            current.external_id, current.revision
        );
        Ok(current.revision)
    }

    fn set_manual_status(&self, id: InstrumentId, status: InstrumentStatus) -> StoreResult<i64> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let mut current = load_instrument(&tx, id)?.ok_or(StoreError::NotFound {
            entity: "instrument",
            id,
        })?;
        let before = current.field_text(TrackedField::Status);
        current.status = status;
        current.status_override = true;
        current.revision += 1;
        write_instrument(&tx, &current)?;

        record_audit(
            &tx,
            &NewAuditEntry {
                session_id: None,
                instrument_uuid: current.uuid,
                external_id: current.external_id.clone(),
                operation: AuditOperation::ManualStatus,
                revision: current.revision,
                changes: vec![FieldChange {
                    field: TrackedField::Status,
                    before,
                    after: current.field_text(TrackedField::Status),
                }],
            },
        )?;
        tx.commit()?;

        debug!(
            "event=store_apply module=store status=ok operation=manual_status external_id={} revision={}",
            current.external_id, current.revision
        );
        Ok(current.revision)
    }

    fn record_audit(&self, entry: &NewAuditEntry) -> StoreResult<i64> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let audit_id = record_audit(&tx, entry)?;
        tx.commit()?;
        Ok(audit_id)
    }

    fn audit_for_instrument(&self, id: InstrumentId) -> StoreResult<Vec<AuditEntry>> {
        list_audit_entries(self.conn, "instrument_uuid", &id.to_string())
    }

    fn audit_for_session(&self, id: SessionId) -> StoreResult<Vec<AuditEntry>> {
        list_audit_entries(self.conn, "session_uuid", &id.to_string())
    }

    fn backup_to(&self, dest: &Path) -> StoreResult<()> {
        backup_database(self.conn, dest)?;
        Ok(())
    }
}

fn load_instrument(conn: &Connection, id: InstrumentId) -> StoreResult<Option<Instrument>> {
    let sql = format!("{INSTRUMENT_SELECT_SQL} WHERE i.instrument_uuid = ?1;");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(parse_instrument_row(row)?)),
        None => Ok(None),
    }
}

/// Loads the row to mutate and enforces the optimistic revision check.
fn load_for_write(conn: &Connection, id: InstrumentId, expected_revision: i64) -> StoreResult<Instrument> {
    let current = load_instrument(conn, id)?.ok_or(StoreError::NotFound {
        entity: "instrument",
        id,
    })?;
    if current.revision != expected_revision {
        return Err(StoreError::RevisionConflict {
            id,
            expected: expected_revision,
            actual: current.revision,
        });
    }
    Ok(current)
}

fn write_instrument(conn: &Connection, instrument: &Instrument) -> StoreResult<()> {
    let changed = conn.execute(
        "UPDATE instruments
         SET tag = ?2,
             category = ?3,
             location = ?4,
             owner = ?5,
             due_date = ?6,
             status = ?7,
             status_override = ?8,
             remote_modified_at = ?9,
             revision = ?10,
             updated_at = (strftime('%s', 'now') * 1000)
         WHERE instrument_uuid = ?1;",
        params![
            instrument.uuid.to_string(),
            instrument.tag.as_str(),
            instrument.category.as_deref(),
            instrument.location.as_deref(),
            instrument.owner.as_deref(),
            date_to_db(instrument.due_date),
            instrument.status.as_str(),
            bool_to_int(instrument.status_override),
            instrument.remote_modified_at,
            instrument.revision,
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound {
            entity: "instrument",
            id: instrument.uuid,
        });
    }
    Ok(())
}

/// Appends the calibration record that makes `instrument.due_date` current.
///
/// Without source evidence the calibration is dated `context.today` with an
/// unknown result.
fn append_calibration(
    conn: &Connection,
    instrument: &Instrument,
    evidence: Option<CalibrationEvidence>,
    context: &ApplyContext,
) -> StoreResult<CalibrationEvidence> {
    let evidence = evidence.unwrap_or(CalibrationEvidence {
        performed_on: context.today,
        result: None,
    });
    conn.execute(
        "INSERT INTO calibration_records (
            instrument_uuid,
            performed_on,
            result,
            next_due,
            session_uuid
        ) VALUES (?1, ?2, ?3, ?4, ?5);",
        params![
            instrument.uuid.to_string(),
            date_to_db(evidence.performed_on),
            evidence.result.map(|result| result.as_str()),
            date_to_db(instrument.due_date),
            context.session_id.to_string(),
        ],
    )?;
    Ok(evidence)
}
