//! Append-only audit trail persistence.

use super::codec::parse_uuid;
use super::{StoreError, StoreResult};
use crate::model::audit::{AuditEntry, AuditOperation, FieldChange, NewAuditEntry};
use crate::model::instrument::ExternalId;
use rusqlite::{params, Connection, Row};

const AUDIT_SELECT_SQL: &str = "SELECT
    audit_id,
    session_uuid,
    instrument_uuid,
    external_id,
    operation,
    revision,
    changes_json,
    recorded_at
FROM audit_entries";

/// Inserts one audit entry on `conn`, which is normally an open transaction.
pub(super) fn record_audit(conn: &Connection, entry: &NewAuditEntry) -> StoreResult<i64> {
    let changes_json = serde_json::to_string(&entry.changes)
        .map_err(|err| StoreError::InvalidData(format!("cannot encode audit changes: {err}")))?;
    conn.execute(
        "INSERT INTO audit_entries (
            session_uuid,
            instrument_uuid,
            external_id,
            operation,
            revision,
            changes_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
        params![
            entry.session_id.map(|id| id.to_string()),
            entry.instrument_uuid.to_string(),
            entry.external_id.as_str(),
            entry.operation.as_str(),
            entry.revision,
            changes_json,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Lists entries matching `filter_column = value`, oldest first.
pub(super) fn list_audit_entries(
    conn: &Connection,
    filter_column: &'static str,
    value: &str,
) -> StoreResult<Vec<AuditEntry>> {
    let sql = format!("{AUDIT_SELECT_SQL} WHERE {filter_column} = ?1 ORDER BY audit_id ASC;");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([value])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        entries.push(parse_audit_row(row)?);
    }
    Ok(entries)
}

fn parse_audit_row(row: &Row<'_>) -> StoreResult<AuditEntry> {
    let session_text: Option<String> = row.get("session_uuid")?;
    let instrument_text: String = row.get("instrument_uuid")?;
    let external_id_text: String = row.get("external_id")?;
    let operation_text: String = row.get("operation")?;
    let changes_text: String = row.get("changes_json")?;

    let operation = AuditOperation::parse(&operation_text).ok_or_else(|| {
        StoreError::InvalidData(format!(
            "invalid operation `{operation_text}` in audit_entries.operation"
        ))
    })?;
    let changes: Vec<FieldChange> = serde_json::from_str(&changes_text).map_err(|err| {
        StoreError::InvalidData(format!("invalid audit_entries.changes_json: {err}"))
    })?;
    let external_id = ExternalId::parse(&external_id_text).map_err(|_| {
        StoreError::InvalidData("empty value in audit_entries.external_id".to_string())
    })?;

    Ok(AuditEntry {
        audit_id: row.get("audit_id")?,
        session_id: session_text
            .map(|text| parse_uuid(&text, "audit_entries.session_uuid"))
            .transpose()?,
        instrument_uuid: parse_uuid(&instrument_text, "audit_entries.instrument_uuid")?,
        external_id,
        operation,
        revision: row.get("revision")?,
        changes,
        recorded_at: row.get("recorded_at")?,
    })
}
