//! Row <-> model conversions shared by the SQLite repositories.

use super::{StoreError, StoreResult};
use crate::model::calibration::{CalibrationEvidence, CalibrationResult};
use crate::model::instrument::{ExternalId, Instrument, InstrumentStatus};
use chrono::NaiveDate;
use rusqlite::Row;
use uuid::Uuid;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Instrument columns plus the latest calibration record, if any.
pub(super) const INSTRUMENT_SELECT_SQL: &str = "SELECT
    i.instrument_uuid,
    i.external_id,
    i.tag,
    i.category,
    i.location,
    i.owner,
    i.due_date,
    i.status,
    i.status_override,
    i.remote_modified_at,
    i.revision,
    c.performed_on AS last_performed_on,
    c.result AS last_result
FROM instruments i
LEFT JOIN calibration_records c
    ON c.record_id = (
        SELECT MAX(record_id)
        FROM calibration_records
        WHERE instrument_uuid = i.instrument_uuid
    )";

pub(super) fn date_to_db(value: NaiveDate) -> String {
    value.format(DATE_FORMAT).to_string()
}

pub(super) fn parse_date(value: &str, column: &'static str) -> StoreResult<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|_| StoreError::InvalidData(format!("invalid date `{value}` in {column}")))
}

pub(super) fn parse_uuid(value: &str, column: &'static str) -> StoreResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| StoreError::InvalidData(format!("invalid uuid `{value}` in {column}")))
}

pub(super) fn parse_status(value: &str) -> StoreResult<InstrumentStatus> {
    InstrumentStatus::parse(value).ok_or_else(|| {
        StoreError::InvalidData(format!("invalid status `{value}` in instruments.status"))
    })
}

pub(super) fn parse_result(
    value: Option<String>,
    column: &'static str,
) -> StoreResult<Option<CalibrationResult>> {
    value
        .map(|text| {
            CalibrationResult::parse(&text).ok_or_else(|| {
                StoreError::InvalidData(format!("invalid calibration result `{text}` in {column}"))
            })
        })
        .transpose()
}

pub(super) fn bool_to_int(value: bool) -> i64 {
    i64::from(value)
}

pub(super) fn parse_instrument_row(row: &Row<'_>) -> StoreResult<Instrument> {
    let uuid_text: String = row.get("instrument_uuid")?;
    let external_id_text: String = row.get("external_id")?;
    let external_id = ExternalId::parse(&external_id_text).map_err(|_| {
        StoreError::InvalidData("empty value in instruments.external_id".to_string())
    })?;
    let due_text: String = row.get("due_date")?;
    let status_text: String = row.get("status")?;
    let override_flag: i64 = row.get("status_override")?;

    let last_performed_on: Option<String> = row.get("last_performed_on")?;
    let last_calibration = match last_performed_on {
        Some(text) => Some(CalibrationEvidence {
            performed_on: parse_date(&text, "calibration_records.performed_on")?,
            result: parse_result(row.get("last_result")?, "calibration_records.result")?,
        }),
        None => None,
    };

    Ok(Instrument {
        uuid: parse_uuid(&uuid_text, "instruments.instrument_uuid")?,
        external_id,
        tag: row.get("tag")?,
        category: row.get("category")?,
        location: row.get("location")?,
        owner: row.get("owner")?,
        due_date: parse_date(&due_text, "instruments.due_date")?,
        status: parse_status(&status_text)?,
        status_override: override_flag != 0,
        remote_modified_at: row.get("remote_modified_at")?,
        revision: row.get("revision")?,
        last_calibration,
    })
}
