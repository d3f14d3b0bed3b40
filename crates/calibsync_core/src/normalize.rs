//! Raw record normalization.
//!
//! # Responsibility
//! - Map heterogeneous list-service records onto the canonical `Instrument`.
//! - Validate required fields and coerce dates, timestamps and enums.
//!
//! # Invariants
//! - Pure: no I/O, no logging, no shared state.
//! - Required fields are `external_id`, `tag` and a parseable `due_date`.
//! - Placeholder text (`""`, `"-"`) is treated as absent.

use crate::model::calibration::{CalibrationEvidence, CalibrationResult};
use crate::model::instrument::{ExternalId, Instrument, InstrumentStatus};
use crate::source::RawRecord;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid ws regex"));

const EXTERNAL_ID_KEYS: &[&str] = &["external_id", "id"];
const TAG_KEYS: &[&str] = &["tag", "name"];
const CATEGORY_KEYS: &[&str] = &["category", "type"];
const LOCATION_KEYS: &[&str] = &["location"];
const OWNER_KEYS: &[&str] = &["owner", "responsible"];
const DUE_DATE_KEYS: &[&str] = &["due_date", "next_calibration", "certif_end_date"];
const STATUS_KEYS: &[&str] = &["status", "sensor_status"];
const MODIFIED_AT_KEYS: &[&str] = &["modified_at", "modified"];
const LAST_CALIBRATION_KEYS: &[&str] = &["last_calibration", "calibrated_at"];
const CALIBRATION_RESULT_KEYS: &[&str] = &["calibration_result", "acceptance_status"];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d"];
const DATE_TIME_FORMATS: &[&str] = &[
    "%d/%m/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%d-%m-%Y %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

/// Record-scoped normalization failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizationError {
    MissingField(&'static str),
    EmptyExternalId,
    InvalidDate { field: &'static str, value: String },
    InvalidTimestamp(String),
    InvalidStatus(String),
    InvalidCalibrationResult(String),
    InvalidFieldType { field: &'static str, found: &'static str },
}

impl Display for NormalizationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "missing required field `{field}`"),
            Self::EmptyExternalId => write!(f, "external id is empty"),
            Self::InvalidDate { field, value } => {
                write!(f, "field `{field}` has unrecognized date `{value}`")
            }
            Self::InvalidTimestamp(value) => write!(f, "unrecognized timestamp `{value}`"),
            Self::InvalidStatus(value) => write!(f, "unknown instrument status `{value}`"),
            Self::InvalidCalibrationResult(value) => {
                write!(f, "unknown calibration result `{value}`")
            }
            Self::InvalidFieldType { field, found } => {
                write!(f, "field `{field}` has unsupported type {found}")
            }
        }
    }
}

impl Error for NormalizationError {}

/// Converts one raw record into a canonical instrument.
///
/// The returned instrument has a fresh local id and `revision = 0`; the store
/// assigns identity and revision on create.
pub fn normalize(raw: &RawRecord) -> Result<Instrument, NormalizationError> {
    let external_id = match raw.first_of(EXTERNAL_ID_KEYS) {
        None => return Err(NormalizationError::MissingField("external_id")),
        Some((_, value)) => text_value("external_id", value)?
            .and_then(|text| ExternalId::parse(&text).ok())
            .ok_or(NormalizationError::EmptyExternalId)?,
    };
    let tag = optional_text(raw, "tag", TAG_KEYS)?.ok_or(NormalizationError::MissingField("tag"))?;
    let due_text = optional_text(raw, "due_date", DUE_DATE_KEYS)?
        .ok_or(NormalizationError::MissingField("due_date"))?;
    let due_date = parse_date("due_date", &due_text)?;

    let mut instrument = Instrument::new(external_id, tag, due_date);
    instrument.category = optional_text(raw, "category", CATEGORY_KEYS)?;
    instrument.location = optional_text(raw, "location", LOCATION_KEYS)?;
    instrument.owner = optional_text(raw, "owner", OWNER_KEYS)?;
    instrument.status = match raw.first_of(STATUS_KEYS) {
        None => InstrumentStatus::Active,
        Some((_, value)) => parse_status(value)?,
    };
    instrument.remote_modified_at = match raw.first_of(MODIFIED_AT_KEYS) {
        None => None,
        Some((_, value)) => parse_timestamp(value)?,
    };
    instrument.last_calibration = calibration_evidence(raw)?;
    Ok(instrument)
}

/// Best-effort external id for attributing a rejected record.
pub fn peek_external_id(raw: &RawRecord) -> Option<String> {
    let (_, value) = raw.first_of(EXTERNAL_ID_KEYS)?;
    text_value("external_id", value).ok().flatten()
}

fn calibration_evidence(raw: &RawRecord) -> Result<Option<CalibrationEvidence>, NormalizationError> {
    let performed_on = match optional_text(raw, "last_calibration", LAST_CALIBRATION_KEYS)? {
        Some(text) => parse_date("last_calibration", &text)?,
        None => return Ok(None),
    };
    let result = optional_text(raw, "calibration_result", CALIBRATION_RESULT_KEYS)?
        .map(|text| parse_calibration_result(&text))
        .transpose()?;
    Ok(Some(CalibrationEvidence {
        performed_on,
        result,
    }))
}

fn optional_text(
    raw: &RawRecord,
    field: &'static str,
    keys: &[&str],
) -> Result<Option<String>, NormalizationError> {
    match raw.first_of(keys) {
        None => Ok(None),
        Some((_, value)) => text_value(field, value),
    }
}

fn text_value(field: &'static str, value: &Value) -> Result<Option<String>, NormalizationError> {
    match value {
        Value::Null => Ok(None),
        Value::String(text) => Ok(clean_text(text)),
        Value::Number(number) => Ok(Some(number.to_string())),
        Value::Bool(_) => Err(NormalizationError::InvalidFieldType {
            field,
            found: "boolean",
        }),
        Value::Array(_) => Err(NormalizationError::InvalidFieldType {
            field,
            found: "array",
        }),
        Value::Object(_) => Err(NormalizationError::InvalidFieldType {
            field,
            found: "object",
        }),
    }
}

fn clean_text(value: &str) -> Option<String> {
    let collapsed = WHITESPACE_RE.replace_all(value.trim(), " ");
    match collapsed.as_ref() {
        "" | "-" => None,
        text => Some(text.to_string()),
    }
}

fn parse_date(field: &'static str, value: &str) -> Result<NaiveDate, NormalizationError> {
    let trimmed = value.trim();
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Ok(date);
        }
    }
    for format in DATE_TIME_FORMATS {
        if let Ok(date_time) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(date_time.date());
        }
    }
    if let Ok(date_time) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(date_time.date_naive());
    }
    Err(NormalizationError::InvalidDate {
        field,
        value: trimmed.to_string(),
    })
}

fn parse_timestamp(value: &Value) -> Result<Option<i64>, NormalizationError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(number) => number
            .as_i64()
            .map(Some)
            .ok_or_else(|| NormalizationError::InvalidTimestamp(number.to_string())),
        Value::String(text) => {
            let Some(trimmed) = clean_text(text) else {
                return Ok(None);
            };
            if let Ok(date_time) = DateTime::parse_from_rfc3339(&trimmed) {
                return Ok(Some(date_time.timestamp_millis()));
            }
            for format in DATE_TIME_FORMATS {
                if let Ok(date_time) = NaiveDateTime::parse_from_str(&trimmed, format) {
                    return Ok(Some(date_time.and_utc().timestamp_millis()));
                }
            }
            trimmed
                .parse::<i64>()
                .map(Some)
                .map_err(|_| NormalizationError::InvalidTimestamp(trimmed))
        }
        other => Err(NormalizationError::InvalidTimestamp(other.to_string())),
    }
}

fn parse_status(value: &Value) -> Result<InstrumentStatus, NormalizationError> {
    let text = match value {
        Value::Number(number) => number.to_string(),
        Value::String(text) => match clean_text(text) {
            Some(text) => text,
            None => return Ok(InstrumentStatus::Active),
        },
        other => return Err(NormalizationError::InvalidStatus(other.to_string())),
    };
    let key = text.to_lowercase().replace(['-', ' '], "_");
    match key.as_str() {
        "active" | "ativo" | "1" => Ok(InstrumentStatus::Active),
        "in_maintenance" | "maintenance" | "manutencao" | "manutenção" | "em_manutencao"
        | "em_manutenção" | "blocked" | "bloqueado" | "0" => Ok(InstrumentStatus::InMaintenance),
        "retired" | "inactive" | "inativo" | "descartado" => Ok(InstrumentStatus::Retired),
        _ => Err(NormalizationError::InvalidStatus(text)),
    }
}

fn parse_calibration_result(value: &str) -> Result<CalibrationResult, NormalizationError> {
    let key = value.trim().to_lowercase().replace(['-', ' '], "_");
    match key.as_str() {
        "pass" | "passed" | "approved" | "aprovado" | "ok" => Ok(CalibrationResult::Pass),
        "fail" | "failed" | "rejected" | "reprovado" => Ok(CalibrationResult::Fail),
        "conditional" | "restricted" | "condicional" | "aprovado_com_restricao" => {
            Ok(CalibrationResult::Conditional)
        }
        _ => Err(NormalizationError::InvalidCalibrationResult(
            value.trim().to_string(),
        )),
    }
}
