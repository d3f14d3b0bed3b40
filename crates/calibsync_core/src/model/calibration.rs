//! Calibration history model.
//!
//! # Invariants
//! - Records are immutable once stored; history is append-only.
//! - `next_due` of an instrument's most recent record (highest `record_id`)
//!   equals the instrument's current `due_date`.

use crate::model::instrument::InstrumentId;
use crate::model::session::SessionId;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Outcome of one calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationResult {
    Pass,
    Fail,
    /// Accepted with restrictions.
    Conditional,
}

impl CalibrationResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Conditional => "conditional",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            "conditional" => Some(Self::Conditional),
            _ => None,
        }
    }
}

impl Display for CalibrationResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What is known about the latest calibration of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationEvidence {
    pub performed_on: NaiveDate,
    /// `None` when the source does not report a result.
    pub result: Option<CalibrationResult>,
}

/// One persisted calibration history row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub record_id: i64,
    pub instrument_uuid: InstrumentId,
    pub performed_on: NaiveDate,
    pub result: Option<CalibrationResult>,
    pub next_due: NaiveDate,
    /// Session that appended the record.
    pub session_id: Option<SessionId>,
    pub recorded_at: i64,
}
