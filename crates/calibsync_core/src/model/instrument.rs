//! Instrument domain model.
//!
//! # Responsibility
//! - Define the canonical instrument record mirrored from the list service.
//! - Describe the tracked fields compared by the diff engine.
//!
//! # Invariants
//! - `external_id` and `tag` are never empty.
//! - `revision` starts at 1 for stored rows and only grows.
//! - `status_override` is set only by manual status edits and cleared whenever
//!   a remote status is applied.

use crate::model::calibration::CalibrationEvidence;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Local, store-assigned identifier of an instrument row.
pub type InstrumentId = Uuid;

/// Stable key of an instrument in the remote list service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    /// Builds an external id from trimmed input.
    pub fn parse(value: &str) -> Result<Self, InstrumentValidationError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(InstrumentValidationError::EmptyExternalId);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ExternalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of an instrument.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentStatus {
    /// In service and subject to calibration tracking.
    Active,
    /// Temporarily out of service.
    InMaintenance,
    /// Soft-deleted; history is kept.
    Retired,
}

impl InstrumentStatus {
    pub const ALL: [Self; 3] = [Self::Active, Self::InMaintenance, Self::Retired];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::InMaintenance => "in_maintenance",
            Self::Retired => "retired",
        }
    }

    /// Parses the canonical storage spelling.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "in_maintenance" => Some(Self::InMaintenance),
            "retired" => Some(Self::Retired),
            _ => None,
        }
    }
}

impl Display for InstrumentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields compared between remote and local records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedField {
    Tag,
    Category,
    Location,
    Owner,
    DueDate,
    Status,
}

impl TrackedField {
    pub const ALL: [Self; 6] = [
        Self::Tag,
        Self::Category,
        Self::Location,
        Self::Owner,
        Self::DueDate,
        Self::Status,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tag => "tag",
            Self::Category => "category",
            Self::Location => "location",
            Self::Owner => "owner",
            Self::DueDate => "due_date",
            Self::Status => "status",
        }
    }
}

/// Validation errors for instrument records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrumentValidationError {
    EmptyExternalId,
    EmptyTag,
    InvalidRevision(i64),
}

impl Display for InstrumentValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyExternalId => write!(f, "external id must not be empty"),
            Self::EmptyTag => write!(f, "tag must not be empty"),
            Self::InvalidRevision(value) => write!(f, "revision must be >= 0, got {value}"),
        }
    }
}

impl Error for InstrumentValidationError {}

/// Canonical instrument record.
///
/// Normalized remote records carry a freshly generated `uuid` and
/// `revision = 0`; the store assigns revision 1 on create and keeps the
/// `uuid` it was created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub uuid: InstrumentId,
    pub external_id: ExternalId,
    pub tag: String,
    pub category: Option<String>,
    pub location: Option<String>,
    pub owner: Option<String>,
    /// Current calibration due date.
    pub due_date: NaiveDate,
    pub status: InstrumentStatus,
    /// Set when the status was edited locally and must survive remote updates.
    pub status_override: bool,
    /// Remote last-modified time in epoch milliseconds, when known.
    pub remote_modified_at: Option<i64>,
    pub revision: i64,
    /// Latest calibration evidence: from the source for remote records, from
    /// the most recent calibration record for stored ones.
    pub last_calibration: Option<CalibrationEvidence>,
}

impl Instrument {
    /// Creates an active instrument with a generated local id.
    pub fn new(external_id: ExternalId, tag: impl Into<String>, due_date: NaiveDate) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            external_id,
            tag: tag.into(),
            category: None,
            location: None,
            owner: None,
            due_date,
            status: InstrumentStatus::Active,
            status_override: false,
            remote_modified_at: None,
            revision: 0,
            last_calibration: None,
        }
    }

    pub fn is_retired(&self) -> bool {
        self.status == InstrumentStatus::Retired
    }

    /// Checks record-level invariants before persistence.
    pub fn validate(&self) -> Result<(), InstrumentValidationError> {
        if self.external_id.as_str().trim().is_empty() {
            return Err(InstrumentValidationError::EmptyExternalId);
        }
        if self.tag.trim().is_empty() {
            return Err(InstrumentValidationError::EmptyTag);
        }
        if self.revision < 0 {
            return Err(InstrumentValidationError::InvalidRevision(self.revision));
        }
        Ok(())
    }

    /// Text rendering of one tracked field, used by audit entries.
    pub fn field_text(&self, field: TrackedField) -> Option<String> {
        match field {
            TrackedField::Tag => Some(self.tag.clone()),
            TrackedField::Category => self.category.clone(),
            TrackedField::Location => self.location.clone(),
            TrackedField::Owner => self.owner.clone(),
            TrackedField::DueDate => Some(self.due_date.to_string()),
            TrackedField::Status => Some(self.status.as_str().to_string()),
        }
    }
}

/// New value for one tracked field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldUpdate {
    Tag(String),
    Category(Option<String>),
    Location(Option<String>),
    Owner(Option<String>),
    DueDate(NaiveDate),
    Status(InstrumentStatus),
}

impl FieldUpdate {
    pub fn field(&self) -> TrackedField {
        match self {
            Self::Tag(_) => TrackedField::Tag,
            Self::Category(_) => TrackedField::Category,
            Self::Location(_) => TrackedField::Location,
            Self::Owner(_) => TrackedField::Owner,
            Self::DueDate(_) => TrackedField::DueDate,
            Self::Status(_) => TrackedField::Status,
        }
    }

    /// Writes the new value into `instrument`.
    pub fn apply_to(&self, instrument: &mut Instrument) {
        match self {
            Self::Tag(value) => instrument.tag = value.clone(),
            Self::Category(value) => instrument.category = value.clone(),
            Self::Location(value) => instrument.location = value.clone(),
            Self::Owner(value) => instrument.owner = value.clone(),
            Self::DueDate(value) => instrument.due_date = *value,
            Self::Status(value) => {
                instrument.status = *value;
                instrument.status_override = false;
            }
        }
    }
}
