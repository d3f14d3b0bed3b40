//! Audit trail model.
//!
//! Every applied change (sync or manual) produces exactly one entry, written
//! in the same transaction as the data change.

use crate::model::instrument::{ExternalId, InstrumentId, TrackedField};
use crate::model::session::SessionId;
use serde::{Deserialize, Serialize};

/// Kind of change an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Create,
    Update,
    SoftDelete,
    ManualStatus,
}

impl AuditOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::SoftDelete => "soft_delete",
            Self::ManualStatus => "manual_status",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "soft_delete" => Some(Self::SoftDelete),
            "manual_status" => Some(Self::ManualStatus),
            _ => None,
        }
    }
}

/// Before/after values of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: TrackedField,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// Audit entry prior to persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAuditEntry {
    /// `None` for manual edits made outside a sync session.
    pub session_id: Option<SessionId>,
    pub instrument_uuid: InstrumentId,
    pub external_id: ExternalId,
    pub operation: AuditOperation,
    /// Instrument revision after the change.
    pub revision: i64,
    pub changes: Vec<FieldChange>,
}

/// Persisted audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub audit_id: i64,
    pub session_id: Option<SessionId>,
    pub instrument_uuid: InstrumentId,
    pub external_id: ExternalId,
    pub operation: AuditOperation,
    pub revision: i64,
    pub changes: Vec<FieldChange>,
    pub recorded_at: i64,
}
