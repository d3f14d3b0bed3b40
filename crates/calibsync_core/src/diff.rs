//! Remote/local comparison.
//!
//! # Responsibility
//! - Classify every normalized remote instrument against the local snapshot.
//! - Collect local instruments missing from the remote batch as soft-delete
//!   candidates.
//!
//! # Invariants
//! - Pure: the engine never touches the store.
//! - Update operations carry only the fields that differ.
//! - Operations follow remote order; soft-delete candidates come last,
//!   ordered by external id.
//! - Remote input is expected to be free of duplicate external ids.

use crate::model::calibration::CalibrationEvidence;
use crate::model::instrument::{
    ExternalId, FieldUpdate, Instrument, InstrumentId, InstrumentStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// How a manual maintenance status competes with remote status values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusConflictPolicy {
    /// Remote status always replaces the local one.
    RemoteWins,
    /// A manually set `in_maintenance` survives a remote `active`.
    #[default]
    ProtectManualMaintenance,
}

/// Field-level update of one stored instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentUpdate {
    pub uuid: InstrumentId,
    pub external_id: ExternalId,
    /// Revision observed in the snapshot; the store rejects the update if the
    /// row moved on.
    pub expected_revision: i64,
    pub changes: Vec<FieldUpdate>,
    /// Remote calibration evidence, used when the due date changes.
    pub calibration: Option<CalibrationEvidence>,
    pub remote_modified_at: Option<i64>,
}

impl InstrumentUpdate {
    pub fn changes_due_date(&self) -> bool {
        self.changes
            .iter()
            .any(|change| matches!(change, FieldUpdate::DueDate(_)))
    }
}

/// One per-instrument operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOp {
    Create(Instrument),
    Update(InstrumentUpdate),
    SoftDelete {
        uuid: InstrumentId,
        external_id: ExternalId,
        expected_revision: i64,
    },
    NoOp {
        external_id: ExternalId,
    },
}

impl ChangeOp {
    pub fn external_id(&self) -> &ExternalId {
        match self {
            Self::Create(instrument) => &instrument.external_id,
            Self::Update(update) => &update.external_id,
            Self::SoftDelete { external_id, .. } | Self::NoOp { external_id } => external_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Update(_) => "update",
            Self::SoftDelete { .. } => "soft_delete",
            Self::NoOp { .. } => "no_op",
        }
    }
}

/// Ordered operations for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub ops: Vec<ChangeOp>,
    /// Instruments whose remote status change was suppressed by the manual
    /// maintenance override.
    pub protected_overrides: Vec<ExternalId>,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn creates(&self) -> usize {
        self.count(|op| matches!(op, ChangeOp::Create(_)))
    }

    pub fn updates(&self) -> usize {
        self.count(|op| matches!(op, ChangeOp::Update(_)))
    }

    pub fn soft_deletes(&self) -> usize {
        self.count(|op| matches!(op, ChangeOp::SoftDelete { .. }))
    }

    pub fn no_ops(&self) -> usize {
        self.count(|op| matches!(op, ChangeOp::NoOp { .. }))
    }

    /// Drops every soft-delete candidate and returns how many were dropped.
    ///
    /// Used when the remote batch is not known to be complete.
    pub fn defer_deletions(&mut self) -> usize {
        self.defer_deletions_where(|_| true)
    }

    /// Drops the soft-delete candidates listed in `external_ids`.
    ///
    /// Used for instruments whose remote record was present but rejected.
    pub fn defer_deletions_of(&mut self, external_ids: &HashSet<String>) -> usize {
        self.defer_deletions_where(|external_id| external_ids.contains(external_id.as_str()))
    }

    fn defer_deletions_where(&mut self, defer: impl Fn(&ExternalId) -> bool) -> usize {
        let before = self.ops.len();
        self.ops.retain(|op| match op {
            ChangeOp::SoftDelete { external_id, .. } => !defer(external_id),
            _ => true,
        });
        before - self.ops.len()
    }

    fn count(&self, predicate: impl Fn(&ChangeOp) -> bool) -> usize {
        self.ops.iter().filter(|op| predicate(op)).count()
    }
}

/// Stateless comparison engine parameterized by the status policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffEngine {
    policy: StatusConflictPolicy,
}

impl DiffEngine {
    pub fn new(policy: StatusConflictPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> StatusConflictPolicy {
        self.policy
    }

    /// Compares `remote` against `local` and returns the operations needed to
    /// make the store mirror the remote batch.
    pub fn diff(&self, remote: &[Instrument], local: &[Instrument]) -> ChangeSet {
        let mut by_external_id: HashMap<&ExternalId, &Instrument> = HashMap::new();
        for instrument in local {
            match by_external_id.get(&instrument.external_id) {
                Some(existing) if !existing.is_retired() => {}
                _ => {
                    by_external_id.insert(&instrument.external_id, instrument);
                }
            }
        }

        let mut change_set = ChangeSet::default();
        let mut seen: HashSet<&ExternalId> = HashSet::with_capacity(remote.len());
        for incoming in remote {
            seen.insert(&incoming.external_id);
            let op = match by_external_id.get(&incoming.external_id) {
                None => ChangeOp::Create(incoming.clone()),
                Some(stored) => self.compare(incoming, stored, &mut change_set.protected_overrides),
            };
            change_set.ops.push(op);
        }

        let mut candidates: Vec<&Instrument> = local
            .iter()
            .filter(|stored| !stored.is_retired() && !seen.contains(&stored.external_id))
            .collect();
        candidates.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        change_set
            .ops
            .extend(candidates.into_iter().map(|stored| ChangeOp::SoftDelete {
                uuid: stored.uuid,
                external_id: stored.external_id.clone(),
                expected_revision: stored.revision,
            }));
        change_set
    }

    fn compare(
        &self,
        incoming: &Instrument,
        stored: &Instrument,
        protected: &mut Vec<ExternalId>,
    ) -> ChangeOp {
        let mut changes = Vec::new();
        if incoming.tag != stored.tag {
            changes.push(FieldUpdate::Tag(incoming.tag.clone()));
        }
        if incoming.category != stored.category {
            changes.push(FieldUpdate::Category(incoming.category.clone()));
        }
        if incoming.location != stored.location {
            changes.push(FieldUpdate::Location(incoming.location.clone()));
        }
        if incoming.owner != stored.owner {
            changes.push(FieldUpdate::Owner(incoming.owner.clone()));
        }
        if incoming.due_date != stored.due_date {
            changes.push(FieldUpdate::DueDate(incoming.due_date));
        }
        if incoming.status != stored.status {
            if self.keeps_local_status(incoming, stored) {
                protected.push(stored.external_id.clone());
            } else {
                changes.push(FieldUpdate::Status(incoming.status));
            }
        }

        if changes.is_empty() {
            return ChangeOp::NoOp {
                external_id: stored.external_id.clone(),
            };
        }
        ChangeOp::Update(InstrumentUpdate {
            uuid: stored.uuid,
            external_id: stored.external_id.clone(),
            expected_revision: stored.revision,
            changes,
            calibration: incoming.last_calibration,
            remote_modified_at: incoming.remote_modified_at,
        })
    }

    fn keeps_local_status(&self, incoming: &Instrument, stored: &Instrument) -> bool {
        self.policy == StatusConflictPolicy::ProtectManualMaintenance
            && stored.status_override
            && stored.status == InstrumentStatus::InMaintenance
            && incoming.status == InstrumentStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::{ChangeOp, DiffEngine, StatusConflictPolicy};
    use crate::model::instrument::{ExternalId, FieldUpdate, Instrument, InstrumentStatus};
    use chrono::NaiveDate;
    use std::collections::HashSet;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn instrument(id: &str, due: NaiveDate) -> Instrument {
        let mut instrument = Instrument::new(ExternalId::parse(id).expect("id"), "PT-100", due);
        instrument.category = Some("Thermometer".to_string());
        instrument
    }

    fn stored(id: &str, due: NaiveDate) -> Instrument {
        let mut instrument = instrument(id, due);
        instrument.revision = 3;
        instrument
    }

    #[test]
    fn classifies_create_update_noop_and_delete_candidates() {
        let due = date(2025, 1, 1);
        let mut changed = instrument("B", due);
        changed.location = Some("Lab 2".to_string());
        let remote = vec![instrument("A", due), changed, instrument("C", due)];
        let local = vec![stored("Z", due), stored("B", due), stored("C", due), stored("Y", due)];

        let change_set = DiffEngine::default().diff(&remote, &local);
        let kinds: Vec<_> = change_set
            .ops
            .iter()
            .map(|op| (op.kind(), op.external_id().as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("create", "A"),
                ("update", "B"),
                ("no_op", "C"),
                ("soft_delete", "Y"),
                ("soft_delete", "Z"),
            ]
        );

        let ChangeOp::Update(update) = &change_set.ops[1] else {
            panic!("expected update");
        };
        assert_eq!(update.changes, vec![FieldUpdate::Location(Some("Lab 2".to_string()))]);
        assert_eq!(update.expected_revision, 3);
        assert!(!update.changes_due_date());
    }

    #[test]
    fn unchanged_remote_batch_is_all_noops() {
        let due = date(2025, 6, 30);
        let local = vec![stored("A", due), stored("B", due)];
        let remote = vec![instrument("A", due), instrument("B", due)];

        let change_set = DiffEngine::default().diff(&remote, &local);
        assert_eq!(change_set.no_ops(), 2);
        assert_eq!(change_set.creates() + change_set.updates() + change_set.soft_deletes(), 0);
    }

    #[test]
    fn manual_maintenance_survives_remote_active_under_default_policy() {
        let due = date(2025, 1, 1);
        let mut local = stored("A", due);
        local.status = InstrumentStatus::InMaintenance;
        local.status_override = true;
        let mut remote = instrument("A", due);
        remote.owner = Some("Quality".to_string());

        let change_set = DiffEngine::default().diff(&[remote.clone()], &[local.clone()]);
        let ChangeOp::Update(update) = &change_set.ops[0] else {
            panic!("expected update");
        };
        assert_eq!(update.changes, vec![FieldUpdate::Owner(Some("Quality".to_string()))]);
        assert_eq!(change_set.protected_overrides.len(), 1);

        let change_set =
            DiffEngine::new(StatusConflictPolicy::RemoteWins).diff(&[remote], &[local]);
        let ChangeOp::Update(update) = &change_set.ops[0] else {
            panic!("expected update");
        };
        assert!(update
            .changes
            .contains(&FieldUpdate::Status(InstrumentStatus::Active)));
        assert!(change_set.protected_overrides.is_empty());
    }

    #[test]
    fn remote_retirement_beats_manual_maintenance() {
        let due = date(2025, 1, 1);
        let mut local = stored("A", due);
        local.status = InstrumentStatus::InMaintenance;
        local.status_override = true;
        let mut remote = instrument("A", due);
        remote.status = InstrumentStatus::Retired;

        let change_set = DiffEngine::default().diff(&[remote], &[local]);
        let ChangeOp::Update(update) = &change_set.ops[0] else {
            panic!("expected update");
        };
        assert_eq!(update.changes, vec![FieldUpdate::Status(InstrumentStatus::Retired)]);
    }

    #[test]
    fn retired_rows_are_not_candidates_and_live_row_is_preferred() {
        let due = date(2025, 1, 1);
        let mut retired = stored("A", due);
        retired.status = InstrumentStatus::Retired;
        let mut retired_other = stored("B", due);
        retired_other.status = InstrumentStatus::Retired;
        let live = stored("A", due);

        let change_set =
            DiffEngine::default().diff(&[instrument("A", due)], &[retired, live, retired_other]);
        assert_eq!(change_set.len(), 1);
        assert_eq!(change_set.no_ops(), 1);
    }

    #[test]
    fn defer_deletions_removes_only_candidates() {
        let due = date(2025, 1, 1);
        let mut change_set =
            DiffEngine::default().diff(&[instrument("A", due)], &[stored("B", due)]);
        assert_eq!(change_set.defer_deletions(), 1);
        assert_eq!(change_set.creates(), 1);
        assert_eq!(change_set.soft_deletes(), 0);
    }

    #[test]
    fn defer_deletions_of_keeps_other_candidates() {
        let due = date(2025, 1, 1);
        let mut change_set = DiffEngine::default().diff(&[], &[stored("B", due), stored("C", due)]);
        let rejected: HashSet<String> = ["B".to_string()].into_iter().collect();

        assert_eq!(change_set.defer_deletions_of(&rejected), 1);
        assert_eq!(change_set.soft_deletes(), 1);
        assert_eq!(change_set.ops[0].external_id().as_str(), "C");
    }
}
