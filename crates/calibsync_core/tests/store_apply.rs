mod common;

use calibsync_core::diff::InstrumentUpdate;
use calibsync_core::model::audit::NewAuditEntry;
use calibsync_core::model::instrument::FieldUpdate;
use calibsync_core::{
    open_db_in_memory, AuditOperation, CalibrationEvidence, CalibrationResult, ExternalId,
    Instrument, InstrumentStatus, ReconciliationStore, SessionErrorKind, SessionRepository,
    SessionStatus, SqliteReconciliationStore, StoreError, SyncSession,
};
use common::{begin_test_session, date};
use rusqlite::Connection;

fn new_instrument(external_id: &str) -> Instrument {
    let mut instrument = Instrument::new(
        ExternalId::parse(external_id).unwrap(),
        "PT-100",
        date(2025, 1, 1),
    );
    instrument.category = Some("Thermometer".to_string());
    instrument
}

fn count_rows(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| row.get(0))
        .unwrap()
}

#[test]
fn create_assigns_revision_one_and_appends_history_and_audit() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteReconciliationStore::try_new(&conn).unwrap();
    let context = begin_test_session(&store);

    let stored = store
        .apply_create(&new_instrument("INS-100"), &context)
        .unwrap();
    assert_eq!(stored.revision, 1);

    let snapshot = store.snapshot().unwrap();
    assert_eq!(snapshot, vec![stored.clone()]);
    assert_eq!(
        snapshot[0].last_calibration,
        Some(CalibrationEvidence {
            performed_on: date(2024, 6, 1),
            result: None,
        })
    );

    let history = store.calibration_history(stored.uuid).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].next_due, date(2025, 1, 1));
    assert_eq!(history[0].session_id, Some(context.session_id));

    let audit = store.audit_for_instrument(stored.uuid).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].operation, AuditOperation::Create);
    assert_eq!(audit[0].revision, 1);
    assert_eq!(audit[0].session_id, Some(context.session_id));
    assert!(audit[0].changes.iter().all(|change| change.before.is_none()));
}

#[test]
fn update_records_field_diff_and_new_calibration_on_due_date_change() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteReconciliationStore::try_new(&conn).unwrap();
    let context = begin_test_session(&store);
    let stored = store
        .apply_create(&new_instrument("INS-1"), &context)
        .unwrap();

    let update = InstrumentUpdate {
        uuid: stored.uuid,
        external_id: stored.external_id.clone(),
        expected_revision: 1,
        changes: vec![
            FieldUpdate::Location(Some("Lab 3".to_string())),
            FieldUpdate::DueDate(date(2026, 1, 1)),
        ],
        calibration: Some(CalibrationEvidence {
            performed_on: date(2025, 1, 2),
            result: Some(CalibrationResult::Conditional),
        }),
        remote_modified_at: Some(1_735_776_000_000),
    };
    assert_eq!(store.apply_update(&update, &context).unwrap(), 2);

    let current = store.get_instrument(stored.uuid).unwrap().unwrap();
    assert_eq!(current.revision, 2);
    assert_eq!(current.location.as_deref(), Some("Lab 3"));
    assert_eq!(current.due_date, date(2026, 1, 1));
    assert_eq!(current.remote_modified_at, Some(1_735_776_000_000));

    let history = store.calibration_history(stored.uuid).unwrap();
    assert_eq!(history.len(), 2);
    let latest = history.last().unwrap();
    assert_eq!(latest.next_due, current.due_date);
    assert_eq!(latest.performed_on, date(2025, 1, 2));
    assert_eq!(latest.result, Some(CalibrationResult::Conditional));

    let audit = store.audit_for_instrument(stored.uuid).unwrap();
    let entry = audit.last().unwrap();
    assert_eq!(entry.operation, AuditOperation::Update);
    assert_eq!(entry.revision, 2);
    assert_eq!(entry.changes.len(), 2);
    assert_eq!(entry.changes[0].before.as_deref(), None);
    assert_eq!(entry.changes[0].after.as_deref(), Some("Lab 3"));
    assert_eq!(entry.changes[1].before.as_deref(), Some("2025-01-01"));
    assert_eq!(entry.changes[1].after.as_deref(), Some("2026-01-01"));
}

#[test]
fn update_without_due_date_change_keeps_history() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteReconciliationStore::try_new(&conn).unwrap();
    let context = begin_test_session(&store);
    let stored = store
        .apply_create(&new_instrument("INS-1"), &context)
        .unwrap();

    let update = InstrumentUpdate {
        uuid: stored.uuid,
        external_id: stored.external_id.clone(),
        expected_revision: 1,
        changes: vec![FieldUpdate::Owner(Some("Quality".to_string()))],
        calibration: None,
        remote_modified_at: None,
    };
    store.apply_update(&update, &context).unwrap();
    assert_eq!(store.calibration_history(stored.uuid).unwrap().len(), 1);
}

#[test]
fn stale_revision_is_rejected_without_side_effects() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteReconciliationStore::try_new(&conn).unwrap();
    let context = begin_test_session(&store);
    let stored = store
        .apply_create(&new_instrument("INS-1"), &context)
        .unwrap();
    let audit_before = count_rows(&conn, "audit_entries");

    let update = InstrumentUpdate {
        uuid: stored.uuid,
        external_id: stored.external_id.clone(),
        expected_revision: 7,
        changes: vec![FieldUpdate::Tag("PT-200".to_string())],
        calibration: None,
        remote_modified_at: None,
    };
    let err = store.apply_update(&update, &context).unwrap_err();
    assert!(matches!(
        err,
        StoreError::RevisionConflict {
            expected: 7,
            actual: 1,
            ..
        }
    ));
    assert!(err.is_record_scoped());
    assert_eq!(store.get_instrument(stored.uuid).unwrap().unwrap(), stored);
    assert_eq!(count_rows(&conn, "audit_entries"), audit_before);
}

#[test]
fn duplicate_live_create_rolls_back_completely() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteReconciliationStore::try_new(&conn).unwrap();
    let context = begin_test_session(&store);
    store
        .apply_create(&new_instrument("INS-1"), &context)
        .unwrap();
    let calibrations_before = count_rows(&conn, "calibration_records");
    let audit_before = count_rows(&conn, "audit_entries");

    let err = store
        .apply_create(&new_instrument("INS-1"), &context)
        .unwrap_err();
    assert!(matches!(err, StoreError::Constraint(_)));
    assert_eq!(count_rows(&conn, "instruments"), 1);
    assert_eq!(count_rows(&conn, "calibration_records"), calibrations_before);
    assert_eq!(count_rows(&conn, "audit_entries"), audit_before);
}

#[test]
fn soft_delete_retires_and_frees_external_id() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteReconciliationStore::try_new(&conn).unwrap();
    let context = begin_test_session(&store);
    let stored = store
        .apply_create(&new_instrument("INS-1"), &context)
        .unwrap();

    assert_eq!(
        store
            .apply_soft_delete(stored.uuid, 1, &context)
            .unwrap(),
        2
    );
    let retired = store.get_instrument(stored.uuid).unwrap().unwrap();
    assert_eq!(retired.status, InstrumentStatus::Retired);
    assert_eq!(store.calibration_history(stored.uuid).unwrap().len(), 1);
    assert!(store
        .find_live_instrument(&stored.external_id)
        .unwrap()
        .is_none());

    let replacement = store
        .apply_create(&new_instrument("INS-1"), &context)
        .unwrap();
    assert_ne!(replacement.uuid, stored.uuid);
    assert_eq!(store.snapshot().unwrap().len(), 2);

    let operations: Vec<_> = store
        .audit_for_session(context.session_id)
        .unwrap()
        .into_iter()
        .map(|entry| entry.operation)
        .collect();
    assert_eq!(
        operations,
        vec![
            AuditOperation::Create,
            AuditOperation::SoftDelete,
            AuditOperation::Create
        ]
    );
}

#[test]
fn manual_status_sets_override_and_audits_without_session() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteReconciliationStore::try_new(&conn).unwrap();
    let context = begin_test_session(&store);
    let stored = store
        .apply_create(&new_instrument("INS-1"), &context)
        .unwrap();

    let revision = store
        .set_manual_status(stored.uuid, InstrumentStatus::InMaintenance)
        .unwrap();
    assert_eq!(revision, 2);

    let current = store.get_instrument(stored.uuid).unwrap().unwrap();
    assert_eq!(current.status, InstrumentStatus::InMaintenance);
    assert!(current.status_override);

    let audit = store.audit_for_instrument(stored.uuid).unwrap();
    let entry = audit.last().unwrap();
    assert_eq!(entry.operation, AuditOperation::ManualStatus);
    assert_eq!(entry.session_id, None);
    assert_eq!(entry.changes[0].before.as_deref(), Some("active"));
    assert_eq!(entry.changes[0].after.as_deref(), Some("in_maintenance"));
}

#[test]
fn record_audit_appends_standalone_entry() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteReconciliationStore::try_new(&conn).unwrap();
    let context = begin_test_session(&store);
    let stored = store
        .apply_create(&new_instrument("INS-1"), &context)
        .unwrap();

    let audit_id = store
        .record_audit(&NewAuditEntry {
            session_id: Some(context.session_id),
            instrument_uuid: stored.uuid,
            external_id: stored.external_id.clone(),
            operation: AuditOperation::Update,
            revision: stored.revision,
            changes: Vec::new(),
        })
        .unwrap();

    let entries = store.audit_for_session(context.session_id).unwrap();
    assert_eq!(entries.last().unwrap().audit_id, audit_id);
    assert!(conn
        .execute("DELETE FROM audit_entries;", [])
        .is_err());
}

#[test]
fn sealed_sessions_are_immutable_and_listed_newest_first() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteReconciliationStore::try_new(&conn).unwrap();

    let mut first = SyncSession::new(1_000, None);
    store.begin_session(&first).unwrap();
    first.status = SessionStatus::Fetching;
    store.save_session_progress(&first).unwrap();
    first.status = SessionStatus::Succeeded;
    first.finished_at = Some(2_000);
    first.counts.created = 4;
    store.seal_session(&first).unwrap();

    let mut second = SyncSession::new(3_000, Some(1_000));
    store.begin_session(&second).unwrap();
    second.status = SessionStatus::Failed;
    second.record_error(SessionErrorKind::SourceUnavailable, None, "timeout");
    store.seal_session(&second).unwrap();

    assert!(matches!(
        store.seal_session(&second),
        Err(StoreError::SessionSealed(id)) if id == second.id
    ));
    second.status = SessionStatus::Applying;
    assert!(matches!(
        store.save_session_progress(&second),
        Err(StoreError::SessionSealed(_))
    ));

    let listed = store.list_sessions(10).unwrap();
    assert_eq!(
        listed.iter().map(|session| session.id).collect::<Vec<_>>(),
        vec![second.id, first.id]
    );
    assert_eq!(listed[1], first);
    assert_eq!(listed[0].errors.len(), 1);
    assert_eq!(listed[0].since, Some(1_000));

    let last_ok = store.last_succeeded_session().unwrap().unwrap();
    assert_eq!(last_ok.id, first.id);
    assert_eq!(store.get_session(second.id).unwrap().unwrap().status, SessionStatus::Failed);
}
