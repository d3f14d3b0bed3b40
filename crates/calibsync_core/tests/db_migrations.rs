use calibsync_core::db::migrations::latest_version;
use calibsync_core::db::{backup_database, open_db, open_db_in_memory, DbError};
use calibsync_core::repo::{SqliteReconciliationStore, StoreError};
use rusqlite::Connection;

#[test]
fn open_db_in_memory_applies_all_migrations() {
    let conn = open_db_in_memory().unwrap();

    assert_eq!(schema_version(&conn), latest_version());
    for table in [
        "instruments",
        "calibration_records",
        "sync_sessions",
        "audit_entries",
        "session_lock",
    ] {
        assert_table_exists(&conn, table);
    }
    let foreign_keys: i64 = conn
        .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(foreign_keys, 1);
}

#[test]
fn opening_same_database_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibsync.db");

    let conn_first = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_first), latest_version());
    drop(conn_first);

    let conn_second = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_second), latest_version());
    assert_table_exists(&conn_second, "instruments");
}

#[test]
fn opening_database_with_newer_schema_version_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    let err = open_db(&path).unwrap_err();
    match err {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn store_rejects_unmigrated_connection() {
    let conn = Connection::open_in_memory().unwrap();
    let err = SqliteReconciliationStore::try_new(&conn)
        .err()
        .expect("unmigrated connection must be rejected");
    assert!(matches!(
        err,
        StoreError::UninitializedConnection {
            actual_version: 0,
            ..
        }
    ));
}

#[test]
fn history_tables_reject_update_and_delete() {
    let conn = open_db_in_memory().unwrap();
    conn.execute_batch(
        "INSERT INTO instruments (instrument_uuid, external_id, tag, due_date, status)
         VALUES ('00000000-0000-0000-0000-000000000001', 'INS-1', 'PT-1', '2025-01-01', 'active');
         INSERT INTO calibration_records (instrument_uuid, performed_on, next_due)
         VALUES ('00000000-0000-0000-0000-000000000001', '2024-01-01', '2025-01-01');",
    )
    .unwrap();

    assert!(conn
        .execute("UPDATE calibration_records SET next_due = '2030-01-01';", [])
        .is_err());
    assert!(conn.execute("DELETE FROM calibration_records;", []).is_err());
}

#[test]
fn live_external_ids_are_unique_but_retired_rows_may_repeat() {
    let conn = open_db_in_memory().unwrap();
    conn.execute_batch(
        "INSERT INTO instruments (instrument_uuid, external_id, tag, due_date, status)
         VALUES ('00000000-0000-0000-0000-000000000001', 'INS-1', 'PT-1', '2025-01-01', 'retired');
         INSERT INTO instruments (instrument_uuid, external_id, tag, due_date, status)
         VALUES ('00000000-0000-0000-0000-000000000002', 'INS-1', 'PT-1', '2025-01-01', 'active');",
    )
    .unwrap();

    let duplicate = conn.execute(
        "INSERT INTO instruments (instrument_uuid, external_id, tag, due_date, status)
         VALUES ('00000000-0000-0000-0000-000000000003', 'INS-1', 'PT-1', '2025-01-01', 'active');",
        [],
    );
    assert!(duplicate.is_err());
}

#[test]
fn backup_copies_database_and_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let conn = open_db(dir.path().join("live.db")).unwrap();
    let dest = dir.path().join("backup.db");

    backup_database(&conn, &dest).unwrap();
    let copy = Connection::open(&dest).unwrap();
    assert_eq!(schema_version(&copy), latest_version());
    assert_table_exists(&copy, "sync_sessions");

    let err = backup_database(&conn, &dest).unwrap_err();
    assert!(matches!(err, DbError::BackupTargetExists(_)));
}

fn schema_version(conn: &Connection) -> u32 {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap()
}

fn assert_table_exists(conn: &Connection, table_name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = 'table' AND name = ?1
            );",
            [table_name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1, "table {table_name} does not exist");
}
