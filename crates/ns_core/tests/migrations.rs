use ns_core::db::{open_db, schema_version};

#[test]
fn migrations_apply_latest_schema() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db_path = temp.path().join("db/notesync.sqlite");

    let conn = open_db(&db_path).expect("open db");
    assert_eq!(schema_version(&conn).expect("schema version"), 2);

    for table in ["file_entries", "settings", "sync_state", "sync_runs"] {
        let name: String = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
                [table],
                |row| row.get(0),
            )
            .expect("table must exist");
        assert_eq!(name, table);
    }
}

#[test]
fn reopening_keeps_data_and_version() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db_path = temp.path().join("db/notesync.sqlite");

    {
        let conn = open_db(&db_path).expect("open db");
        conn.execute(
            "INSERT INTO settings(setting_key, setting_value, updated_at_ms) VALUES ('k', 'v', 1)",
            [],
        )
        .expect("insert");
    }

    let conn = open_db(&db_path).expect("reopen db");
    assert_eq!(schema_version(&conn).expect("schema version"), 2);
    let value: String = conn
        .query_row("SELECT setting_value FROM settings WHERE setting_key='k'", [], |row| row.get(0))
        .expect("setting survives reopen");
    assert_eq!(value, "v");
}

#[test]
fn newer_schema_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db_path = temp.path().join("db/notesync.sqlite");
    {
        let conn = open_db(&db_path).expect("open db");
        conn.pragma_update(None, "user_version", 99).expect("bump version");
    }

    let err = open_db(&db_path).expect_err("must reject future schema");
    assert_eq!(err.code.as_str(), "NS_DB_SCHEMA_INCOMPATIBLE");
}
