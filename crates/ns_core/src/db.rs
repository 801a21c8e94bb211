use crate::app_error::{AppError, AppResult, ErrorCode};
use rusqlite::Connection;
use std::fs;
use std::path::Path;

const MIGRATIONS: &[(i64, &str)] = &[
    (1, include_str!("../migrations/0001_init.sql")),
    (2, include_str!("../migrations/0002_sync_state.sql")),
];

const LATEST_SCHEMA_VERSION: i64 = 2;

fn migration_error(message: &str, version: i64, e: rusqlite::Error) -> AppError {
    AppError::new(
        ErrorCode::DbMigrationFailed,
        message,
        serde_json::json!({ "error": e.to_string(), "version": version }),
    )
}

pub fn open_db(db_path: &Path) -> AppResult<Connection> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            AppError::new(
                ErrorCode::DbOpenFailed,
                "failed to create database parent directory",
                serde_json::json!({ "error": e.to_string(), "path": parent }),
            )
        })?;
    }

    let conn = Connection::open(db_path).map_err(|e| {
        AppError::new(
            ErrorCode::DbOpenFailed,
            "failed to open sqlite database",
            serde_json::json!({ "error": e.to_string(), "path": db_path }),
        )
    })?;

    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(|e| {
            AppError::new(
                ErrorCode::DbOpenFailed,
                "failed to set sqlite busy timeout",
                serde_json::json!({ "error": e.to_string() }),
            )
        })?;

    apply_migrations(&conn)?;
    Ok(conn)
}

pub fn apply_migrations(conn: &Connection) -> AppResult<()> {
    let current = schema_version(conn)?;
    if current > LATEST_SCHEMA_VERSION {
        return Err(AppError::new(
            ErrorCode::DbSchemaIncompatible,
            "database schema version is newer than supported",
            serde_json::json!({ "current": current, "latest": LATEST_SCHEMA_VERSION }),
        ));
    }

    for (version, sql) in MIGRATIONS {
        if schema_version(conn)? >= *version {
            continue;
        }
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| migration_error("failed to begin migration transaction", *version, e))?;
        tx.execute_batch(sql)
            .map_err(|e| migration_error("failed to apply migration", *version, e))?;
        tx.pragma_update(None, "user_version", *version)
            .map_err(|e| migration_error("failed to set schema user_version", *version, e))?;
        tx.commit()
            .map_err(|e| migration_error("failed to commit migration transaction", *version, e))?;
        tracing::debug!(version = *version, "applied database migration");
    }

    Ok(())
}

pub fn schema_version(conn: &Connection) -> AppResult<i64> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| {
            AppError::new(
                ErrorCode::DbSchemaIncompatible,
                "failed to read schema version",
                serde_json::json!({ "error": e.to_string() }),
            )
        })
}
