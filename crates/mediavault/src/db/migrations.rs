//! Schema migrations, recorded in `schema_migrations` and applied in
//! version order. Each migration and its record commit together.

use rusqlite::{params, Connection};

use super::{format_timestamp, DatabaseError};

const SCHEMA: &[(u32, &str, &str)] = &[
    (1, "jobs", include_str!("sql/001_create_jobs.sql")),
    (2, "videos", include_str!("sql/002_create_videos.sql")),
    (3, "duplicate_ignores", include_str!("sql/003_create_duplicate_ignores.sql")),
    (4, "storage_roots", include_str!("sql/004_create_storage_roots.sql")),
];

pub fn latest_version() -> u32 {
    SCHEMA.last().map(|(version, _, _)| *version).unwrap_or(0)
}

pub fn current_version(conn: &Connection) -> Result<u32, DatabaseError> {
    ensure_ledger(conn)?;
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |r| r.get(0),
    )?)
}

/// Applies every migration newer than the recorded version; returns how
/// many ran.
pub fn apply_pending(conn: &mut Connection) -> Result<usize, DatabaseError> {
    let from = current_version(conn)?;
    let mut applied = 0;

    for &(version, name, sql) in SCHEMA.iter().filter(|(v, _, _)| *v > from) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql).map_err(|e| DatabaseError::Migration {
            version,
            reason: e.to_string(),
        })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![version, name, format_timestamp(chrono::Utc::now())],
        )?;
        tx.commit()?;

        log::info!("Schema migrated to v{} ({})", version, name);
        applied += 1;
    }

    Ok(applied)
}

fn ensure_ledger(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}
