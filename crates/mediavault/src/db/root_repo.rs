//! Persisted storage root definitions.

use std::path::PathBuf;

use rusqlite::params;

use super::{format_timestamp, Database, DatabaseError};
use crate::roots::StorageRootRecord;

/// Lists every persisted root, ordered by key.
pub fn list(db: &Database) -> Result<Vec<StorageRootRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT root_key, directories FROM storage_roots ORDER BY root_key")?;
        let raw = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(root_key, directories)| {
                let directories: Vec<PathBuf> = serde_json::from_str(&directories)
                    .map_err(|source| DatabaseError::Json {
                        column: "directories",
                        source,
                    })?;
                Ok(StorageRootRecord {
                    root_key,
                    directories,
                })
            })
            .collect()
    })
}

/// Inserts or replaces a persisted root definition.
pub fn upsert(db: &Database, record: &StorageRootRecord) -> Result<(), DatabaseError> {
    let directories = serde_json::to_string(&record.directories).map_err(|source| {
        DatabaseError::Json {
            column: "directories",
            source,
        }
    })?;
    let now = format_timestamp(chrono::Utc::now());
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO storage_roots (root_key, directories, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(root_key) DO UPDATE SET directories = excluded.directories",
            params![record.root_key, directories, now],
        )?;
        Ok(())
    })
}
