//! Catalog repository for the `videos` table holding ingested media records
//! and their content hashes.

use rusqlite::{params, OptionalExtension, Row};

use super::{format_timestamp, Database, DatabaseError};

/// A catalog record for one ingested media file.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    pub id: i64,
    pub filename: String,
    /// Path relative to the record's storage root.
    pub path: String,
    /// Logical storage root; `None` for records resolved through the fallback root.
    pub root_key: Option<String>,
    pub size_bytes: i64,
    pub media_kind: String,
    pub fast_hash: Option<String>,
    pub perceptual_hash: Option<String>,
    pub perceptual_failed: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl VideoRecord {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let root_key: String = row.get("root_key")?;
        Ok(Self {
            id: row.get("id")?,
            filename: row.get("filename")?,
            path: row.get("path")?,
            root_key: if root_key.is_empty() { None } else { Some(root_key) },
            size_bytes: row.get("size_bytes")?,
            media_kind: row.get("media_kind")?,
            fast_hash: row.get("fast_hash")?,
            perceptual_hash: row.get("perceptual_hash")?,
            perceptual_failed: row.get("perceptual_failed")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Fields written when a handler ingests a file.
#[derive(Debug, Clone)]
pub struct NewVideo<'a> {
    pub filename: &'a str,
    pub path: &'a str,
    pub root_key: Option<&'a str>,
    pub size_bytes: i64,
    pub media_kind: &'a str,
    pub fast_hash: Option<&'a str>,
}

/// Inserts or refreshes a catalog record keyed by `(root_key, path)`.
///
/// Returns the record id. A changed fast hash clears the perceptual hash so
/// it is recomputed for the new content.
pub fn upsert(db: &Database, video: &NewVideo<'_>) -> Result<i64, DatabaseError> {
    let now = format_timestamp(chrono::Utc::now());
    db.with_conn(|conn| {
        let id: i64 = conn.query_row(
            "INSERT INTO videos (filename, path, root_key, size_bytes, media_kind, fast_hash,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(root_key, path) DO UPDATE SET
               filename = excluded.filename,
               size_bytes = excluded.size_bytes,
               media_kind = excluded.media_kind,
               perceptual_hash = CASE
                 WHEN excluded.fast_hash IS NOT NULL AND excluded.fast_hash IS NOT videos.fast_hash THEN NULL
                 ELSE videos.perceptual_hash END,
               perceptual_failed = CASE
                 WHEN excluded.fast_hash IS NOT NULL AND excluded.fast_hash IS NOT videos.fast_hash THEN 0
                 ELSE videos.perceptual_failed END,
               fast_hash = COALESCE(excluded.fast_hash, videos.fast_hash),
               updated_at = excluded.updated_at
             RETURNING id",
            params![
                video.filename,
                video.path,
                video.root_key.unwrap_or(""),
                video.size_bytes,
                video.media_kind,
                video.fast_hash,
                now,
            ],
            |r| r.get(0),
        )?;
        Ok(id)
    })
}

/// Finds a record by id.
pub fn find_by_id(db: &Database, id: i64) -> Result<Option<VideoRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row("SELECT * FROM videos WHERE id = ?1", params![id], VideoRecord::from_row)
            .optional()?;
        Ok(row)
    })
}

const MISSING_HASHES: &str =
    "fast_hash IS NULL OR (perceptual_hash IS NULL AND perceptual_failed = 0)";

/// Lists records after `after_id` that are missing a fast hash or a
/// not-yet-attempted perceptual hash, in id order.
pub fn list_missing_hashes(
    db: &Database,
    after_id: i64,
    limit: usize,
) -> Result<Vec<VideoRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM videos WHERE id > ?1 AND ({}) ORDER BY id ASC LIMIT ?2",
            MISSING_HASHES
        ))?;
        let rows = stmt
            .query_map(params![after_id, limit as i64], VideoRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts records still missing a hash.
pub fn count_missing_hashes(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM videos WHERE {}", MISSING_HASHES),
            [],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Stores a computed fast hash.
pub fn set_fast_hash(db: &Database, id: i64, hash: &str) -> Result<(), DatabaseError> {
    let now = format_timestamp(chrono::Utc::now());
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE videos SET fast_hash = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, hash, now],
        )?;
        Ok(())
    })
}

/// Stores a computed perceptual hash.
pub fn set_perceptual_hash(db: &Database, id: i64, hash: &str) -> Result<(), DatabaseError> {
    let now = format_timestamp(chrono::Utc::now());
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE videos SET perceptual_hash = ?2, perceptual_failed = 0, updated_at = ?3
             WHERE id = ?1",
            params![id, hash, now],
        )?;
        Ok(())
    })
}

/// Records that no frame could be sampled, so later batches skip the record.
pub fn mark_perceptual_failed(db: &Database, id: i64) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE videos SET perceptual_failed = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    })
}

/// Which hash column to group duplicates by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashColumn {
    Fast,
    Perceptual,
}

impl HashColumn {
    fn column(self) -> &'static str {
        match self {
            HashColumn::Fast => "fast_hash",
            HashColumn::Perceptual => "perceptual_hash",
        }
    }
}

/// Lists every record whose hash value is shared with at least one other
/// record, ordered so equal hashes are adjacent.
pub fn list_shared_hashes(
    db: &Database,
    column: HashColumn,
) -> Result<Vec<VideoRecord>, DatabaseError> {
    let col = column.column();
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM videos WHERE {col} IN (
                 SELECT {col} FROM videos WHERE {col} IS NOT NULL
                 GROUP BY {col} HAVING COUNT(*) > 1)
             ORDER BY {col} ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map([], VideoRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
