//! Job repository: persistence operations for the `jobs` table.
//!
//! Status transitions live here as single statements (or one transaction for
//! claiming) so the scheduler never observes a half-applied change.

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// One `jobs` row as stored; the queue layer converts it to a typed `Job`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub job_type: String,
    pub payload: String,
    pub priority: i64,
    pub status: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub available_at: Option<String>,
    pub error_message: Option<String>,
    pub result: Option<String>,
    pub video_id: Option<i64>,
    pub root_key: Option<String>,
    pub relative_path: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_type: row.get("job_type")?,
            payload: row.get("payload")?,
            priority: row.get("priority")?,
            status: row.get("status")?,
            attempts: row.get("attempts")?,
            max_attempts: row.get("max_attempts")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            available_at: row.get("available_at")?,
            error_message: row.get("error_message")?,
            result: row.get("result")?,
            video_id: row.get("video_id")?,
            root_key: row.get("root_key")?,
            relative_path: row.get("relative_path")?,
        })
    }
}

/// Optional constraints for [`query`]. Unset fields match everything.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<String>,
    pub job_type: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, job_type, payload, priority, status, attempts, max_attempts,
             created_at, started_at, completed_at, available_at, error_message, result,
             video_id, root_key, relative_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                job.id,
                job.job_type,
                job.payload,
                job.priority,
                job.status,
                job.attempts,
                job.max_attempts,
                job.created_at,
                job.started_at,
                job.completed_at,
                job.available_at,
                job.error_message,
                job.result,
                job.video_id,
                job.root_key,
                job.relative_path,
            ],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], JobRow::from_row)
            .optional()?;
        Ok(row)
    })
}

/// Lists jobs matching `filter`, newest first, along with the total number
/// of matches ignoring paging.
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    const MATCHES: &str = "(?1 IS NULL OR status = ?1) AND (?2 IS NULL OR job_type = ?2)";

    let status = filter.status.as_deref();
    let job_type = filter.job_type.as_deref();
    let limit = filter.limit.unwrap_or(100) as i64;
    let offset = filter.offset.unwrap_or(0) as i64;

    db.with_conn(|conn| {
        let total: u64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM jobs WHERE {MATCHES}"),
            params![status, job_type],
            |r| r.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM jobs WHERE {MATCHES}
             ORDER BY created_at DESC, rowid DESC LIMIT ?3 OFFSET ?4"
        ))?;
        let page = stmt
            .query_map(params![status, job_type, limit, offset], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((page, total))
    })
}

/// Claims up to `limit` dispatchable jobs in a single transaction.
///
/// A job is dispatchable when it is `pending`, has attempts left and its
/// `available_at` gate (if any) is not in the future. Claimed rows move to
/// `processing` with `attempts` incremented and `started_at = now`; they are
/// returned in dispatch order: priority, then age, then insertion order.
pub fn claim_pending(db: &Database, limit: usize, now: &str) -> Result<Vec<JobRow>, DatabaseError> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    db.with_tx(|tx| {
        let candidates: Vec<JobRow> = {
            let mut stmt = tx.prepare(
                "SELECT * FROM jobs
                 WHERE status = 'pending' AND attempts < max_attempts
                   AND (available_at IS NULL OR available_at <= ?1)
                 ORDER BY priority ASC, created_at ASC, rowid ASC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![now, limit as i64], JobRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for mut job in candidates {
            let changed = tx.execute(
                "UPDATE jobs SET status = 'processing', attempts = attempts + 1,
                 started_at = ?2, available_at = NULL
                 WHERE id = ?1 AND status = 'pending'",
                params![job.id, now],
            )?;
            if changed == 1 {
                job.status = "processing".to_string();
                job.attempts += 1;
                job.started_at = Some(now.to_string());
                job.available_at = None;
                claimed.push(job);
            }
        }

        Ok(claimed)
    })
}

/// Marks a processing job as completed with its handler result.
pub fn mark_completed(
    db: &Database,
    id: &str,
    result: Option<&str>,
    completed_at: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET status = 'completed', result = ?2, completed_at = ?3,
             error_message = NULL
             WHERE id = ?1",
            params![id, result, completed_at],
        )?;
        Ok(())
    })
}

/// Returns a processing job to `pending` after a failed attempt.
///
/// The last error is kept for inspection; `available_at` gates the next
/// attempt when a retry delay is configured.
pub fn mark_retry(
    db: &Database,
    id: &str,
    error: &str,
    available_at: Option<&str>,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET status = 'pending', started_at = NULL, error_message = ?2,
             available_at = ?3
             WHERE id = ?1",
            params![id, error, available_at],
        )?;
        Ok(())
    })
}

/// Marks a job as permanently failed.
pub fn mark_failed(
    db: &Database,
    id: &str,
    error: &str,
    completed_at: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET status = 'failed', error_message = ?2, completed_at = ?3
             WHERE id = ?1",
            params![id, error, completed_at],
        )?;
        Ok(())
    })
}

/// Outcome of the startup recovery sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryCounts {
    /// Jobs returned to `pending`.
    pub reset: usize,
    /// Jobs interrupted during their final attempt, now `failed`.
    pub exhausted: usize,
}

/// Reclassifies jobs orphaned in `processing` by an unclean shutdown.
pub fn recover_processing(db: &Database, now: &str) -> Result<RecoveryCounts, DatabaseError> {
    db.with_tx(|tx| {
        let exhausted = tx.execute(
            "UPDATE jobs SET status = 'failed', started_at = NULL, completed_at = ?1,
             error_message = COALESCE(error_message, 'interrupted during final attempt')
             WHERE status = 'processing' AND attempts >= max_attempts",
            params![now],
        )?;
        let reset = tx.execute(
            "UPDATE jobs SET status = 'pending', started_at = NULL
             WHERE status = 'processing'",
            [],
        )?;
        Ok(RecoveryCounts { reset, exhausted })
    })
}

/// Returns a failed job to `pending` with a fresh attempt budget.
pub fn reset_failed(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'pending', attempts = 0, started_at = NULL,
             completed_at = NULL, available_at = NULL
             WHERE id = ?1 AND status = 'failed'",
            params![id],
        )?;
        Ok(changed == 1)
    })
}

/// Counts jobs grouped by status.
pub fn count_by_status(db: &Database) -> Result<HashMap<String, u64>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(counts)
    })
}

/// Deletes a job only while it is `pending` or `failed`.
///
/// Returns false when the job does not exist or is in another status.
pub fn delete_if_inactive(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "DELETE FROM jobs WHERE id = ?1 AND status IN ('pending', 'failed')",
            params![id],
        )?;
        Ok(changed == 1)
    })
}

/// Deletes completed jobs that finished before `cutoff`.
pub fn delete_completed_before(db: &Database, cutoff: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let deleted = conn.execute(
            "DELETE FROM jobs WHERE status = 'completed' AND completed_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    })
}

/// Returns true when a pending or processing job targets the given file.
pub fn has_active_for_location(
    db: &Database,
    root_key: &str,
    relative_path: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM jobs
             WHERE root_key = ?1 AND relative_path = ?2
               AND status IN ('pending', 'processing'))",
            params![root_key, relative_path],
            |r| r.get(0),
        )?;
        Ok(exists)
    })
}
