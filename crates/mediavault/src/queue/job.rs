//! Job model exposed by the scheduler.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::job_repo::JobRow;
use crate::db::parse_timestamp;

pub const DEFAULT_PRIORITY: i64 = 5;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Lifecycle state of a persisted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    fn parse(s: &str, job_id: &str) -> Self {
        match s {
            "pending" => JobStatus::Pending,
            "processing" => JobStatus::Processing,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            other => {
                log::warn!(
                    "Unknown job status '{}' for job {}, treating as failed",
                    other,
                    job_id
                );
                JobStatus::Failed
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional fields linking a job to a catalog record or a file on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCorrelation {
    pub video_id: Option<i64>,
    pub root_key: Option<String>,
    pub relative_path: Option<String>,
}

impl JobCorrelation {
    pub fn for_file(root_key: &str, relative_path: &str) -> Self {
        Self {
            video_id: None,
            root_key: Some(root_key.to_string()),
            relative_path: Some(relative_path.to_string()),
        }
    }
}

/// Options accepted by `Scheduler::enqueue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Lower runs first.
    pub priority: i64,
    pub max_attempts: u32,
    pub correlation: JobCorrelation,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            correlation: JobCorrelation::default(),
        }
    }
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_correlation(mut self, correlation: JobCorrelation) -> Self {
        self.correlation = correlation;
        self
    }
}

/// A job as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub available_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
    #[serde(flatten)]
    pub correlation: JobCorrelation,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        let payload = parse_json(&row.payload, &row.id, "payload");
        let result = row.result.as_deref().map(|r| parse_json(r, &row.id, "result"));
        Self {
            status: JobStatus::parse(&row.status, &row.id),
            created_at: parse_timestamp(&row.created_at),
            started_at: row.started_at.as_deref().map(parse_timestamp),
            completed_at: row.completed_at.as_deref().map(parse_timestamp),
            available_at: row.available_at.as_deref().map(parse_timestamp),
            correlation: JobCorrelation {
                video_id: row.video_id,
                root_key: row.root_key,
                relative_path: row.relative_path,
            },
            id: row.id,
            job_type: row.job_type,
            payload,
            priority: row.priority,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            error_message: row.error_message,
            result,
        }
    }
}

fn parse_json(raw: &str, job_id: &str, column: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        log::warn!("Job {} has unreadable {} JSON: {}", job_id, column, e);
        serde_json::Value::String(raw.to_string())
    })
}

/// Terminal result delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Option<serde_json::Value>),
    Failed(String),
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed(_))
    }

    /// Outcome of a job already in a terminal status.
    pub(crate) fn from_job(job: &Job) -> Option<Self> {
        match job.status {
            JobStatus::Completed => Some(JobOutcome::Completed(job.result.clone())),
            JobStatus::Failed => Some(JobOutcome::Failed(
                job.error_message.clone().unwrap_or_default(),
            )),
            JobStatus::Pending | JobStatus::Processing => None,
        }
    }
}

/// Queue counts per status plus live executions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: usize,
}

impl JobStats {
    pub(crate) fn from_counts(counts: &HashMap<String, u64>, in_flight: usize) -> Self {
        let get = |s: JobStatus| counts.get(s.as_str()).copied().unwrap_or(0);
        Self {
            pending: get(JobStatus::Pending),
            processing: get(JobStatus::Processing),
            completed: get(JobStatus::Completed),
            failed: get(JobStatus::Failed),
            in_flight,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Filter for `Scheduler::list_jobs`.
#[derive(Debug, Clone, Default)]
pub struct JobListFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Delay applied before a failed job becomes eligible again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    #[default]
    Immediate,
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl RetryPolicy {
    /// Delay before the attempt following `attempts` completed attempts.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        match *self {
            RetryPolicy::Immediate => Duration::ZERO,
            RetryPolicy::Fixed(d) => d,
            RetryPolicy::Exponential { base, max } => {
                let exp = attempts.saturating_sub(1).min(31);
                base.checked_mul(1u32 << exp).unwrap_or(max).min(max)
            }
        }
    }
}
