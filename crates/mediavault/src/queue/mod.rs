//! Persistent job queue and scheduler.

pub mod handler;
pub mod job;
pub mod scheduler;

pub use handler::{handler_fn, FnHandler, HandlerError, JobContext, JobHandler};
pub use job::{
    EnqueueOptions, Job, JobCorrelation, JobListFilter, JobOutcome, JobStats, JobStatus,
    RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY,
};
pub use scheduler::{Scheduler, SchedulerConfig};
