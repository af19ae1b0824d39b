pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod queue;
pub mod roots;
pub mod watcher;

pub use config::{Config, DedupSettings, JobSettings, WatcherSettings};
pub use db::Database;
pub use dedup::{DuplicateDetector, DuplicateGroup, DuplicateReport, HashBatchReport};
pub use error::{
    ConfigError, DedupError, HandlerError, MediaVaultError, QueueError, Result, StorageError,
    WatcherError,
};
pub use handlers::{register_builtin, COMPUTE_HASHES_JOB};
pub use logging::{init_logging, LogFormat};
pub use queue::{
    EnqueueOptions, Job, JobContext, JobHandler, JobOutcome, JobStats, JobStatus, Scheduler,
    SchedulerConfig,
};
pub use roots::{RootsRegistry, VideoLocation};
pub use watcher::{IngestionWatcher, ScanReport, WatcherConfig, PROCESS_MEDIA_JOB};
