//! Built-in job handlers.

pub mod compute_hashes;
pub mod process_media;
pub mod prober;

use std::sync::Arc;

use crate::config::Config;
use crate::db::Database;
use crate::dedup::DuplicateDetector;
use crate::error::QueueError;
use crate::queue::Scheduler;
use crate::roots::RootsRegistry;
use crate::watcher::PROCESS_MEDIA_JOB;

pub use compute_hashes::ComputeHashesHandler;
pub use process_media::ProcessMediaHandler;
pub use prober::{placeholder_thumbnail, FfmpegMediaProber, MediaProber};

/// Job type that runs one duplicate-hashing batch.
pub const COMPUTE_HASHES_JOB: &str = "compute-hashes";

/// Registers the `process-media` and `compute-hashes` handlers.
pub fn register_builtin(
    scheduler: &Scheduler,
    config: &Config,
    db: &Database,
    roots: &Arc<RootsRegistry>,
    prober: Arc<dyn MediaProber>,
    detector: Arc<DuplicateDetector>,
) -> Result<(), QueueError> {
    scheduler.register_handler(
        PROCESS_MEDIA_JOB,
        ProcessMediaHandler::new(db.clone(), roots.clone(), prober, config.dedup.sample_bytes),
    )?;
    scheduler.register_handler(
        COMPUTE_HASHES_JOB,
        ComputeHashesHandler::new(detector, config.dedup.batch_limit),
    )?;
    Ok(())
}
