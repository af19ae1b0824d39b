use std::sync::Arc;
use std::time::Duration;

use mediavault::db::{root_repo, Database};
use mediavault::dedup::{DuplicateDetector, FfmpegFrameSampler};
use mediavault::handlers::{register_builtin, FfmpegMediaProber};
use mediavault::queue::JobListFilter;
use mediavault::{
    init_logging, Config, EnqueueOptions, IngestionWatcher, JobOutcome, JobStatus, RootsRegistry,
    Scheduler, SchedulerConfig, WatcherConfig, COMPUTE_HASHES_JOB,
};
use serde_json::json;
use tracing::{debug, error, info, warn};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    if let Err(e) = run().await {
        error!("mediavaultd stopped with an error: {}", e);
        eprintln!("mediavaultd: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> mediavault::Result<()> {
    let config = Config::from_env();
    init_logging(&config.logging.level, config.logging.format);
    info!("Starting mediavaultd v{}", env!("CARGO_PKG_VERSION"));

    let db_path = config.database_path()?;
    info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path)?;

    let roots = Arc::new(RootsRegistry::from_config(&config.roots));
    let added = roots.register_from_db(&root_repo::list(&db)?);
    if added > 0 {
        info!(added, "Registered persisted storage roots");
    }

    let scheduler = Scheduler::new(db.clone(), SchedulerConfig::from(&config.jobs));
    let detector = Arc::new(DuplicateDetector::new(
        db.clone(),
        roots.clone(),
        Arc::new(FfmpegFrameSampler::default()),
        config.dedup.sample_bytes,
    ));
    register_builtin(
        &scheduler,
        &config,
        &db,
        &roots,
        Arc::new(FfmpegMediaProber::default()),
        detector,
    )?;
    scheduler.start()?;

    let watchers = start_watchers(&config, &scheduler, &roots).await;

    let maintenance = tokio::spawn(maintenance_loop(
        scheduler.clone(),
        config.jobs.cleanup_days,
        config.dedup.interval,
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");

    maintenance.abort();
    for watcher in &watchers {
        watcher.stop().await;
    }
    scheduler.stop().await;

    info!("mediavaultd stopped");
    Ok(())
}

async fn start_watchers(
    config: &Config,
    scheduler: &Scheduler,
    roots: &Arc<RootsRegistry>,
) -> Vec<IngestionWatcher> {
    let mut watchers = Vec::new();
    if !config.watcher.enabled {
        info!("Ingestion watcher disabled");
        return watchers;
    }

    let configured: Vec<String> = roots.list_roots().into_iter().map(|r| r.root_key).collect();
    for root_key in config.watch_root_keys(&configured) {
        let watcher_config = WatcherConfig::from_settings(root_key.as_str(), &config.watcher);
        let watcher = match IngestionWatcher::new(watcher_config, scheduler.clone(), roots.clone()) {
            Ok(watcher) => watcher,
            Err(e) => {
                error!(root_key = %root_key, "Invalid watcher configuration: {}", e);
                continue;
            }
        };

        match watcher.start().await {
            Ok(true) => watchers.push(watcher),
            Ok(false) => warn!(root_key = %root_key, "Root unavailable; watcher not started"),
            Err(e) => error!(root_key = %root_key, "Failed to start watcher: {}", e),
        }
    }

    info!(count = watchers.len(), "Ingestion watchers running");
    watchers
}

async fn maintenance_loop(scheduler: Scheduler, cleanup_days: u32, hash_interval: Duration) {
    let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
    let mut hashing = (!hash_interval.is_zero()).then(|| tokio::time::interval(hash_interval));

    loop {
        tokio::select! {
            _ = cleanup.tick() => {
                match scheduler.clear_completed(cleanup_days) {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "Cleared old completed jobs"),
                    Err(e) => warn!("Failed to clear completed jobs: {}", e),
                }
            }
            _ = async {
                match hashing.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => enqueue_hash_batch(&scheduler),
        }
    }
}

/// Queues a hashing batch unless one is already waiting or running.
fn enqueue_hash_batch(scheduler: &Scheduler) {
    for status in [JobStatus::Pending, JobStatus::Processing] {
        let filter = JobListFilter {
            status: Some(status),
            job_type: Some(COMPUTE_HASHES_JOB.to_string()),
            limit: Some(1),
            offset: None,
        };
        match scheduler.list_jobs(&filter) {
            Ok((_, 0)) => {}
            Ok(_) => {
                debug!("Hash batch already queued");
                return;
            }
            Err(e) => {
                warn!("Failed to inspect hash jobs: {}", e);
                return;
            }
        }
    }

    let job_id = match scheduler.enqueue(
        COMPUTE_HASHES_JOB,
        json!({}),
        EnqueueOptions::default().with_max_attempts(1),
    ) {
        Ok(id) => id,
        Err(e) => {
            warn!("Failed to queue hash batch: {}", e);
            return;
        }
    };

    let Ok(outcome) = scheduler.subscribe(&job_id) else {
        return;
    };
    tokio::spawn(async move {
        match outcome.await {
            Ok(JobOutcome::Completed(Some(report))) => info!(job_id = %job_id, %report, "Hash batch done"),
            Ok(JobOutcome::Completed(None)) => {}
            Ok(JobOutcome::Failed(reason)) => warn!(job_id = %job_id, "Hash batch failed: {}", reason),
            Err(_) => debug!(job_id = %job_id, "Hash batch outcome dropped"),
        }
    });
}
