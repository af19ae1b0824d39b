//! Polling ingestion watcher.
//!
//! Periodically walks one storage root and queues a processing job for each
//! media file that lacks outputs once the file has stopped changing. A file
//! is considered settled when two scans see the same size and modification
//! time and the stability window has elapsed since it was first seen.

pub mod layout;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use glob::Pattern;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};
use walkdir::WalkDir;

use crate::config::WatcherSettings;
use crate::error::{QueueError, WatcherError};
use crate::queue::{EnqueueOptions, JobCorrelation, Scheduler, DEFAULT_MAX_ATTEMPTS};
use crate::roots::RootsRegistry;

pub use layout::{collect_candidates, Candidate, MediaKind, OutputLayout};

/// Job type queued for new media files.
pub const PROCESS_MEDIA_JOB: &str = "process-media";

/// Settings for one watched root.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub root_key: String,
    pub poll_interval: Duration,
    pub stability_window: Duration,
    pub auto_organize: bool,
    pub backfill_missing_outputs: bool,
    /// Scans between cleanup passes; 0 disables cleanup.
    pub cleanup_every_scans: u32,
    pub exclude: Vec<String>,
    pub job_type: String,
    pub job_priority: i64,
    pub job_max_attempts: u32,
    pub layout: OutputLayout,
}

impl WatcherConfig {
    pub fn new(root_key: impl Into<String>) -> Self {
        Self::from_settings(root_key, &WatcherSettings::default())
    }

    pub fn from_settings(root_key: impl Into<String>, settings: &WatcherSettings) -> Self {
        Self {
            root_key: root_key.into(),
            poll_interval: settings.poll_interval,
            stability_window: settings.stability_window,
            auto_organize: settings.auto_organize,
            backfill_missing_outputs: settings.backfill_missing_outputs,
            cleanup_every_scans: settings.cleanup_every_scans,
            exclude: settings.exclude.clone(),
            job_type: PROCESS_MEDIA_JOB.to_string(),
            job_priority: 5,
            job_max_attempts: DEFAULT_MAX_ATTEMPTS,
            layout: OutputLayout::default(),
        }
    }
}

/// What a single scan observed and did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    /// True when the scan was skipped because another was running.
    pub overlapped: bool,
    pub candidates: usize,
    /// Files newly found to have complete outputs.
    pub processed: usize,
    /// Files still waiting out the stability window.
    pub waiting: usize,
    pub queued: usize,
    /// Settled files that already had an active job.
    pub already_active: usize,
    pub errors: usize,
    /// Directories removed by cleanup.
    pub cleaned: usize,
}

/// Size and mtime of a file seen without outputs.
#[derive(Debug, Clone)]
struct PendingFileObservation {
    size: u64,
    modified: Option<SystemTime>,
    first_seen_at: Instant,
    last_seen_at: Instant,
}

impl PendingFileObservation {
    fn new(size: u64, modified: Option<SystemTime>, now: Instant) -> Self {
        Self {
            size,
            modified,
            first_seen_at: now,
            last_seen_at: now,
        }
    }

    fn matches(&self, size: u64, modified: Option<SystemTime>) -> bool {
        self.size == size && self.modified == modified
    }
}

#[derive(Debug, Default)]
struct WatcherState {
    /// Files with complete outputs.
    known: HashSet<PathBuf>,
    /// Files handed to the scheduler.
    queued: HashSet<PathBuf>,
    pending: HashMap<PathBuf, PendingFileObservation>,
    scans: u64,
}

/// Clears the scan flag when dropped.
struct ScanGuard<'a>(&'a AtomicBool);

impl<'a> ScanGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ScanGuard(flag))
    }
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum QueueAttempt {
    Queued,
    AlreadyActive,
}

struct WatcherInner {
    config: WatcherConfig,
    scheduler: Scheduler,
    roots: Arc<RootsRegistry>,
    exclude: Vec<Pattern>,
    state: tokio::sync::Mutex<WatcherState>,
    scanning: AtomicBool,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Watches one storage root and queues settled files.
#[derive(Clone)]
pub struct IngestionWatcher {
    inner: Arc<WatcherInner>,
}

impl std::fmt::Debug for IngestionWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionWatcher")
            .field("root_key", &self.inner.config.root_key)
            .field("started", &self.inner.started.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl IngestionWatcher {
    pub fn new(
        config: WatcherConfig,
        scheduler: Scheduler,
        roots: Arc<RootsRegistry>,
    ) -> Result<Self, WatcherError> {
        let exclude = config
            .exclude
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|source| WatcherError::InvalidExclude {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(WatcherInner {
                config,
                scheduler,
                roots,
                exclude,
                state: tokio::sync::Mutex::new(WatcherState::default()),
                scanning: AtomicBool::new(false),
                started: AtomicBool::new(false),
                shutdown_tx,
                task: Mutex::new(None),
            }),
        })
    }

    pub fn root_key(&self) -> &str {
        &self.inner.config.root_key
    }

    /// Seeds state from disk and starts the scan loop.
    ///
    /// Returns `Ok(false)` without starting when the root is unknown or not
    /// an accessible directory.
    pub async fn start(&self) -> Result<bool, WatcherError> {
        let scope = match self.inner.scope().await {
            Ok(scope) => scope,
            Err(e) => {
                warn!(root_key = %self.root_key(), "Watcher disabled: {}", e);
                return Ok(false);
            }
        };
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!(root_key = %self.root_key(), "Watcher already started");
            return Ok(true);
        }

        let (seeded, backfilled) = self.inner.seed(&scope).await?;
        info!(
            root_key = %self.root_key(),
            root = %scope.root.display(),
            known = seeded,
            backfilled,
            "Watcher started"
        );

        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let span = info_span!("watcher", root_key = %self.root_key());
        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(inner.config.poll_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker.tick().await; // skip immediate first tick

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown_rx.changed() => {}
                    }
                    if *shutdown_rx.borrow() {
                        break;
                    }

                    match inner.scan().await {
                        Ok(report) if report.overlapped => debug!("Previous scan still running, tick skipped"),
                        Ok(report) if report.queued > 0 => {
                            info!(queued = report.queued, waiting = report.waiting, "Scan queued files")
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Scan failed: {}", e),
                    }
                }
                debug!("Watcher loop stopped");
            }
            .instrument(span),
        );
        *lock(&self.inner.task) = Some(handle);

        Ok(true)
    }

    /// Runs one scan pass now.
    pub async fn scan_once(&self) -> Result<ScanReport, WatcherError> {
        self.inner.scan().await
    }

    /// Queues every file lacking outputs, ignoring the stability window.
    ///
    /// Files that already have an active job are left alone. Returns the
    /// number of jobs queued.
    pub async fn rescan(&self) -> Result<usize, WatcherError> {
        let scope = self.inner.scope().await?;
        let listed = off_runtime(move || scope.list_with_outputs()).await?;

        let mut state = self.inner.state.lock().await;
        let mut queued = 0;
        for (candidate, done) in listed {
            if done {
                state.known.insert(candidate.path);
                continue;
            }
            match self.inner.queue_file(&candidate) {
                Ok(attempt) => {
                    if matches!(attempt, QueueAttempt::Queued) {
                        queued += 1;
                    }
                    state.pending.remove(&candidate.path);
                    state.queued.insert(candidate.path);
                }
                Err(e) => error!(path = %candidate.path.display(), "Failed to queue file: {}", e),
            }
        }

        info!(root_key = %self.root_key(), queued, "Rescan finished");
        Ok(queued)
    }

    /// Stops the scan loop, letting a scan in progress finish.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let task = lock(&self.inner.task).take();
        if let Some(handle) = task {
            if let Err(e) = handle.await {
                error!("Watcher loop panicked: {}", e);
            }
            info!(root_key = %self.root_key(), "Watcher stopped");
        }
    }
}

impl WatcherInner {
    async fn scope(&self) -> Result<ScanScope, WatcherError> {
        let root = self
            .roots
            .root_path(&self.config.root_key)
            .ok_or_else(|| WatcherError::UnknownRoot(self.config.root_key.clone()))?;

        match tokio::fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => Ok(ScanScope {
                root,
                layout: self.config.layout.clone(),
                exclude: self.exclude.clone(),
            }),
            Ok(_) => Err(WatcherError::RootUnavailable {
                path: root,
                source: std::io::Error::other("not a directory"),
            }),
            Err(source) => Err(WatcherError::RootUnavailable { path: root, source }),
        }
    }

    /// Marks files with outputs as known and optionally queues the rest.
    async fn seed(&self, scope: &ScanScope) -> Result<(usize, usize), WatcherError> {
        let listed = {
            let scope = scope.clone();
            off_runtime(move || scope.list_with_outputs()).await?
        };
        let mut state = self.state.lock().await;
        let mut backfilled = 0;

        for (candidate, done) in listed {
            if done {
                state.known.insert(candidate.path);
                continue;
            }
            if !self.config.backfill_missing_outputs {
                continue;
            }
            match self.queue_file(&candidate) {
                Ok(attempt) => {
                    if matches!(attempt, QueueAttempt::Queued) {
                        backfilled += 1;
                    }
                    state.queued.insert(candidate.path);
                }
                Err(e) => error!(path = %candidate.path.display(), "Backfill failed: {}", e),
            }
        }

        Ok((state.known.len(), backfilled))
    }

    async fn scan(&self) -> Result<ScanReport, WatcherError> {
        let Some(_guard) = ScanGuard::try_acquire(&self.scanning) else {
            return Ok(ScanReport {
                overlapped: true,
                ..ScanReport::default()
            });
        };

        let scope = self.scope().await?;
        let mut state = self.state.lock().await;

        let settled_paths: HashSet<PathBuf> = state.known.union(&state.queued).cloned().collect();
        let pass = {
            let scope = scope.clone();
            off_runtime(move || scope.observe(&settled_paths)).await?
        };
        let now = Instant::now();

        let mut report = ScanReport {
            candidates: pass.present.len(),
            ..ScanReport::default()
        };

        for Observed { candidate, has_outputs, stat } in pass.fresh {
            let Some((size, modified)) = stat else {
                report.errors += 1;
                continue;
            };

            if has_outputs {
                state.pending.remove(&candidate.path);
                state.known.insert(candidate.path);
                report.processed += 1;
                continue;
            }

            let settled = match state.pending.entry(candidate.path.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(PendingFileObservation::new(size, modified, now));
                    false
                }
                Entry::Occupied(mut slot) => {
                    let obs = slot.get_mut();
                    if obs.matches(size, modified) {
                        obs.last_seen_at = now;
                        now.duration_since(obs.first_seen_at) >= self.config.stability_window
                    } else {
                        debug!(
                            path = %candidate.path.display(),
                            since_last_scan = ?now.duration_since(obs.last_seen_at),
                            "File still changing"
                        );
                        *obs = PendingFileObservation::new(size, modified, now);
                        false
                    }
                }
            };

            if !settled {
                report.waiting += 1;
                continue;
            }

            match self.queue_file(&candidate) {
                Ok(attempt) => {
                    match attempt {
                        QueueAttempt::Queued => report.queued += 1,
                        QueueAttempt::AlreadyActive => report.already_active += 1,
                    }
                    state.pending.remove(&candidate.path);
                    state.queued.insert(candidate.path);
                }
                Err(e) => {
                    // The observation stays so the next scan retries.
                    error!(path = %candidate.path.display(), "Failed to queue file: {}", e);
                    report.errors += 1;
                }
            }
        }

        let present = pass.present;
        state.pending.retain(|path, _| present.contains(path));
        state.known.retain(|path| present.contains(path));
        state.queued.retain(|path| present.contains(path));
        state.scans += 1;
        let run_cleanup = self.config.cleanup_every_scans > 0
            && state.scans % u64::from(self.config.cleanup_every_scans) == 0;
        drop(state);

        if run_cleanup {
            report.cleaned = off_runtime(move || scope.cleanup()).await?;
            if report.cleaned > 0 {
                info!(root_key = %self.config.root_key, removed = report.cleaned, "Cleanup removed directories");
            }
        }

        debug!(
            candidates = report.candidates,
            waiting = report.waiting,
            queued = report.queued,
            "Scan finished"
        );
        Ok(report)
    }

    fn queue_file(&self, candidate: &Candidate) -> Result<QueueAttempt, QueueError> {
        let root_key = &self.config.root_key;
        let relative = candidate.relative_str();

        if self.scheduler.has_active_job(root_key, &relative)? {
            debug!(relative = %relative, "File already has an active job");
            return Ok(QueueAttempt::AlreadyActive);
        }

        let payload = json!({
            "path": candidate.path,
            "rootKey": root_key,
            "relativePath": relative,
            "autoOrganize": self.config.auto_organize,
            "mediaKind": candidate.kind.as_str(),
        });
        let options = EnqueueOptions::default()
            .with_priority(self.config.job_priority)
            .with_max_attempts(self.config.job_max_attempts)
            .with_correlation(JobCorrelation::for_file(root_key, &relative));

        let job_id = self.scheduler.enqueue(&self.config.job_type, payload, options)?;
        info!(job_id = %job_id, relative = %relative, kind = %candidate.kind, "Queued media file");
        Ok(QueueAttempt::Queued)
    }
}

/// Owned inputs for the filesystem passes, which run on the blocking pool.
#[derive(Debug, Clone)]
struct ScanScope {
    root: PathBuf,
    layout: OutputLayout,
    exclude: Vec<Pattern>,
}

/// A candidate as seen by one filesystem pass.
struct Observed {
    candidate: Candidate,
    has_outputs: bool,
    /// Size and mtime; `None` when the stat failed.
    stat: Option<(u64, Option<SystemTime>)>,
}

struct ScanPass {
    present: HashSet<PathBuf>,
    /// Candidates not already known or queued.
    fresh: Vec<Observed>,
}

impl ScanScope {
    fn list_with_outputs(&self) -> Vec<(Candidate, bool)> {
        collect_candidates(&self.root, &self.layout, &self.exclude)
            .into_iter()
            .map(|c| {
                let done = self.layout.has_outputs(&self.root, &c.relative);
                (c, done)
            })
            .collect()
    }

    /// Walks the root and stats every candidate outside `settled`.
    fn observe(&self, settled: &HashSet<PathBuf>) -> ScanPass {
        let candidates = collect_candidates(&self.root, &self.layout, &self.exclude);
        let present = candidates.iter().map(|c| c.path.clone()).collect();

        let fresh = candidates
            .into_iter()
            .filter(|c| !settled.contains(&c.path))
            .map(|candidate| match std::fs::metadata(&candidate.path) {
                Ok(meta) => Observed {
                    has_outputs: self.layout.has_outputs(&self.root, &candidate.relative),
                    stat: Some((meta.len(), meta.modified().ok())),
                    candidate,
                },
                Err(e) => {
                    debug!(path = %candidate.path.display(), "Stat failed, retrying next scan: {}", e);
                    Observed {
                        candidate,
                        has_outputs: false,
                        stat: None,
                    }
                }
            })
            .collect();

        ScanPass { present, fresh }
    }

    /// Removes orphaned output directories and empty leftover directories.
    ///
    /// The root itself, the outputs root, staging and hidden directories are
    /// never removed.
    fn cleanup(&self) -> usize {
        let outputs_root = self.layout.outputs_root(&self.root);
        let mut removed = 0;

        if outputs_root.is_dir() {
            for entry in WalkDir::new(&outputs_root)
                .min_depth(1)
                .contents_first(true)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_dir() {
                    continue;
                }
                let dir = entry.path();
                let Ok(relative) = dir.strip_prefix(&outputs_root) else {
                    continue;
                };
                let source = self.root.join(relative);
                if source.is_file() {
                    continue;
                }

                let Ok(mut children) = std::fs::read_dir(dir) else {
                    continue;
                };
                let has_files = children.any(|c| {
                    c.ok()
                        .and_then(|c| c.file_type().ok())
                        .map(|t| !t.is_dir())
                        .unwrap_or(false)
                });

                if has_files && !source.exists() {
                    match std::fs::remove_dir_all(dir) {
                        Ok(()) => {
                            debug!(dir = %dir.display(), "Removed orphaned outputs");
                            removed += 1;
                        }
                        Err(e) => warn!(dir = %dir.display(), "Failed to remove outputs: {}", e),
                    }
                } else if is_empty_dir(dir) && std::fs::remove_dir(dir).is_ok() {
                    removed += 1;
                }
            }
        }

        // Pre-order walk so protected trees are pruned; reversed, children
        // come before their parents.
        let dirs: Vec<PathBuf> = WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !self.is_protected(e.file_name()))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .map(|e| e.into_path())
            .collect();

        for dir in dirs.iter().rev() {
            if is_empty_dir(dir) && std::fs::remove_dir(dir).is_ok() {
                debug!(dir = %dir.display(), "Removed empty directory");
                removed += 1;
            }
        }

        removed
    }

    fn is_protected(&self, name: &std::ffi::OsStr) -> bool {
        name.to_str()
            .map(|n| n.starts_with('.') || self.layout.is_reserved(n))
            .unwrap_or(false)
    }
}

async fn off_runtime<T, F>(f: F) -> Result<T, WatcherError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await?)
}

fn is_empty_dir(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let guard = ScanGuard::try_acquire(&flag).unwrap();
        assert!(ScanGuard::try_acquire(&flag).is_none());
        drop(guard);
        assert!(ScanGuard::try_acquire(&flag).is_some());
    }

    #[test]
    fn test_observation_matching() {
        let now = Instant::now();
        let mtime = SystemTime::now();
        let obs = PendingFileObservation::new(10, Some(mtime), now);
        assert!(obs.matches(10, Some(mtime)));
        assert!(!obs.matches(11, Some(mtime)));
        assert!(!obs.matches(10, None));
    }

    #[test]
    fn test_observe_stats_only_unsettled_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::write(root.join("new.mkv"), b"12345").unwrap();
        std::fs::write(root.join("queued.mkv"), b"1").unwrap();

        let scope = ScanScope {
            root: root.clone(),
            layout: OutputLayout::default(),
            exclude: Vec::new(),
        };
        let settled: HashSet<PathBuf> = [root.join("queued.mkv")].into_iter().collect();
        let pass = scope.observe(&settled);

        assert_eq!(pass.present.len(), 2);
        assert_eq!(pass.fresh.len(), 1);
        assert_eq!(pass.fresh[0].candidate.relative_str(), "new.mkv");
        assert!(!pass.fresh[0].has_outputs);
        assert_eq!(pass.fresh[0].stat.map(|(size, _)| size), Some(5));
    }

    #[test]
    fn test_config_from_settings() {
        let settings = WatcherSettings {
            auto_organize: true,
            cleanup_every_scans: 3,
            ..WatcherSettings::default()
        };
        let config = WatcherConfig::from_settings("movies", &settings);
        assert_eq!(config.root_key, "movies");
        assert!(config.auto_organize);
        assert_eq!(config.cleanup_every_scans, 3);
        assert_eq!(config.job_type, PROCESS_MEDIA_JOB);
    }
}
