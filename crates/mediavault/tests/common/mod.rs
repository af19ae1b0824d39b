//! Shared test utilities for mediavault integration tests.
//!
//! `TestHarness` owns a temp directory holding a storage root and a
//! file-backed database, so a second scheduler can reopen the same store.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use mediavault::db::Database;
use mediavault::queue::{handler_fn, JobHandler, RetryPolicy};
use mediavault::watcher::OutputLayout;
use mediavault::{HandlerError, RootsRegistry, Scheduler, SchedulerConfig};

pub const ROOT_KEY: &str = "movies";

pub struct TestHarness {
    temp_dir: TempDir,
    /// Directory registered under [`ROOT_KEY`].
    pub root: PathBuf,
    pub db: Database,
    pub roots: Arc<RootsRegistry>,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path().join("library");
        std::fs::create_dir_all(&root).expect("Failed to create root dir");

        let db = Database::open(&temp_dir.path().join("mediavault.db")).expect("Failed to open database");
        let roots = Arc::new(RootsRegistry::new());
        roots.register_root(ROOT_KEY, &root);

        Self {
            temp_dir,
            root,
            db,
            roots,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.temp_dir.path().join("mediavault.db")
    }

    /// Opens a second connection to the same database file.
    pub fn reopen_db(&self) -> Database {
        Database::open(&self.db_path()).expect("Failed to reopen database")
    }

    pub fn scheduler(&self, concurrency: usize) -> Scheduler {
        Scheduler::new(self.db.clone(), test_scheduler_config(concurrency))
    }

    /// Writes a media file under the root, creating parent directories.
    pub fn write_media(&self, relative: &str, content: &[u8]) -> PathBuf {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create media dir");
        }
        std::fs::write(&path, content).expect("Failed to write media file");
        path
    }

    /// Creates every required output artifact for a file.
    pub fn write_outputs(&self, relative: &str) -> PathBuf {
        let layout = OutputLayout::default();
        let dir = layout.output_dir(&self.root, Path::new(relative));
        std::fs::create_dir_all(&dir).expect("Failed to create output dir");
        for name in layout.required_artifacts() {
            std::fs::write(dir.join(name), b"{}").expect("Failed to write artifact");
        }
        dir
    }
}

pub fn test_scheduler_config(concurrency: usize) -> SchedulerConfig {
    SchedulerConfig {
        concurrency,
        poll_interval: Duration::from_millis(20),
        retry_policy: RetryPolicy::Immediate,
    }
}

/// Shared counters observed by [`counting_handler`].
#[derive(Clone, Default)]
pub struct Counters {
    pub calls: Arc<AtomicUsize>,
    pub running: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
    /// `name` payload fields in execution order.
    pub order: Arc<Mutex<Vec<String>>>,
    /// Attempt numbers seen, in execution order.
    pub attempts: Arc<Mutex<Vec<u32>>>,
}

impl Counters {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> Vec<u32> {
        self.attempts.lock().unwrap().clone()
    }
}

/// Handler that sleeps for `delay` and fails its first `fail_first` calls.
pub fn counting_handler(counters: Counters, delay: Duration, fail_first: usize) -> impl JobHandler {
    handler_fn(move |payload: Value, ctx| {
        let counters = counters.clone();
        async move {
            let call = counters.calls.fetch_add(1, Ordering::SeqCst);
            let running = counters.running.fetch_add(1, Ordering::SeqCst) + 1;
            counters.peak.fetch_max(running, Ordering::SeqCst);
            if let Some(name) = payload.get("name").and_then(Value::as_str) {
                counters.order.lock().unwrap().push(name.to_string());
            }
            counters.attempts.lock().unwrap().push(ctx.attempt);

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            counters.running.fetch_sub(1, Ordering::SeqCst);

            if call < fail_first {
                return Err(HandlerError::new(format!("planned failure {}", call + 1)));
            }
            Ok(serde_json::json!({ "call": call + 1 }))
        }
    })
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn wait_for<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
