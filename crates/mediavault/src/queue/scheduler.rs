//! Persistent job scheduler.
//!
//! Jobs live in the `jobs` table; the scheduler claims due jobs in priority
//! order, runs their handlers on separate tasks and records the outcome.
//! Dispatch passes are serialized and bounded by the concurrency limit, and
//! each finished job wakes the dispatcher so free slots fill immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::JobSettings;
use crate::db::job_repo::{self, JobFilter, JobRow};
use crate::db::{format_timestamp, Database};
use crate::error::{HandlerError, QueueError};
use crate::queue::handler::{JobContext, JobHandler};
use crate::queue::job::{
    EnqueueOptions, Job, JobListFilter, JobOutcome, JobStats, JobStatus, RetryPolicy,
};

/// Tuning for a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum handler executions at once.
    pub concurrency: usize,
    /// Interval of the periodic dispatch pass.
    pub poll_interval: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: crate::config::default_concurrency(),
            poll_interval: Duration::from_secs(5),
            retry_policy: RetryPolicy::Immediate,
        }
    }
}

impl From<&JobSettings> for SchedulerConfig {
    fn from(settings: &JobSettings) -> Self {
        Self {
            concurrency: settings.concurrency.max(1),
            poll_interval: settings.poll_interval,
            retry_policy: settings.retry_policy(),
        }
    }
}

type Waiters = HashMap<String, Vec<oneshot::Sender<JobOutcome>>>;

struct Inner {
    db: Database,
    config: SchedulerConfig,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    started: AtomicBool,
    running: AtomicBool,
    in_flight: AtomicUsize,
    dispatch_lock: tokio::sync::Mutex<()>,
    wake: Notify,
    idle: Notify,
    shutdown_tx: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    waiters: Mutex<Waiters>,
}

/// Cloneable handle to the job scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(db: Database, config: SchedulerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                db,
                config,
                handlers: RwLock::new(HashMap::new()),
                started: AtomicBool::new(false),
                running: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                dispatch_lock: tokio::sync::Mutex::new(()),
                wake: Notify::new(),
                idle: Notify::new(),
                shutdown_tx,
                ticker: Mutex::new(None),
                waiters: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Associates a job type with its handler. Only allowed before `start`.
    pub fn register_handler<H>(&self, job_type: impl Into<String>, handler: H) -> Result<(), QueueError>
    where
        H: JobHandler,
    {
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(QueueError::AlreadyStarted);
        }
        let job_type = job_type.into();
        debug!(job_type = %job_type, "Registered job handler");
        write_lock(&self.inner.handlers).insert(job_type, Arc::new(handler));
        Ok(())
    }

    pub fn has_handler(&self, job_type: &str) -> bool {
        read_lock(&self.inner.handlers).contains_key(job_type)
    }

    /// Persists a new pending job and wakes the dispatcher.
    pub fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<String, QueueError> {
        if !self.has_handler(job_type) {
            return Err(QueueError::UnknownJobType(job_type.to_string()));
        }

        let row = JobRow {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: job_type.to_string(),
            payload: serde_json::to_string(&payload)?,
            priority: options.priority,
            status: JobStatus::Pending.as_str().to_string(),
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
            created_at: format_timestamp(Utc::now()),
            started_at: None,
            completed_at: None,
            available_at: None,
            error_message: None,
            result: None,
            video_id: options.correlation.video_id,
            root_key: options.correlation.root_key,
            relative_path: options.correlation.relative_path,
        };
        job_repo::insert(&self.inner.db, &row)?;

        debug!(
            job_id = %row.id,
            job_type,
            priority = row.priority,
            "Enqueued job"
        );

        if self.inner.running.load(Ordering::SeqCst) {
            self.inner.wake.notify_one();
        }
        Ok(row.id)
    }

    /// Recovers orphaned jobs and begins dispatching.
    ///
    /// Must be called from within a Tokio runtime. Calling it again, or after
    /// `stop`, only logs a warning.
    pub fn start(&self) -> Result<(), QueueError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already started");
            return Ok(());
        }

        if let Err(e) = self.recover_orphans() {
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.inner.running.store(true, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // skip immediate first tick

            loop {
                if let Err(e) = Inner::dispatch(&inner).await {
                    warn!(error = %e, "Dispatch pass failed");
                }

                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = inner.wake.notified() => {}
                    _ = shutdown_rx.changed() => {}
                }

                if *shutdown_rx.borrow() {
                    break;
                }
            }
            debug!("Dispatch loop stopped");
        });
        *lock(&self.inner.ticker) = Some(handle);

        info!(
            concurrency = self.inner.config.concurrency,
            poll_interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            "Scheduler started"
        );
        Ok(())
    }

    /// Stops dispatching and waits for every in-flight job to finish.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(in_flight = self.in_flight(), "Stopping scheduler");
        let _ = self.inner.shutdown_tx.send(true);

        let ticker = lock(&self.inner.ticker).take();
        if let Some(handle) = ticker {
            if let Err(e) = handle.await {
                error!("Dispatch loop panicked: {}", e);
            }
        }

        self.wait_idle().await;
        info!("Scheduler stopped");
    }

    /// Waits until no handler is executing.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Runs one dispatch pass now and returns how many jobs were launched.
    pub async fn dispatch_now(&self) -> Result<usize, QueueError> {
        Inner::dispatch(&self.inner).await
    }

    /// Returns every `processing` job to `pending`.
    ///
    /// Jobs interrupted during their final attempt are failed instead, so the
    /// attempt budget is never exceeded. Returns the number of jobs reset.
    pub fn recover_orphans(&self) -> Result<usize, QueueError> {
        let now = format_timestamp(Utc::now());
        let counts = job_repo::recover_processing(&self.inner.db, &now)?;
        if counts.reset > 0 || counts.exhausted > 0 {
            info!(
                reset = counts.reset,
                exhausted = counts.exhausted,
                "Recovered jobs interrupted by shutdown"
            );
        }
        Ok(counts.reset)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        Ok(job_repo::find_by_id(&self.inner.db, id)?.map(Job::from))
    }

    /// Lists jobs newest first; returns the page and the total match count.
    pub fn list_jobs(&self, filter: &JobListFilter) -> Result<(Vec<Job>, u64), QueueError> {
        let (rows, total) = job_repo::query(
            &self.inner.db,
            &JobFilter {
                status: filter.status.map(|s| s.as_str().to_string()),
                job_type: filter.job_type.clone(),
                limit: filter.limit,
                offset: filter.offset,
            },
        )?;
        Ok((rows.into_iter().map(Job::from).collect(), total))
    }

    /// Returns a failed job to the queue with a fresh attempt budget.
    pub fn retry_job(&self, id: &str) -> Result<(), QueueError> {
        let job = self.require_job(id)?;
        if job.status != JobStatus::Failed || !job_repo::reset_failed(&self.inner.db, id)? {
            return Err(QueueError::InvalidState {
                id: id.to_string(),
                status: job.status.to_string(),
            });
        }
        info!(job_id = id, "Job requeued for retry");
        if self.is_running() {
            self.inner.wake.notify_one();
        }
        Ok(())
    }

    /// Deletes a pending or failed job.
    pub fn delete_job(&self, id: &str) -> Result<(), QueueError> {
        let job = self.require_job(id)?;
        let deletable = matches!(job.status, JobStatus::Pending | JobStatus::Failed);
        if !deletable || !job_repo::delete_if_inactive(&self.inner.db, id)? {
            let status = self
                .get_job(id)?
                .map(|j| j.status)
                .unwrap_or(job.status);
            return Err(QueueError::InvalidState {
                id: id.to_string(),
                status: status.to_string(),
            });
        }
        // Dropping the senders closes any outstanding subscriptions.
        lock(&self.inner.waiters).remove(id);
        debug!(job_id = id, "Deleted job");
        Ok(())
    }

    /// Deletes completed jobs older than `older_than_days`.
    pub fn clear_completed(&self, older_than_days: u32) -> Result<usize, QueueError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
        let deleted = job_repo::delete_completed_before(&self.inner.db, &format_timestamp(cutoff))?;
        if deleted > 0 {
            info!(deleted, older_than_days, "Cleared completed jobs");
        }
        Ok(deleted)
    }

    /// True when a pending or processing job targets the given file.
    pub fn has_active_job(&self, root_key: &str, relative_path: &str) -> Result<bool, QueueError> {
        Ok(job_repo::has_active_for_location(
            &self.inner.db,
            root_key,
            relative_path,
        )?)
    }

    pub fn get_stats(&self) -> Result<JobStats, QueueError> {
        let counts = job_repo::count_by_status(&self.inner.db)?;
        Ok(JobStats::from_counts(&counts, self.in_flight()))
    }

    /// Resolves once the job reaches `completed` or `failed`.
    ///
    /// Fires immediately for jobs that are already terminal. The receiver
    /// errors if the job is deleted first.
    pub fn subscribe(&self, job_id: &str) -> Result<oneshot::Receiver<JobOutcome>, QueueError> {
        let (tx, rx) = oneshot::channel();
        // Holding the waiters lock across the status read pairs with
        // `notify_waiters`, which updates the row before taking the lock.
        let mut waiters = lock(&self.inner.waiters);
        let job = self.require_job(job_id)?;
        match JobOutcome::from_job(&job) {
            Some(outcome) => {
                let _ = tx.send(outcome);
            }
            None => waiters.entry(job_id.to_string()).or_default().push(tx),
        }
        Ok(rx)
    }

    fn require_job(&self, id: &str) -> Result<Job, QueueError> {
        self.get_job(id)?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }
}

impl Inner {
    fn shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn handler_for(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        read_lock(&self.handlers).get(job_type).cloned()
    }

    async fn dispatch(inner: &Arc<Inner>) -> Result<usize, QueueError> {
        let _guard = inner.dispatch_lock.lock().await;
        if inner.shutting_down() {
            return Ok(0);
        }

        let in_flight = inner.in_flight.load(Ordering::SeqCst);
        let slots = inner.config.concurrency.saturating_sub(in_flight);
        if slots == 0 {
            return Ok(0);
        }

        let now = format_timestamp(Utc::now());
        let claimed = job_repo::claim_pending(&inner.db, slots, &now)?;
        let mut launched = 0;

        for row in claimed {
            let job = Job::from(row);
            let Some(handler) = inner.handler_for(&job.job_type) else {
                let message = QueueError::UnknownJobType(job.job_type.clone()).to_string();
                error!(job_id = %job.id, job_type = %job.job_type, "Failing job without handler");
                match job_repo::mark_failed(&inner.db, &job.id, &message, &now) {
                    Ok(()) => inner.notify_waiters(&job.id, JobOutcome::Failed(message)),
                    Err(e) => error!(job_id = %job.id, error = %e, "Failed to record job failure"),
                }
                continue;
            };

            inner.in_flight.fetch_add(1, Ordering::SeqCst);
            launched += 1;
            tokio::spawn(Inner::execute(Arc::clone(inner), handler, job));
        }

        if launched > 0 {
            debug!(launched, in_flight = in_flight + launched, "Dispatched jobs");
        }
        Ok(launched)
    }

    async fn execute(inner: Arc<Inner>, handler: Arc<dyn JobHandler>, job: Job) {
        let ctx = JobContext {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            attempt: job.attempts,
            max_attempts: job.max_attempts,
            video_id: job.correlation.video_id,
        };
        let span = info_span!(
            "job",
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts
        );
        let payload = job.payload.clone();

        // Running the handler on its own task turns a panic into a failure.
        let task = tokio::spawn(async move { handler.handle(payload, ctx).await }.instrument(span));
        let result = match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(HandlerError::new(format!(
                "handler panicked: {}",
                panic_message(e.into_panic())
            ))),
            Err(e) => Err(HandlerError::new(format!("handler task aborted: {}", e))),
        };

        let outcome = inner.record_result(&job, result);

        inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        inner.idle.notify_waiters();

        if let Some(outcome) = outcome {
            inner.notify_waiters(&job.id, outcome);
        }
        inner.wake.notify_one();
    }

    /// Persists a handler result; returns the outcome when it is terminal.
    fn record_result(&self, job: &Job, result: Result<Value, HandlerError>) -> Option<JobOutcome> {
        let now = Utc::now();
        let stamp = format_timestamp(now);

        match result {
            Ok(value) => {
                let value = (!value.is_null()).then_some(value);
                let encoded = value.as_ref().map(Value::to_string);
                if let Err(e) = job_repo::mark_completed(&self.db, &job.id, encoded.as_deref(), &stamp) {
                    error!(job_id = %job.id, error = %e, "Failed to record job completion");
                    return None;
                }
                info!(job_id = %job.id, job_type = %job.job_type, "Job completed");
                Some(JobOutcome::Completed(value))
            }
            Err(err) if job.attempts < job.max_attempts => {
                let delay = self.config.retry_policy.delay_for(job.attempts);
                let available_at = (!delay.is_zero()).then(|| {
                    let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
                    format_timestamp(now.checked_add_signed(delay).unwrap_or(now))
                });
                if let Err(e) = job_repo::mark_retry(&self.db, &job.id, &err.0, available_at.as_deref()) {
                    error!(job_id = %job.id, error = %e, "Failed to schedule job retry");
                    return None;
                }
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "Job attempt failed, will retry"
                );
                None
            }
            Err(err) => {
                if let Err(e) = job_repo::mark_failed(&self.db, &job.id, &err.0, &stamp) {
                    error!(job_id = %job.id, error = %e, "Failed to record job failure");
                    return None;
                }
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    error = %err,
                    "Job failed permanently"
                );
                Some(JobOutcome::Failed(err.0))
            }
        }
    }

    fn notify_waiters(&self, job_id: &str, outcome: JobOutcome) {
        let senders = lock(&self.waiters).remove(job_id);
        for tx in senders.into_iter().flatten() {
            let _ = tx.send(outcome.clone());
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::handler::handler_fn;
    use serde_json::json;

    fn scheduler() -> Scheduler {
        let db = Database::open_in_memory().unwrap();
        Scheduler::new(
            db,
            SchedulerConfig {
                concurrency: 2,
                poll_interval: Duration::from_millis(50),
                retry_policy: RetryPolicy::Immediate,
            },
        )
    }

    fn noop() -> impl JobHandler {
        handler_fn(|_payload, _ctx| async { Ok(Value::Null) })
    }

    #[test]
    fn test_enqueue_unknown_type_fails_fast() {
        let scheduler = scheduler();
        let err = scheduler
            .enqueue("missing", json!({}), EnqueueOptions::default())
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownJobType(t) if t == "missing"));
    }

    #[test]
    fn test_enqueue_persists_pending_job() {
        let scheduler = scheduler();
        scheduler.register_handler("noop", noop()).unwrap();
        let id = scheduler
            .enqueue("noop", json!({"n": 1}), EnqueueOptions::default().with_priority(2))
            .unwrap();

        let job = scheduler.get_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 2);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.payload, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_register_after_start_is_rejected() {
        let scheduler = scheduler();
        scheduler.start().unwrap();
        let err = scheduler.register_handler("late", noop()).unwrap_err();
        assert!(matches!(err, QueueError::AlreadyStarted));
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_dispatch_now_completes_job() {
        let scheduler = scheduler();
        scheduler
            .register_handler(
                "echo",
                handler_fn(|payload, _ctx| async move { Ok(json!({ "echo": payload })) }),
            )
            .unwrap();
        let id = scheduler
            .enqueue("echo", json!("hi"), EnqueueOptions::default())
            .unwrap();

        assert_eq!(scheduler.dispatch_now().await.unwrap(), 1);
        scheduler.wait_idle().await;

        let job = scheduler.get_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({ "echo": "hi" })));
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_panicking_handler_counts_as_failure() {
        let scheduler = scheduler();
        scheduler
            .register_handler(
                "explode",
                handler_fn(|_payload, _ctx| async move {
                    if true {
                        panic!("kaboom");
                    }
                    Ok(Value::Null)
                }),
            )
            .unwrap();
        let id = scheduler
            .enqueue(
                "explode",
                json!({}),
                EnqueueOptions::default().with_max_attempts(1),
            )
            .unwrap();

        scheduler.dispatch_now().await.unwrap();
        scheduler.wait_idle().await;

        let job = scheduler.get_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_persisted_job_without_handler_fails_terminally() {
        let scheduler = scheduler();
        scheduler.register_handler("known", noop()).unwrap();
        let id = scheduler
            .enqueue("known", json!({}), EnqueueOptions::default())
            .unwrap();
        scheduler
            .inner
            .db
            .with_conn(|conn| {
                conn.execute("UPDATE jobs SET job_type = 'retired' WHERE id = ?1", [&id])?;
                Ok(())
            })
            .unwrap();

        assert_eq!(scheduler.dispatch_now().await.unwrap(), 0);
        let job = scheduler.get_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("retired"));
    }

    #[tokio::test]
    async fn test_retry_job_requires_failed_status() {
        let scheduler = scheduler();
        scheduler.register_handler("noop", noop()).unwrap();
        let id = scheduler
            .enqueue("noop", json!({}), EnqueueOptions::default())
            .unwrap();

        assert!(matches!(
            scheduler.retry_job(&id),
            Err(QueueError::InvalidState { .. })
        ));
        assert!(matches!(
            scheduler.retry_job("nope"),
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_to_terminal_job_fires_immediately() {
        let scheduler = scheduler();
        scheduler.register_handler("noop", noop()).unwrap();
        let id = scheduler
            .enqueue("noop", json!({}), EnqueueOptions::default())
            .unwrap();
        scheduler.dispatch_now().await.unwrap();
        scheduler.wait_idle().await;

        let outcome = scheduler.subscribe(&id).unwrap().await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed(None));
    }

    #[test]
    fn test_scheduler_config_from_settings() {
        let settings = JobSettings {
            concurrency: 0,
            ..JobSettings::default()
        };
        let config = SchedulerConfig::from(&settings);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.retry_policy, RetryPolicy::Immediate);
    }
}
