//! Integration tests for the persistent job scheduler.

mod common;

use std::time::Duration;

use serde_json::json;

use common::{counting_handler, test_scheduler_config, wait_for, Counters, TestHarness};
use mediavault::db::job_repo;
use mediavault::queue::{JobListFilter, RetryPolicy};
use mediavault::{EnqueueOptions, JobOutcome, JobStatus, QueueError, Scheduler, SchedulerConfig};

const WAIT: Duration = Duration::from_secs(5);

fn status_of(scheduler: &Scheduler, id: &str) -> JobStatus {
    scheduler.get_job(id).unwrap().unwrap().status
}

#[tokio::test]
async fn test_every_job_runs_exactly_once() {
    let harness = TestHarness::new();
    let scheduler = harness.scheduler(4);
    let counters = Counters::default();
    scheduler
        .register_handler("work", counting_handler(counters.clone(), Duration::from_millis(5), 0))
        .unwrap();

    let ids: Vec<String> = (0..20)
        .map(|i| {
            scheduler
                .enqueue("work", json!({ "name": format!("job-{}", i) }), EnqueueOptions::default())
                .unwrap()
        })
        .collect();

    scheduler.start().unwrap();
    // Extra dispatch passes racing the loop must not double-claim.
    for _ in 0..5 {
        scheduler.dispatch_now().await.unwrap();
    }
    assert!(wait_for(WAIT, || scheduler.get_stats().unwrap().completed == 20).await);
    scheduler.stop().await;

    assert_eq!(counters.calls(), 20);
    let mut seen = counters.order();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 20);
    for id in &ids {
        let job = scheduler.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
    }
}

#[tokio::test]
async fn test_concurrency_ceiling_is_respected() {
    let harness = TestHarness::new();
    let scheduler = harness.scheduler(2);
    let counters = Counters::default();
    scheduler
        .register_handler("slow", counting_handler(counters.clone(), Duration::from_millis(40), 0))
        .unwrap();

    for i in 0..8 {
        scheduler
            .enqueue("slow", json!({ "name": i.to_string() }), EnqueueOptions::default())
            .unwrap();
    }
    scheduler.start().unwrap();
    assert!(wait_for(WAIT, || counters.calls() == 8).await);
    scheduler.stop().await;

    assert_eq!(counters.peak(), 2);
    assert_eq!(scheduler.get_stats().unwrap().completed, 8);
}

#[tokio::test]
async fn test_higher_priority_runs_first() {
    let harness = TestHarness::new();
    let scheduler = harness.scheduler(1);
    let counters = Counters::default();
    scheduler
        .register_handler("work", counting_handler(counters.clone(), Duration::ZERO, 0))
        .unwrap();

    for (name, priority) in [("low-a", 9), ("mid", 5), ("high", 1), ("low-b", 9)] {
        scheduler
            .enqueue("work", json!({ "name": name }), EnqueueOptions::default().with_priority(priority))
            .unwrap();
    }

    scheduler.start().unwrap();
    assert!(wait_for(WAIT, || counters.calls() == 4).await);
    scheduler.stop().await;

    assert_eq!(counters.order(), vec!["high", "mid", "low-a", "low-b"]);
}

#[tokio::test]
async fn test_retries_until_attempts_exhausted() {
    let harness = TestHarness::new();
    let scheduler = harness.scheduler(1);
    let counters = Counters::default();
    scheduler
        .register_handler("flaky", counting_handler(counters.clone(), Duration::ZERO, usize::MAX))
        .unwrap();

    let id = scheduler
        .enqueue("flaky", json!({}), EnqueueOptions::default().with_max_attempts(3))
        .unwrap();
    let outcome = scheduler.subscribe(&id).unwrap();

    scheduler.start().unwrap();
    let outcome = tokio::time::timeout(WAIT, outcome).await.unwrap().unwrap();
    scheduler.stop().await;

    assert_eq!(outcome, JobOutcome::Failed("planned failure 3".to_string()));
    assert_eq!(counters.attempts(), vec![1, 2, 3]);

    let job = scheduler.get_job(&id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error_message.as_deref(), Some("planned failure 3"));
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn test_fails_twice_then_succeeds() {
    let harness = TestHarness::new();
    let scheduler = harness.scheduler(1);
    let counters = Counters::default();
    scheduler
        .register_handler("flaky", counting_handler(counters.clone(), Duration::ZERO, 2))
        .unwrap();

    let id = scheduler
        .enqueue("flaky", json!({}), EnqueueOptions::default())
        .unwrap();
    let outcome = scheduler.subscribe(&id).unwrap();

    scheduler.start().unwrap();
    let outcome = tokio::time::timeout(WAIT, outcome).await.unwrap().unwrap();
    scheduler.stop().await;

    assert_eq!(outcome, JobOutcome::Completed(Some(json!({ "call": 3 }))));
    let job = scheduler.get_job(&id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error_message, None);
}

#[tokio::test]
async fn test_retry_backoff_delays_next_attempt() {
    let harness = TestHarness::new();
    let scheduler = Scheduler::new(
        harness.db.clone(),
        SchedulerConfig {
            retry_policy: RetryPolicy::Fixed(Duration::from_secs(3600)),
            ..test_scheduler_config(1)
        },
    );
    let counters = Counters::default();
    scheduler
        .register_handler("flaky", counting_handler(counters.clone(), Duration::ZERO, 1))
        .unwrap();
    let id = scheduler
        .enqueue("flaky", json!({}), EnqueueOptions::default())
        .unwrap();

    assert_eq!(scheduler.dispatch_now().await.unwrap(), 1);
    scheduler.wait_idle().await;

    let job = scheduler.get_job(&id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.available_at.is_some());
    assert_eq!(scheduler.dispatch_now().await.unwrap(), 0);
    assert_eq!(counters.calls(), 1);
}

#[tokio::test]
async fn test_interrupted_job_resumes_with_next_attempt() {
    let harness = TestHarness::new();
    let first = harness.scheduler(1);
    first
        .register_handler("work", counting_handler(Counters::default(), Duration::ZERO, 0))
        .unwrap();
    let id = first
        .enqueue("work", json!({ "name": "interrupted" }), EnqueueOptions::default())
        .unwrap();

    // Simulate a crash mid-execution: claimed, never finished.
    let claimed = job_repo::claim_pending(&harness.db, 1, "2026-01-01T00:00:00.000000Z").unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(status_of(&first, &id), JobStatus::Processing);
    drop(first);

    let restarted = Scheduler::new(harness.reopen_db(), test_scheduler_config(1));
    let counters = Counters::default();
    restarted
        .register_handler("work", counting_handler(counters.clone(), Duration::ZERO, 0))
        .unwrap();
    let outcome = restarted.subscribe(&id).unwrap();
    restarted.start().unwrap();

    let outcome = tokio::time::timeout(WAIT, outcome).await.unwrap().unwrap();
    restarted.stop().await;

    assert!(matches!(outcome, JobOutcome::Completed(_)));
    assert_eq!(counters.attempts(), vec![2]);
    assert_eq!(restarted.get_job(&id).unwrap().unwrap().attempts, 2);
}

#[tokio::test]
async fn test_job_interrupted_on_final_attempt_is_failed() {
    let harness = TestHarness::new();
    let scheduler = harness.scheduler(1);
    let counters = Counters::default();
    scheduler
        .register_handler("work", counting_handler(counters.clone(), Duration::ZERO, 0))
        .unwrap();
    let id = scheduler
        .enqueue("work", json!({}), EnqueueOptions::default().with_max_attempts(1))
        .unwrap();
    job_repo::claim_pending(&harness.db, 1, "2026-01-01T00:00:00.000000Z").unwrap();

    assert_eq!(scheduler.recover_orphans().unwrap(), 0);
    let job = scheduler.get_job(&id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("interrupted"));
    assert_eq!(counters.calls(), 0);
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_jobs() {
    let harness = TestHarness::new();
    let scheduler = harness.scheduler(2);
    let counters = Counters::default();
    scheduler
        .register_handler("slow", counting_handler(counters.clone(), Duration::from_millis(150), 0))
        .unwrap();
    let ids: Vec<String> = (0..2)
        .map(|_| scheduler.enqueue("slow", json!({}), EnqueueOptions::default()).unwrap())
        .collect();

    scheduler.start().unwrap();
    assert!(wait_for(WAIT, || scheduler.in_flight() == 2).await);
    scheduler.stop().await;

    assert_eq!(scheduler.in_flight(), 0);
    assert!(!scheduler.is_running());
    for id in &ids {
        assert_eq!(status_of(&scheduler, id), JobStatus::Completed);
    }

    // Nothing is dispatched after stop.
    let late = scheduler.enqueue("slow", json!({}), EnqueueOptions::default()).unwrap();
    assert_eq!(scheduler.dispatch_now().await.unwrap(), 0);
    assert_eq!(status_of(&scheduler, &late), JobStatus::Pending);
}

#[tokio::test]
async fn test_subscribe_sees_completion() {
    let harness = TestHarness::new();
    let scheduler = harness.scheduler(1);
    scheduler
        .register_handler("work", counting_handler(Counters::default(), Duration::from_millis(20), 0))
        .unwrap();
    let id = scheduler.enqueue("work", json!({}), EnqueueOptions::default()).unwrap();

    let first = scheduler.subscribe(&id).unwrap();
    let second = scheduler.subscribe(&id).unwrap();
    scheduler.start().unwrap();

    let a = tokio::time::timeout(WAIT, first).await.unwrap().unwrap();
    let b = tokio::time::timeout(WAIT, second).await.unwrap().unwrap();
    scheduler.stop().await;

    assert_eq!(a, JobOutcome::Completed(Some(json!({ "call": 1 }))));
    assert_eq!(a, b);
    assert!(matches!(scheduler.subscribe("missing"), Err(QueueError::NotFound(_))));
}

#[tokio::test]
async fn test_delete_and_retry_rules() {
    let harness = TestHarness::new();
    // Two slots so one dispatch pass settles both jobs.
    let scheduler = harness.scheduler(2);
    scheduler
        .register_handler("fail", counting_handler(Counters::default(), Duration::ZERO, usize::MAX))
        .unwrap();
    scheduler
        .register_handler("ok", counting_handler(Counters::default(), Duration::ZERO, 0))
        .unwrap();

    let pending = scheduler.enqueue("ok", json!({}), EnqueueOptions::default()).unwrap();
    let subscription = scheduler.subscribe(&pending).unwrap();
    scheduler.delete_job(&pending).unwrap();
    assert!(scheduler.get_job(&pending).unwrap().is_none());
    assert!(subscription.await.is_err());

    let failed = scheduler
        .enqueue("fail", json!({}), EnqueueOptions::default().with_max_attempts(1))
        .unwrap();
    let completed = scheduler.enqueue("ok", json!({}), EnqueueOptions::default()).unwrap();
    scheduler.dispatch_now().await.unwrap();
    scheduler.wait_idle().await;

    assert_eq!(status_of(&scheduler, &failed), JobStatus::Failed);
    assert_eq!(status_of(&scheduler, &completed), JobStatus::Completed);
    assert!(matches!(
        scheduler.delete_job(&completed),
        Err(QueueError::InvalidState { .. })
    ));

    scheduler.retry_job(&failed).unwrap();
    let job = scheduler.get_job(&failed).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert!(job.completed_at.is_none());

    scheduler.delete_job(&failed).unwrap();
    assert!(matches!(scheduler.delete_job(&failed), Err(QueueError::NotFound(_))));
}

#[tokio::test]
async fn test_clear_completed_keeps_recent_and_unfinished_jobs() {
    let harness = TestHarness::new();
    let scheduler = harness.scheduler(1);
    scheduler
        .register_handler("ok", counting_handler(Counters::default(), Duration::ZERO, 0))
        .unwrap();

    let old = scheduler.enqueue("ok", json!({}), EnqueueOptions::default()).unwrap();
    let recent = scheduler.enqueue("ok", json!({}), EnqueueOptions::default()).unwrap();
    scheduler.dispatch_now().await.unwrap();
    scheduler.wait_idle().await;
    let pending = scheduler.enqueue("ok", json!({}), EnqueueOptions::default()).unwrap();

    harness
        .db
        .with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET completed_at = '2020-01-01T00:00:00.000000Z' WHERE id = ?1",
                [&old],
            )?;
            Ok(())
        })
        .unwrap();

    assert_eq!(scheduler.clear_completed(7).unwrap(), 1);
    assert!(scheduler.get_job(&old).unwrap().is_none());
    assert!(scheduler.get_job(&recent).unwrap().is_some());
    assert!(scheduler.get_job(&pending).unwrap().is_some());
}

#[tokio::test]
async fn test_list_jobs_and_stats() {
    let harness = TestHarness::new();
    let scheduler = harness.scheduler(1);
    scheduler
        .register_handler("ok", counting_handler(Counters::default(), Duration::ZERO, 0))
        .unwrap();
    scheduler
        .register_handler("other", counting_handler(Counters::default(), Duration::ZERO, 0))
        .unwrap();

    for _ in 0..3 {
        scheduler.enqueue("ok", json!({}), EnqueueOptions::default()).unwrap();
    }
    scheduler.enqueue("other", json!({}), EnqueueOptions::default()).unwrap();

    let (page, total) = scheduler
        .list_jobs(&JobListFilter {
            job_type: Some("ok".to_string()),
            limit: Some(2),
            ..JobListFilter::default()
        })
        .unwrap();
    assert_eq!(total, 3);
    assert_eq!(page.len(), 2);
    assert!(page.iter().all(|j| j.job_type == "ok"));

    let stats = scheduler.get_stats().unwrap();
    assert_eq!(stats.pending, 4);
    assert_eq!(stats.total(), 4);
}
