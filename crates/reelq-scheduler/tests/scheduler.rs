//! End-to-end scheduler scenarios against the in-memory store.

use reelq_core::{ClaimedJob, JobId, JobOutcome, JobPayload, JobState};
use reelq_db::{ConnectionPool, DbError, FaultKind, MemoryStore, RetryPolicy, StatementKind};
use reelq_scheduler::{
    JobFunction, ProgressReporter, Scheduler, SchedulerConfig, SchedulerError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn config(batch_size: usize, workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        batch_size,
        workers,
        poll_interval: Duration::from_millis(5),
        recover_on_start: true,
        retry: RetryPolicy::new(2, Duration::from_millis(1)),
        completion_acquire_timeout: Duration::from_millis(500),
    }
}

fn seed(store: &MemoryStore, n: usize) -> Vec<JobId> {
    (0..n)
        .map(|i| {
            store.insert(JobPayload::new(
                format!("task-{i}"),
                format!("scene {i}: a train crossing a bridge"),
                1280,
                720,
            ))
        })
        .collect()
}

fn always_succeed() -> Arc<dyn JobFunction> {
    Arc::new(|job: ClaimedJob, _r: ProgressReporter| async move { JobOutcome::success(job.id) })
}

async fn scheduler_for(
    store: &MemoryStore,
    pool_size: usize,
    job: Arc<dyn JobFunction>,
    config: SchedulerConfig,
) -> Scheduler {
    let pool = ConnectionPool::new(pool_size, Arc::new(store.clone()))
        .await
        .unwrap();
    Scheduler::new(Arc::new(store.clone()), pool, job, config)
        .await
        .unwrap()
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_one_pass_completes_every_job_and_returns_connections() {
    let store = MemoryStore::new();
    let ids = seed(&store, 5);
    let mut scheduler = scheduler_for(&store, 2, always_succeed(), config(5, 2)).await;

    let claimed = scheduler.run_once().await.unwrap();
    scheduler.wait_idle().await;

    assert_eq!(claimed, 5);
    for id in ids {
        assert_eq!(store.state_of(id), Some(JobState::Succeeded));
    }
    assert_eq!(scheduler.pool().status().available, 2);
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_full_run_leaves_nothing_pending_or_in_flight() {
    let store = MemoryStore::new();
    seed(&store, 23);
    let job: Arc<dyn JobFunction> = Arc::new(|job: ClaimedJob, _r: ProgressReporter| async move {
        tokio::time::sleep(Duration::from_millis(1)).await;
        if job.id.get() % 3 == 0 {
            JobOutcome::failure(job.id, "voice synthesis timed out")
        } else {
            JobOutcome::success(job.id)
        }
    });
    let scheduler = scheduler_for(&store, 3, job, config(4, 3)).await;
    let handle = scheduler.handle();
    let task = tokio::spawn(scheduler.run());

    wait_until(|| {
        store.count_in(JobState::Succeeded) + store.count_in(JobState::Failed) == 23
    })
    .await;
    handle.stop();
    let stats = task.await.unwrap().unwrap();

    assert_eq!(stats.claimed, 23);
    assert_eq!(stats.dispatched, 23);
    assert_eq!(store.count_in(JobState::Pending), 0);
    assert_eq!(store.count_in(JobState::InFlight), 0);
    assert_eq!(store.count_in(JobState::Failed), 7);
    assert_eq!(store.open_connections(), 0);
}

#[tokio::test]
async fn test_stop_still_finishes_claimed_jobs() {
    let store = MemoryStore::new();
    seed(&store, 6);
    let job: Arc<dyn JobFunction> = Arc::new(|job: ClaimedJob, _r: ProgressReporter| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        JobOutcome::success(job.id)
    });
    let mut scheduler = scheduler_for(&store, 2, job, config(6, 1)).await;

    scheduler.claim().await.unwrap();
    scheduler.handle().stop();
    let stats = scheduler.shutdown().await.unwrap();

    assert_eq!(stats.dispatched, 6);
    assert_eq!(store.count_in(JobState::Succeeded), 6);
    assert_eq!(store.count_in(JobState::InFlight), 0);
}

#[tokio::test]
async fn test_startup_recovery_requeues_stuck_job_before_first_claim() {
    let store = MemoryStore::new();
    let stuck = store.insert_with_state(
        JobPayload::new("stuck", "left over from a crash", 640, 360),
        JobState::InFlight,
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_job = seen.clone();
    let job: Arc<dyn JobFunction> = Arc::new(move |job: ClaimedJob, _r: ProgressReporter| {
        let seen = seen_by_job.clone();
        async move {
            seen.lock().unwrap().push(job.id);
            JobOutcome::success(job.id)
        }
    });
    let mut scheduler = scheduler_for(&store, 1, job, config(10, 1)).await;

    scheduler.run_once().await.unwrap();
    scheduler.wait_idle().await;

    assert_eq!(*seen.lock().unwrap(), vec![stuck]);
    assert_eq!(store.state_of(stuck), Some(JobState::Succeeded));
    assert_eq!(scheduler.stats().recovered, 1);
}

#[tokio::test]
async fn test_recovery_disabled_leaves_in_flight_rows() {
    let store = MemoryStore::new();
    let stuck = store.insert_with_state(JobPayload::new("s", "p", 1, 1), JobState::InFlight);
    let mut cfg = config(10, 1);
    cfg.recover_on_start = false;
    let mut scheduler = scheduler_for(&store, 1, always_succeed(), cfg).await;

    assert_eq!(scheduler.run_once().await.unwrap(), 0);
    assert_eq!(store.state_of(stuck), Some(JobState::InFlight));
}

#[tokio::test]
async fn test_panicking_job_ends_failed_with_reason() {
    let store = MemoryStore::new();
    let ids = seed(&store, 2);
    let bad = ids[0];
    let job: Arc<dyn JobFunction> =
        Arc::new(move |job: ClaimedJob, _r: ProgressReporter| async move {
            if job.id == bad {
                panic!("ffmpeg returned garbage");
            }
            JobOutcome::success(job.id)
        });
    let mut scheduler = scheduler_for(&store, 1, job, config(10, 2)).await;

    scheduler.run_once().await.unwrap();
    scheduler.wait_idle().await;

    let failed = store.job(bad).unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert!(failed.error.unwrap().contains("ffmpeg returned garbage"));
    assert_eq!(store.state_of(ids[1]), Some(JobState::Succeeded));
}

#[tokio::test]
async fn test_worker_count_bounds_concurrency() {
    let store = MemoryStore::new();
    seed(&store, 12);
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (c, p) = (current.clone(), peak.clone());
    let job: Arc<dyn JobFunction> = Arc::new(move |job: ClaimedJob, _r: ProgressReporter| {
        let (current, peak) = (c.clone(), p.clone());
        async move {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(3)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            JobOutcome::success(job.id)
        }
    });
    let mut scheduler = scheduler_for(&store, 2, job, config(12, 3)).await;

    scheduler.run_once().await.unwrap();
    scheduler.wait_idle().await;

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(store.count_in(JobState::Succeeded), 12);
}

#[tokio::test]
async fn test_job_progress_reaches_store() {
    let store = MemoryStore::new();
    let ids = seed(&store, 1);
    let observed = Arc::new(Mutex::new(None));
    let (watch, seen) = (store.clone(), observed.clone());
    let job: Arc<dyn JobFunction> = Arc::new(move |job: ClaimedJob, reporter: ProgressReporter| {
        let (watch, seen) = (watch.clone(), seen.clone());
        async move {
            reporter.report(60).await.unwrap();
            *seen.lock().unwrap() = watch.job(job.id).map(|j| j.progress);
            JobOutcome::success(job.id)
        }
    });
    let mut scheduler = scheduler_for(&store, 1, job, config(1, 1)).await;

    scheduler.run_once().await.unwrap();
    scheduler.wait_idle().await;

    assert_eq!(*observed.lock().unwrap(), Some(60));
    assert_eq!(store.job(ids[0]).unwrap().progress, 100);
}

#[tokio::test]
async fn test_dropped_claim_connection_is_retried() {
    let store = MemoryStore::new();
    seed(&store, 3);
    let mut scheduler = scheduler_for(&store, 1, always_succeed(), config(10, 1)).await;

    store.inject(StatementKind::MarkInFlight, FaultKind::ConnectionDropped);
    assert_eq!(scheduler.run_once().await.unwrap(), 3);
    scheduler.wait_idle().await;

    assert_eq!(store.count_in(JobState::Succeeded), 3);
    assert_eq!(store.reconnects(), 1);
}

#[tokio::test]
async fn test_exhausted_reconnect_fails_claim_without_changes() {
    let store = MemoryStore::new();
    seed(&store, 3);
    let mut cfg = config(10, 1);
    cfg.recover_on_start = false;
    let mut scheduler = scheduler_for(&store, 1, always_succeed(), cfg).await;

    store.inject(StatementKind::SelectPending, FaultKind::ConnectionDropped);
    store.refuse_connects(u32::MAX);
    let err = scheduler.run_once().await.unwrap_err();

    assert!(matches!(
        err,
        SchedulerError::Db(DbError::ReconnectExhausted { attempts: 2, .. })
    ));
    assert_eq!(store.count_in(JobState::Pending), 3);
    assert_eq!(scheduler.ready_len(), 0);
}

#[tokio::test]
async fn test_completion_without_connection_leaves_job_in_flight() {
    let store = MemoryStore::new();
    let ids = seed(&store, 1);
    let mut cfg = config(1, 1);
    cfg.completion_acquire_timeout = Duration::from_millis(20);
    let mut scheduler = scheduler_for(&store, 1, always_succeed(), cfg).await;

    let held = scheduler.pool().acquire().await.unwrap();
    scheduler.run_once().await.unwrap();
    scheduler.wait_idle().await;
    assert_eq!(store.state_of(ids[0]), Some(JobState::InFlight));
    drop(held);
    scheduler.shutdown().await.unwrap();

    // The next instance picks it up through recovery.
    let mut next = scheduler_for(&store, 1, always_succeed(), config(1, 1)).await;
    next.run_once().await.unwrap();
    next.wait_idle().await;
    assert_eq!(store.state_of(ids[0]), Some(JobState::Succeeded));
}

#[tokio::test]
async fn test_enqueue_notification_wakes_idle_scheduler() {
    let store = MemoryStore::new();
    let mut cfg = config(1, 1);
    cfg.poll_interval = Duration::from_secs(60);
    let scheduler = scheduler_for(&store, 1, always_succeed(), cfg).await;
    let handle = scheduler.handle();
    let task = tokio::spawn(scheduler.run());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let id = store.insert(JobPayload::new("late", "a late arrival", 320, 240));
    handle.notify_enqueued();

    wait_until(|| store.state_of(id) == Some(JobState::Succeeded)).await;
    handle.stop();
    task.await.unwrap().unwrap();
}
