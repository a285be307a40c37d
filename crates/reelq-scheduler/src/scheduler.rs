//! The poll, claim and dispatch loop.

use futures::FutureExt;
use reelq_config::SchedulerSettings;
use reelq_core::ClaimedJob;
use reelq_db::{Connection, ConnectionPool, Connector, RetryPolicy};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::claim::claim_batch;
use crate::completion::complete;
use crate::job::{JobFunction, ProgressReporter, panic_message};
use crate::recovery::recover_in_flight;
use crate::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum rows claimed per poll.
    pub batch_size: usize,
    /// Maximum jobs running at once.
    pub workers: usize,
    /// Wait after an empty or failed claim.
    pub poll_interval: Duration,
    pub recover_on_start: bool,
    pub retry: RetryPolicy,
    /// How long a completion waits for a pool connection before giving up.
    pub completion_acquire_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&SchedulerSettings::default())
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            workers: settings.workers,
            poll_interval: settings.poll_interval,
            recover_on_start: settings.recover_on_start,
            retry: RetryPolicy::new(settings.max_retry_times, settings.retry_delay),
            completion_acquire_timeout: settings.completion_acquire_timeout,
        }
    }
}

/// Counters reported when the scheduler shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub recovered: usize,
    pub claimed: usize,
    pub dispatched: usize,
}

/// Stops or wakes a running scheduler from another task.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    stop: CancellationToken,
    wake: Arc<Notify>,
}

impl SchedulerHandle {
    /// Prevent further claims. Claimed jobs still run to completion.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Cut the current poll wait short, e.g. right after inserting a job.
    pub fn notify_enqueued(&self) {
        self.wake.notify_one();
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    /// Dedicated claim connection, never shared with workers.
    control: Box<dyn Connection>,
    pool: ConnectionPool,
    job: Arc<dyn JobFunction>,
    workers: Arc<Semaphore>,
    running: JoinSet<()>,
    ready: VecDeque<ClaimedJob>,
    recovered: AtomicBool,
    stop: CancellationToken,
    wake: Arc<Notify>,
    stats: SchedulerStats,
}

impl Scheduler {
    /// Open the control connection through `connector` and build a scheduler
    /// around an already-initialized pool.
    ///
    /// The scheduler owns the pool from here on: if construction fails, the
    /// pool is closed before the error is returned.
    pub async fn new(
        connector: Arc<dyn Connector>,
        pool: ConnectionPool,
        job: Arc<dyn JobFunction>,
        config: SchedulerConfig,
    ) -> SchedulerResult<Self> {
        if let Err(e) = check_config(&config) {
            pool.close().await;
            return Err(e);
        }

        let control = match connector.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Failed to open control connection");
                pool.close().await;
                return Err(e.into());
            }
        };
        info!(
            batch_size = config.batch_size,
            workers = config.workers,
            pool_size = pool.size(),
            "Scheduler ready"
        );

        Ok(Self {
            workers: Arc::new(Semaphore::new(config.workers)),
            config,
            control,
            pool,
            job,
            running: JoinSet::new(),
            ready: VecDeque::new(),
            recovered: AtomicBool::new(false),
            stop: CancellationToken::new(),
            wake: Arc::new(Notify::new()),
            stats: SchedulerStats::default(),
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            stop: self.stop.clone(),
            wake: self.wake.clone(),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    /// Re-queue jobs left in flight by a previous instance.
    ///
    /// The reset happens at most once per scheduler: after a successful pass
    /// later calls return `Ok(None)`. A failed pass can be attempted again.
    pub async fn recover(&mut self) -> SchedulerResult<Option<usize>> {
        if self.recovered.load(Ordering::Acquire) {
            debug!("Recovery already ran for this scheduler");
            return Ok(None);
        }
        let ids = recover_in_flight(self.control.as_mut(), &self.config.retry).await?;
        self.recovered.store(true, Ordering::Release);
        self.stats.recovered += ids.len();
        Ok(Some(ids.len()))
    }

    /// Claim one batch into the ready queue. Returns how many jobs were claimed.
    pub async fn claim(&mut self) -> SchedulerResult<usize> {
        let rows = claim_batch(
            self.control.as_mut(),
            &self.config.retry,
            self.config.batch_size,
        )
        .await?;
        let count = rows.len();
        self.stats.claimed += count;
        self.ready.extend(rows.into_iter().map(|r| r.into_claimed()));
        Ok(count)
    }

    /// Jobs claimed but not yet handed to a worker.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Submit every ready job, in claim order, waiting for worker slots.
    pub async fn dispatch_ready(&mut self) {
        while let Some(job) = self.ready.pop_front() {
            let permit = match self.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!(job_id = %job.id, "Worker executor closed, job left in flight");
                    continue;
                }
            };
            self.reap_finished();

            let id = job.id;
            let job_fn = self.job.clone();
            let pool = self.pool.clone();
            let retry = self.config.retry;
            let acquire_timeout = self.config.completion_acquire_timeout;

            debug!(job_id = %id, "Dispatching job");
            self.running.spawn(async move {
                let reporter = ProgressReporter::new(id, pool.clone(), retry);
                let result = AssertUnwindSafe(job_fn.run(job, reporter))
                    .catch_unwind()
                    .await
                    .map_err(|e| panic_message(&*e));
                if let Err(message) = &result {
                    error!(job_id = %id, panic = %message, "Job function panicked");
                }
                complete(id, result, &pool, &retry, acquire_timeout).await;
                drop(permit);
            });
            self.stats.dispatched += 1;
        }
    }

    /// Wait until every dispatched job has finished and recorded its result.
    pub async fn wait_idle(&mut self) {
        while let Some(joined) = self.running.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
            }
        }
    }

    fn reap_finished(&mut self) {
        while let Some(joined) = self.running.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
            }
        }
    }

    /// One iteration: recovery until it has succeeded (if enabled), a claim,
    /// and dispatch of everything claimed.
    ///
    /// Nothing is claimed while recovery is still outstanding, so a failed
    /// recovery fails the whole pass.
    pub async fn run_once(&mut self) -> SchedulerResult<usize> {
        if self.config.recover_on_start && !self.recovered.load(Ordering::Acquire) {
            self.recover().await?;
        }

        let claimed = self.claim().await;
        self.dispatch_ready().await;
        claimed
    }

    /// Poll until stopped, then shut down.
    pub async fn run(mut self) -> SchedulerResult<SchedulerStats> {
        info!("Scheduler started");

        while !self.stop.is_cancelled() {
            let claimed = match self.run_once().await {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "Scheduler pass failed");
                    0
                }
            };

            if claimed == 0 {
                tokio::select! {
                    _ = self.stop.cancelled() => {}
                    _ = self.wake.notified() => debug!("Woken by enqueue"),
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!("Stop requested, draining");
        self.shutdown().await
    }

    /// Drain and tear down: dispatch anything still queued, wait for every
    /// worker and its completion, close the worker executor, then the
    /// control connection and the pool.
    pub async fn shutdown(mut self) -> SchedulerResult<SchedulerStats> {
        self.stop.cancel();

        if !self.ready.is_empty() {
            info!(count = self.ready.len(), "Dispatching jobs claimed before stop");
            self.dispatch_ready().await;
        }

        self.wait_idle().await;
        self.workers.close();

        if let Err(e) = self.control.close().await {
            warn!(error = %e, "Failed to close control connection");
        }
        let closed = self.pool.close().await;

        info!(
            recovered = self.stats.recovered,
            claimed = self.stats.claimed,
            dispatched = self.stats.dispatched,
            pool_closed = closed,
            "Scheduler stopped"
        );
        Ok(self.stats)
    }
}

fn check_config(config: &SchedulerConfig) -> SchedulerResult<()> {
    if config.batch_size == 0 {
        return Err(SchedulerError::InvalidConfig(
            "batch size must be at least 1".to_string(),
        ));
    }
    if config.workers == 0 {
        return Err(SchedulerError::InvalidConfig(
            "worker count must be at least 1".to_string(),
        ));
    }
    Ok(())
}
