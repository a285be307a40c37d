//! The job function the scheduler drives.

use async_trait::async_trait;
use reelq_core::{ClaimedJob, JobId, JobOutcome};
use reelq_db::{ConnectionPool, DbResult, RetryPolicy, jobs};
use std::any::Any;
use std::future::Future;

/// Work performed for one claimed job.
///
/// The scheduler imposes no timeout. Returning an outcome with an error, or
/// panicking, marks the job failed.
#[async_trait]
pub trait JobFunction: Send + Sync + 'static {
    async fn run(&self, job: ClaimedJob, reporter: ProgressReporter) -> JobOutcome;
}

#[async_trait]
impl<F, Fut> JobFunction for F
where
    F: Fn(ClaimedJob, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    async fn run(&self, job: ClaimedJob, reporter: ProgressReporter) -> JobOutcome {
        (self)(job, reporter).await
    }
}

/// Lets a running job record its progress through the shared pool.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    id: JobId,
    pool: ConnectionPool,
    retry: RetryPolicy,
}

impl ProgressReporter {
    pub fn new(id: JobId, pool: ConnectionPool, retry: RetryPolicy) -> Self {
        Self { id, pool, retry }
    }

    pub fn job_id(&self) -> JobId {
        self.id
    }

    /// The pool the scheduler shares with its workers.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Record `progress` (clamped to 100) for this job.
    pub async fn report(&self, progress: u8) -> DbResult<()> {
        jobs::report_progress(&self.pool, &self.retry, self.id, progress).await
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked with a non-string payload".to_string()
    }
}
