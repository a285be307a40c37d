//! Terminal state write-back for finished jobs.

use reelq_core::{JobId, JobOutcome, JobState};
use reelq_db::store::rollback_quietly;
use reelq_db::{Connection, ConnectionPool, DbResult, RetryPolicy, jobs};
use std::time::Duration;
use tracing::{error, info, warn};

/// What happened to a finished job's state update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The terminal state was committed.
    Recorded(JobState),
    /// The row was no longer in flight, nothing was written.
    NotInFlight,
    /// No pool connection within the acquire timeout; the job stays in flight.
    Abandoned,
    /// The update failed and was rolled back; the job stays in flight.
    WriteFailed,
}

/// Record the result of job `id`.
///
/// `result` is the job function's outcome, or the panic message if it
/// panicked. Runs once per dispatched job on the worker task that ran it.
pub async fn complete(
    id: JobId,
    result: Result<JobOutcome, String>,
    pool: &ConnectionPool,
    retry: &RetryPolicy,
    acquire_timeout: Duration,
) -> Completion {
    let mut conn = match pool.acquire_timeout(acquire_timeout).await {
        Ok(conn) => conn,
        Err(e) => {
            error!(
                job_id = %id,
                error = %e,
                "No connection to record completion, job left in flight"
            );
            return Completion::Abandoned;
        }
    };

    let (state, reason) = match result {
        Ok(outcome) => {
            if outcome.id != id {
                warn!(job_id = %id, reported = %outcome.id, "Job function reported a different id");
            }
            (outcome.terminal_state(), outcome.error)
        }
        Err(panic) => (JobState::Failed, Some(panic)),
    };

    let written = write_terminal(conn.as_mut(), retry, id, state, reason.clone()).await;
    pool.release(conn).await;

    match written {
        Ok(0) => {
            warn!(job_id = %id, %state, "Job was not in flight, completion dropped");
            Completion::NotInFlight
        }
        Ok(_) => {
            match &reason {
                Some(reason) => warn!(job_id = %id, %reason, "Job failed"),
                None => info!(job_id = %id, "Job succeeded"),
            }
            Completion::Recorded(state)
        }
        Err(e) => {
            error!(job_id = %id, %state, error = %e, "Failed to record job completion");
            Completion::WriteFailed
        }
    }
}

async fn write_terminal(
    conn: &mut dyn Connection,
    retry: &RetryPolicy,
    id: JobId,
    state: JobState,
    reason: Option<String>,
) -> DbResult<u64> {
    retry.begin(conn).await?;
    match jobs::finish(conn, retry, id, state, reason).await {
        Ok(touched) => {
            conn.commit().await?;
            Ok(touched)
        }
        Err(e) => {
            rollback_quietly(conn).await;
            Err(e)
        }
    }
}
