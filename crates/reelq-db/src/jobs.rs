//! Typed job queries.
//!
//! Thin wrappers that run one [`Statement`] through the retry policy and
//! unpack its [`Outcome`](crate::Outcome).

use reelq_core::{JobId, JobPayload, JobRecord, JobState};
use tracing::debug;

use crate::pool::ConnectionPool;
use crate::store::Connection;
use crate::{DbError, DbResult, RetryPolicy, Statement};

pub async fn select_pending(
    conn: &mut dyn Connection,
    retry: &RetryPolicy,
    limit: usize,
) -> DbResult<Vec<JobRecord>> {
    let statement = Statement::SelectPending {
        limit: i64::try_from(limit).unwrap_or(i64::MAX),
    };
    retry
        .execute(conn, &statement)
        .await?
        .into_rows(statement.name())
}

/// Move pending rows to in flight, returning the ids that actually moved.
pub async fn mark_in_flight(
    conn: &mut dyn Connection,
    retry: &RetryPolicy,
    ids: &[JobId],
) -> DbResult<Vec<JobId>> {
    let statement = Statement::MarkInFlight { ids: ids.to_vec() };
    retry
        .execute(conn, &statement)
        .await?
        .into_ids(statement.name())
}

pub async fn select_in_flight(
    conn: &mut dyn Connection,
    retry: &RetryPolicy,
) -> DbResult<Vec<JobId>> {
    let statement = Statement::SelectInFlight;
    retry
        .execute(conn, &statement)
        .await?
        .into_ids(statement.name())
}

pub async fn reset_to_pending(
    conn: &mut dyn Connection,
    retry: &RetryPolicy,
    ids: &[JobId],
) -> DbResult<u64> {
    let statement = Statement::ResetToPending { ids: ids.to_vec() };
    retry
        .execute(conn, &statement)
        .await?
        .into_affected(statement.name())
}

/// Write a terminal state. Only rows still in flight are touched.
pub async fn finish(
    conn: &mut dyn Connection,
    retry: &RetryPolicy,
    id: JobId,
    state: JobState,
    error: Option<String>,
) -> DbResult<u64> {
    if !state.is_terminal() {
        let message = format!("{state} is not a terminal state");
        return Err(reelq_core::Error::InvalidInput(message).into());
    }
    let statement = Statement::Finish { id, state, error };
    retry
        .execute(conn, &statement)
        .await?
        .into_affected(statement.name())
}

pub async fn set_progress(
    conn: &mut dyn Connection,
    retry: &RetryPolicy,
    id: JobId,
    progress: u8,
) -> DbResult<u64> {
    let statement = Statement::SetProgress {
        id,
        progress: progress.min(100),
    };
    retry
        .execute(conn, &statement)
        .await?
        .into_affected(statement.name())
}

pub async fn insert(
    conn: &mut dyn Connection,
    retry: &RetryPolicy,
    payload: JobPayload,
) -> DbResult<JobId> {
    let statement = Statement::Insert { payload };
    let ids = retry
        .execute(conn, &statement)
        .await?
        .into_ids(statement.name())?;
    ids.into_iter().next().ok_or(DbError::UnexpectedOutcome {
        statement: "insert",
        expected: "one id",
    })
}

/// Borrow a pool connection just long enough to record a job's progress.
///
/// Job functions use this for observability; failures are returned, never
/// fatal to the job.
pub async fn report_progress(
    pool: &ConnectionPool,
    retry: &RetryPolicy,
    id: JobId,
    progress: u8,
) -> DbResult<()> {
    let mut conn = pool.acquire().await?;
    let result = set_progress(conn.as_mut(), retry, id, progress).await;
    pool.release(conn).await;
    debug!(job_id = %id, progress, "Recorded job progress");
    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::Connector;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_finish_only_touches_in_flight_rows() {
        let store = MemoryStore::new();
        let id = store.insert(JobPayload::new("t1", "waves", 64, 64));
        let mut conn = store.connect().await.unwrap();
        let retry = RetryPolicy::default();

        let touched = finish(conn.as_mut(), &retry, id, JobState::Succeeded, None)
            .await
            .unwrap();
        assert_eq!(touched, 0);
        assert_eq!(store.state_of(id), Some(JobState::Pending));

        mark_in_flight(conn.as_mut(), &retry, &[id]).await.unwrap();
        let touched = finish(
            conn.as_mut(),
            &retry,
            id,
            JobState::Failed,
            Some("render crashed".into()),
        )
        .await
        .unwrap();
        assert_eq!(touched, 1);

        let job = store.job(id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.error.as_deref(), Some("render crashed"));
    }

    #[tokio::test]
    async fn test_finish_rejects_non_terminal_state() {
        let store = MemoryStore::new();
        let id =
            store.insert_with_state(JobPayload::new("t1", "waves", 64, 64), JobState::InFlight);
        let mut conn = store.connect().await.unwrap();

        let err = finish(conn.as_mut(), &RetryPolicy::default(), id, JobState::Pending, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidData(_)));
        assert_eq!(store.state_of(id), Some(JobState::InFlight));
    }

    #[tokio::test]
    async fn test_report_progress_returns_connection() {
        let store = MemoryStore::new();
        let id = store.insert(JobPayload::new("t1", "waves", 64, 64));
        let pool = ConnectionPool::new(1, Arc::new(store.clone())).await.unwrap();

        report_progress(&pool, &RetryPolicy::default(), id, 40)
            .await
            .unwrap();

        assert_eq!(store.job(id).unwrap().progress, 40);
        assert_eq!(pool.status().available, 1);
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let store = MemoryStore::new();
        let mut conn = store.connect().await.unwrap();
        let retry = RetryPolicy::default();

        let a = insert(conn.as_mut(), &retry, JobPayload::new("a", "p", 1, 1))
            .await
            .unwrap();
        let b = insert(conn.as_mut(), &retry, JobPayload::new("b", "p", 1, 1))
            .await
            .unwrap();
        assert!(b > a);
        assert_eq!(store.count_in(JobState::Pending), 2);
    }
}
