//! Reconnect-and-retry policy.
//!
//! Applied to every individual statement on a long-lived connection, never to
//! whole transactions. A statement that fails with a transient connectivity
//! error triggers up to `max_retry_times` reconnect attempts spaced by
//! `retry_delay`; once the session is back, the failed statement is issued
//! again exactly once. Any other error propagates untouched.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::store::Connection;
use crate::{DbError, DbResult, Outcome, Statement};

pub const DEFAULT_MAX_RETRY_TIMES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retry_times: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_times: DEFAULT_MAX_RETRY_TIMES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retry_times: u32, retry_delay: Duration) -> Self {
        Self {
            max_retry_times,
            retry_delay,
        }
    }

    /// A policy that never reconnects.
    pub fn never() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Execute `statement` on `conn`, reconnecting and re-issuing it once if
    /// it failed with a transient connectivity error.
    ///
    /// If the statement ran inside a transaction, that transaction died with
    /// the old session; a new one is opened before the statement is re-issued
    /// so the caller's commit or rollback still pairs up.
    pub async fn execute(
        &self,
        conn: &mut dyn Connection,
        statement: &Statement,
    ) -> DbResult<Outcome> {
        let in_tx = conn.in_transaction();

        let err = match conn.execute(statement).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if err.is_transient() && self.max_retry_times > 0 => err,
            Err(err) => return Err(err),
        };

        warn!(
            statement = statement.name(),
            error = %err,
            "Transient store error, reconnecting"
        );
        self.reconnect(conn).await?;

        if in_tx {
            conn.begin().await?;
        }
        conn.execute(statement).await
    }

    /// Open a transaction on `conn`.
    ///
    /// A session known to be broken is re-established first. A session that
    /// died while idle usually only shows up here, so a transient error from
    /// BEGIN also reconnects and begins once more.
    pub async fn begin(&self, conn: &mut dyn Connection) -> DbResult<()> {
        if conn.is_broken() {
            self.reconnect(conn).await?;
        }

        let err = match conn.begin().await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_transient() && self.max_retry_times > 0 => err,
            Err(err) => return Err(err),
        };

        warn!(error = %err, "Transient store error on begin, reconnecting");
        self.reconnect(conn).await?;
        conn.begin().await
    }

    /// Ping, and if that fails reconnect, up to `max_retry_times` attempts.
    pub async fn reconnect(&self, conn: &mut dyn Connection) -> DbResult<()> {
        let mut last_error = None;

        for attempt in 1..=self.max_retry_times {
            if !conn.is_broken() && conn.ping().await.is_ok() {
                return Ok(());
            }
            match conn.reconnect().await {
                Ok(()) => {
                    info!(attempt, "Reconnected to store");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_retry_times = self.max_retry_times,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                    last_error = Some(e);
                }
            }
            if attempt < self.max_retry_times {
                sleep(self.retry_delay).await;
            }
        }

        Err(DbError::ReconnectExhausted {
            attempts: self.max_retry_times,
            source: Box::new(last_error.unwrap_or(DbError::Closed)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FaultKind, MemoryStore};
    use crate::statement::StatementKind;
    use crate::store::Connector;
    use reelq_core::{JobPayload, JobState};

    fn fast_policy(max_retry_times: u32) -> RetryPolicy {
        RetryPolicy::new(max_retry_times, Duration::from_millis(1))
    }

    fn payload(n: usize) -> JobPayload {
        JobPayload::new(format!("task-{n}"), "a city at night", 512, 512)
    }

    #[tokio::test]
    async fn test_transient_error_is_retried_once() {
        let store = MemoryStore::new();
        let id = store.insert(payload(1));
        let mut conn = store.connect().await.unwrap();

        store.inject(StatementKind::SelectPending, FaultKind::ConnectionDropped);
        let rows = fast_policy(3)
            .execute(conn.as_mut(), &Statement::SelectPending { limit: 10 })
            .await
            .unwrap()
            .into_rows("select_pending")
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert!(!conn.is_broken());
        assert_eq!(store.reconnects(), 1);
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let store = MemoryStore::new();
        let mut conn = store.connect().await.unwrap();

        store.inject(
            StatementKind::SelectPending,
            FaultKind::QueryError("syntax error".into()),
        );
        let err = fast_policy(3)
            .execute(conn.as_mut(), &Statement::SelectPending { limit: 10 })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Query { .. }));
        assert_eq!(store.reconnects(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_propagates() {
        let store = MemoryStore::new();
        store.insert(payload(1));
        let mut conn = store.connect().await.unwrap();

        store.inject(StatementKind::SelectPending, FaultKind::ConnectionDropped);
        store.refuse_connects(u32::MAX);
        let err = fast_policy(2)
            .execute(conn.as_mut(), &Statement::SelectPending { limit: 10 })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DbError::ReconnectExhausted { attempts: 2, .. }
        ));
        assert_eq!(store.count_in(JobState::Pending), 1);
    }

    #[tokio::test]
    async fn test_zero_retries_returns_original_error() {
        let store = MemoryStore::new();
        let mut conn = store.connect().await.unwrap();

        store.inject(StatementKind::SelectInFlight, FaultKind::ConnectionDropped);
        let err = RetryPolicy::never()
            .execute(conn.as_mut(), &Statement::SelectInFlight)
            .await
            .unwrap_err();

        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_reconnect_succeeds_after_refused_attempt() {
        let store = MemoryStore::new();
        let id = store.insert(payload(1));
        let mut conn = store.connect().await.unwrap();
        let policy = RetryPolicy::new(3, Duration::from_millis(20));

        store.inject(StatementKind::SelectPending, FaultKind::ConnectionDropped);
        store.refuse_connects(1);
        let started = tokio::time::Instant::now();
        let rows = policy
            .execute(conn.as_mut(), &Statement::SelectPending { limit: 10 })
            .await
            .unwrap()
            .into_rows("select_pending")
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert!(!conn.is_broken());
        assert_eq!(store.reconnects(), 1);
    }

    #[tokio::test]
    async fn test_begin_reconnects_session_killed_while_idle() {
        let store = MemoryStore::new();
        let mut conn = store.connect().await.unwrap();

        store.terminate_sessions();
        fast_policy(3).begin(conn.as_mut()).await.unwrap();

        assert!(conn.in_transaction());
        assert!(!conn.is_broken());
        assert_eq!(store.reconnects(), 1);
        conn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_begin_without_retries_reports_dead_session() {
        let store = MemoryStore::new();
        let mut conn = store.connect().await.unwrap();

        store.terminate_sessions();
        let err = RetryPolicy::never().begin(conn.as_mut()).await.unwrap_err();

        assert!(err.is_transient());
        assert!(conn.is_broken());
        assert_eq!(store.reconnects(), 0);
    }

    #[tokio::test]
    async fn test_retry_inside_transaction_reopens_it() {
        let store = MemoryStore::new();
        let id = store.insert(payload(1));
        let mut conn = store.connect().await.unwrap();
        let policy = fast_policy(3);

        conn.begin().await.unwrap();
        store.inject(StatementKind::MarkInFlight, FaultKind::ConnectionDropped);
        let marked = policy
            .execute(conn.as_mut(), &Statement::MarkInFlight { ids: vec![id] })
            .await
            .unwrap()
            .into_ids("mark_in_flight")
            .unwrap();
        assert_eq!(marked, vec![id]);
        assert!(conn.in_transaction());
        conn.commit().await.unwrap();

        assert_eq!(store.state_of(id), Some(JobState::InFlight));
    }
}
