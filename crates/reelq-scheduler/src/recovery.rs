//! Startup recovery of jobs abandoned by a crashed instance.
//!
//! Assumes a single active scheduler per store: every in-flight row is
//! treated as orphaned.

use reelq_core::JobId;
use reelq_db::store::rollback_quietly;
use reelq_db::{Connection, DbResult, RetryPolicy, jobs};
use tracing::info;

/// Move every in-flight job back to pending in one transaction. Returns the
/// ids that were re-queued.
pub async fn recover_in_flight(
    conn: &mut dyn Connection,
    retry: &RetryPolicy,
) -> DbResult<Vec<JobId>> {
    retry.begin(conn).await?;
    match requeue(conn, retry).await {
        Ok(ids) => {
            conn.commit().await?;
            if !ids.is_empty() {
                info!(count = ids.len(), "Re-queued jobs left in flight");
            }
            Ok(ids)
        }
        Err(e) => {
            rollback_quietly(conn).await;
            Err(e)
        }
    }
}

async fn requeue(conn: &mut dyn Connection, retry: &RetryPolicy) -> DbResult<Vec<JobId>> {
    let ids = jobs::select_in_flight(conn, retry).await?;
    if !ids.is_empty() {
        jobs::reset_to_pending(conn, retry, &ids).await?;
    }
    Ok(ids)
}
