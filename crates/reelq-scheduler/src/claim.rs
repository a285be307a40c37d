//! Transactional batch claim.

use reelq_core::{JobId, JobRecord, JobState};
use reelq_db::store::rollback_quietly;
use reelq_db::{Connection, DbResult, RetryPolicy, jobs};
use tracing::{debug, warn};

/// Claim up to `limit` pending jobs on `conn`.
///
/// Selects and marks the rows in flight inside one transaction. Store scan
/// order applies; there is no FIFO guarantee. Each statement goes through
/// `retry`, the claim as a whole is never retried. On error the transaction
/// is rolled back and nothing is claimed.
pub async fn claim_batch(
    conn: &mut dyn Connection,
    retry: &RetryPolicy,
    limit: usize,
) -> DbResult<Vec<JobRecord>> {
    retry.begin(conn).await?;
    match claim_in_transaction(conn, retry, limit).await {
        Ok(claimed) => {
            conn.commit().await?;
            Ok(claimed)
        }
        Err(e) => {
            rollback_quietly(conn).await;
            Err(e)
        }
    }
}

async fn claim_in_transaction(
    conn: &mut dyn Connection,
    retry: &RetryPolicy,
    limit: usize,
) -> DbResult<Vec<JobRecord>> {
    let rows = jobs::select_pending(conn, retry, limit).await?;
    if rows.is_empty() {
        return Ok(rows);
    }

    let ids: Vec<JobId> = rows.iter().map(|r| r.id).collect();
    let marked = jobs::mark_in_flight(conn, retry, &ids).await?;
    if marked.len() != ids.len() {
        // Only possible when a retry lost the row locks taken by the select.
        warn!(
            selected = ids.len(),
            marked = marked.len(),
            "Some selected jobs were claimed elsewhere"
        );
    }

    let claimed: Vec<JobRecord> = rows
        .into_iter()
        .filter(|r| marked.contains(&r.id))
        .map(|mut r| {
            r.state = JobState::InFlight;
            r
        })
        .collect();
    debug!(count = claimed.len(), "Claimed jobs");
    Ok(claimed)
}
