//! Statements the scheduler issues against the task table.
//!
//! Every store interaction is expressed as a [`Statement`] so a single
//! combinator ([`RetryPolicy::execute`](crate::RetryPolicy::execute)) can wrap
//! all of them the same way, whatever backend runs them.

use reelq_core::{JobId, JobPayload, JobRecord, JobState};

use crate::{DbError, DbResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Select up to `limit` pending rows, locking them for the current
    /// transaction and skipping rows another session holds.
    SelectPending { limit: i64 },
    /// Move exactly these rows from pending to in flight, yielding the ids
    /// that moved.
    MarkInFlight { ids: Vec<JobId> },
    /// Select the ids of every in-flight row.
    SelectInFlight,
    /// Move these rows from in flight back to pending.
    ResetToPending { ids: Vec<JobId> },
    /// Move an in-flight row to a terminal state.
    Finish {
        id: JobId,
        state: JobState,
        error: Option<String>,
    },
    SetProgress { id: JobId, progress: u8 },
    /// Insert a new pending row.
    Insert { payload: JobPayload },
}

/// Statement kinds, used for logging and fault targeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    SelectPending,
    MarkInFlight,
    SelectInFlight,
    ResetToPending,
    Finish,
    SetProgress,
    Insert,
}

impl StatementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StatementKind::SelectPending => "select_pending",
            StatementKind::MarkInFlight => "mark_in_flight",
            StatementKind::SelectInFlight => "select_in_flight",
            StatementKind::ResetToPending => "reset_to_pending",
            StatementKind::Finish => "finish",
            StatementKind::SetProgress => "set_progress",
            StatementKind::Insert => "insert",
        }
    }
}

impl Statement {
    pub fn kind(&self) -> StatementKind {
        match self {
            Statement::SelectPending { .. } => StatementKind::SelectPending,
            Statement::MarkInFlight { .. } => StatementKind::MarkInFlight,
            Statement::SelectInFlight => StatementKind::SelectInFlight,
            Statement::ResetToPending { .. } => StatementKind::ResetToPending,
            Statement::Finish { .. } => StatementKind::Finish,
            Statement::SetProgress { .. } => StatementKind::SetProgress,
            Statement::Insert { .. } => StatementKind::Insert,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }
}

/// Result of executing a [`Statement`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Rows(Vec<JobRecord>),
    Ids(Vec<JobId>),
    Affected(u64),
}

impl Outcome {
    pub fn into_rows(self, statement: &'static str) -> DbResult<Vec<JobRecord>> {
        match self {
            Outcome::Rows(rows) => Ok(rows),
            _ => Err(DbError::UnexpectedOutcome {
                statement,
                expected: "rows",
            }),
        }
    }

    pub fn into_ids(self, statement: &'static str) -> DbResult<Vec<JobId>> {
        match self {
            Outcome::Ids(ids) => Ok(ids),
            _ => Err(DbError::UnexpectedOutcome {
                statement,
                expected: "ids",
            }),
        }
    }

    pub fn into_affected(self, statement: &'static str) -> DbResult<u64> {
        match self {
            Outcome::Affected(n) => Ok(n),
            _ => Err(DbError::UnexpectedOutcome {
                statement,
                expected: "affected row count",
            }),
        }
    }
}
