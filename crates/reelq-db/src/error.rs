//! Database error types.
//!
//! Store errors are split into two families: transient connectivity faults,
//! which the [`RetryPolicy`](crate::RetryPolicy) may recover from by
//! reconnecting, and everything else, which is never retried.

use std::time::Duration;
use thiserror::Error;

/// SQLSTATE codes that indicate a dropped or unusable session rather than a
/// problem with the statement itself.
pub const TRANSIENT_SQLSTATES: &[&str] = &[
    "08000", // connection_exception
    "08001", // sqlclient_unable_to_establish_sqlconnection
    "08003", // connection_does_not_exist
    "08004", // sqlserver_rejected_establishment_of_sqlconnection
    "08006", // connection_failure
    "08007", // transaction_resolution_unknown
    "57P01", // admin_shutdown
    "57P02", // crash_shutdown
    "57P03", // cannot_connect_now
];

pub fn is_transient_sqlstate(code: &str) -> bool {
    TRANSIENT_SQLSTATES.contains(&code)
}

#[derive(Debug, Error)]
pub enum DbError {
    /// The session was reset, dropped or failed at the protocol level.
    #[error("connection lost: {0}")]
    Connection(String),

    /// A statement was issued on a connection that is already closed.
    #[error("connection is closed")]
    Closed,

    #[error("query failed: {message}")]
    Query {
        code: Option<String>,
        message: String,
    },

    #[error("reconnect failed after {attempts} attempts: {source}")]
    ReconnectExhausted {
        attempts: u32,
        #[source]
        source: Box<DbError>,
    },

    #[error("unexpected result for {statement}: expected {expected}")]
    UnexpectedOutcome {
        statement: &'static str,
        expected: &'static str,
    },

    #[error("invalid job data: {0}")]
    InvalidData(#[from] reelq_core::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("no pooled connection: {0}")]
    PoolUnavailable(#[source] Box<PoolError>),
}

impl DbError {
    /// Whether this error belongs to the enumerated set of connectivity faults.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Connection(_) | DbError::Closed)
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed => DbError::Connection(err.to_string()),
            sqlx::Error::PoolClosed => DbError::Closed,
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.into_owned());
                match code {
                    Some(code) if is_transient_sqlstate(&code) => {
                        DbError::Connection(format!("{} ({code})", db_err.message()))
                    }
                    code => DbError::Query {
                        code,
                        message: db_err.message().to_string(),
                    },
                }
            }
            _ => DbError::Query {
                code: None,
                message: err.to_string(),
            },
        }
    }
}

impl From<PoolError> for DbError {
    fn from(err: PoolError) -> Self {
        DbError::PoolUnavailable(Box::new(err))
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;

/// Errors from the fixed-size connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool size must be at least 1")]
    InvalidSize,

    #[error("failed to open {requested} connections ({opened} opened before failure): {source}")]
    Build {
        opened: usize,
        requested: usize,
        #[source]
        source: DbError,
    },

    #[error("timed out after {0:?} waiting for a connection")]
    Timeout(Duration),

    #[error("pool is closed")]
    Closed,

    #[error("failed to refill an empty pool slot: {0}")]
    Refill(#[source] DbError),
}

pub type PoolResult<T> = std::result::Result<T, PoolError>;
