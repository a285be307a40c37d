//! Scheduler errors.

use reelq_db::{DbError, PoolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Db(#[from] DbError),

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
