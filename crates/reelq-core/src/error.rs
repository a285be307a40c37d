//! Error types for reelq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid job state code: {0}")]
    InvalidState(i16),

    #[error("invalid progress value: {0}")]
    InvalidProgress(i64),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;
