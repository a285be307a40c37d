//! Core domain types for reelq.
//!
//! This crate contains:
//! - Job identifiers
//! - Job states, records and payloads
//! - The outcome type returned by job functions

pub mod error;
pub mod id;
pub mod job;

pub use error::{Error, Result};
pub use id::JobId;
pub use job::{ClaimedJob, JobOutcome, JobPayload, JobRecord, JobState, progress_from};
