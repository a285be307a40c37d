//! Polling job scheduler for reelq.
//!
//! Claims pending rows from the task table in batches, runs each claimed job
//! on a bounded set of worker tasks and records the terminal state when the
//! job function returns. Uses `FOR UPDATE SKIP LOCKED` so concurrent claimers
//! never see the same rows.

pub mod claim;
pub mod completion;
pub mod error;
pub mod job;
pub mod recovery;
pub mod scheduler;

pub use completion::{Completion, complete};
pub use error::{SchedulerError, SchedulerResult};
pub use job::{JobFunction, ProgressReporter, panic_message};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle, SchedulerStats};
