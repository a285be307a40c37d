//! Job records, states and outcomes.
//!
//! A job is one row in the task table. The scheduler only ever moves a job
//! along `Pending -> InFlight -> {Succeeded, Failed}`; recovery is the single
//! path back from `InFlight` to `Pending`.

use serde::{Deserialize, Serialize};

use crate::{Error, JobId, Result};

/// Persisted state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum JobState {
    /// Created externally, waiting to be claimed.
    Pending = 0,
    /// Claimed by a scheduler, a worker owns it.
    InFlight = 1,
    /// The job function reported success.
    Succeeded = 2,
    /// The job function reported an error or panicked.
    Failed = 3,
}

impl JobState {
    /// The integer code stored in the `state` column.
    pub const fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i16) -> Result<Self> {
        match code {
            0 => Ok(Self::Pending),
            1 => Ok(Self::InFlight),
            2 => Ok(Self::Succeeded),
            3 => Ok(Self::Failed),
            other => Err(Error::InvalidState(other)),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether the core itself is allowed to move a job from `self` to `next`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InFlight)
                | (Self::InFlight, Self::Succeeded)
                | (Self::InFlight, Self::Failed)
                | (Self::InFlight, Self::Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<i16> for JobState {
    type Error = Error;

    fn try_from(code: i16) -> Result<Self> {
        Self::from_code(code)
    }
}

/// Opaque parameters handed to the job function unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Task identifier chosen by whoever inserted the row.
    pub task_uuid: String,
    /// Generation prompt. May be missing on malformed rows.
    pub prompt: Option<String>,
    /// Output width in pixels.
    pub width: i32,
    /// Output height in pixels.
    pub height: i32,
}

impl JobPayload {
    pub fn new(
        task_uuid: impl Into<String>,
        prompt: impl Into<String>,
        width: i32,
        height: i32,
    ) -> Self {
        Self {
            task_uuid: task_uuid.into(),
            prompt: Some(prompt.into()),
            width,
            height,
        }
    }
}

/// A job row as read from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub state: JobState,
    /// 0 to 100, observability only.
    pub progress: u8,
    pub payload: JobPayload,
}

impl JobRecord {
    /// Strip the record down to what the ready queue and the job function need.
    pub fn into_claimed(self) -> ClaimedJob {
        ClaimedJob {
            id: self.id,
            payload: self.payload,
        }
    }
}

/// Ready-queue entry: a claimed job's id plus its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub id: JobId,
    pub payload: JobPayload,
}

/// What a job function hands back: the job id and an optional failure reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub id: JobId,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn success(id: JobId) -> Self {
        Self { id, error: None }
    }

    pub fn failure(id: JobId, reason: impl Into<String>) -> Self {
        Self {
            id,
            error: Some(reason.into()),
        }
    }

    /// The terminal state this outcome maps to.
    pub fn terminal_state(&self) -> JobState {
        if self.error.is_none() {
            JobState::Succeeded
        } else {
            JobState::Failed
        }
    }
}

/// Validate a progress value coming from the store or a job.
pub fn progress_from(value: i64) -> Result<u8> {
    u8::try_from(value)
        .ok()
        .filter(|p| *p <= 100)
        .ok_or(Error::InvalidProgress(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_round_trip() {
        for state in [
            JobState::Pending,
            JobState::InFlight,
            JobState::Succeeded,
            JobState::Failed,
        ] {
            assert_eq!(JobState::from_code(state.code()).unwrap(), state);
        }
        assert!(matches!(
            JobState::from_code(7),
            Err(Error::InvalidState(7))
        ));
    }

    #[test]
    fn test_allowed_transitions() {
        assert!(JobState::Pending.can_transition_to(JobState::InFlight));
        assert!(JobState::InFlight.can_transition_to(JobState::Failed));
        assert!(JobState::InFlight.can_transition_to(JobState::Pending));
        assert!(!JobState::Pending.can_transition_to(JobState::Succeeded));
        assert!(!JobState::Succeeded.can_transition_to(JobState::Pending));
        assert!(!JobState::Failed.can_transition_to(JobState::InFlight));
    }

    #[test]
    fn test_outcome_maps_to_terminal_state() {
        let id = JobId::new(3);
        assert_eq!(JobOutcome::success(id).terminal_state(), JobState::Succeeded);
        assert_eq!(
            JobOutcome::failure(id, "boom").terminal_state(),
            JobState::Failed
        );
    }

    #[test]
    fn test_progress_bounds() {
        assert_eq!(progress_from(0).unwrap(), 0);
        assert_eq!(progress_from(100).unwrap(), 100);
        assert!(progress_from(101).is_err());
        assert!(progress_from(-1).is_err());
    }
}
