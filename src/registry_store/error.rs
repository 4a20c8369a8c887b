use super::models::{JobId, JobState};
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The dataset already has a pending, claimed or running job.
    #[error("dataset {0} already has an active job")]
    DuplicateActiveJob(String),

    /// The caller no longer holds the lease on the job.
    #[error("lease on job {0} is no longer held by this worker")]
    LeaseLost(JobId),

    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("dataset already registered: {0}")]
    DatasetAlreadyRegistered(String),

    #[error("invalid dataset url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("check interval must be positive")]
    InvalidCheckInterval,

    #[error("job {0} cannot be cancelled in state {1}")]
    NotCancellable(JobId, JobState),

    #[error("dataset {0} is retired")]
    DatasetRetired(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// The database could not be reached or the operation failed inside it.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}
