use crate::registry_store::{ExecutionResult, FailureKind, Job, JobFailure, JobId, JobKind};
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Everything an adapter needs to know to run one job attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub job_id: JobId,
    pub dataset_id: String,
    pub kind: JobKind,
    pub url: String,
    /// Revision recorded by the previous successful job, if any.
    pub last_revision: Option<String>,
    pub attempt: u32,
}

impl ExecutionRequest {
    pub fn for_job(job: &Job, url: impl Into<String>, last_revision: Option<String>) -> Self {
        Self {
            job_id: job.id,
            dataset_id: job.dataset_id.clone(),
            kind: job.kind,
            url: url.into(),
            last_revision,
            attempt: job.attempts,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// Network trouble or timeout; worth another attempt.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The repository is gone, inaccessible or corrupt.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The tool crashed, could not be spawned or was killed.
    #[error("unexpected failure: {0}")]
    Unexpected(String),

    #[error("cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutionError::Transient(_) | ExecutionError::Unexpected(_)
        )
    }

    /// The failure to persist for this error. Cancellation is not a failure.
    pub fn to_failure(&self) -> Option<JobFailure> {
        match self {
            ExecutionError::Transient(detail) => {
                Some(JobFailure::new(FailureKind::Transient, detail.clone()))
            }
            ExecutionError::Permanent(detail) => {
                Some(JobFailure::new(FailureKind::Permanent, detail.clone()))
            }
            ExecutionError::Unexpected(detail) => {
                Some(JobFailure::new(FailureKind::Unexpected, detail.clone()))
            }
            ExecutionError::Cancelled => None,
        }
    }
}

/// Runs one job attempt. Implementations must honour `cancel` promptly and
/// leave nothing behind on disk once `run` returns.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn run(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(ExecutionError::Transient("timeout".into()).is_retryable());
        assert!(ExecutionError::Unexpected("segfault".into()).is_retryable());
        assert!(!ExecutionError::Permanent("gone".into()).is_retryable());
        assert!(!ExecutionError::Cancelled.is_retryable());
    }

    #[test]
    fn test_failure_mapping() {
        let failure = ExecutionError::Permanent("repository not found".into())
            .to_failure()
            .unwrap();
        assert_eq!(failure.kind, FailureKind::Permanent);
        assert_eq!(failure.detail, "repository not found");
        assert!(ExecutionError::Cancelled.to_failure().is_none());
    }
}
