//! Retry policy for failed jobs.
//!
//! Implements exponential backoff with configurable parameters.

use crate::config::RetrySettings;
use crate::execution::ExecutionError;
use crate::registry_store::Job;

/// Retry policy implementing exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts given to newly created jobs. Each job keeps its own copy.
    pub max_attempts: u32,
    /// Initial backoff duration in seconds.
    pub initial_backoff_secs: u64,
    /// Maximum backoff duration in seconds (cap for exponential growth).
    pub max_backoff_secs: u64,
    /// Multiplier applied to backoff after each attempt.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(config: &RetrySettings) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff_secs: config.initial_backoff_secs,
            max_backoff_secs: config.max_backoff_secs,
            backoff_multiplier: config.backoff_multiplier,
        }
    }

    /// Time (Unix millis) at which a job that has used `attempts` attempts
    /// becomes eligible again.
    ///
    /// The first retry waits `initial_backoff`, each further one multiplies it,
    /// capped at `max_backoff_secs`.
    pub fn next_eligible_at(&self, attempts: u32, now: i64) -> i64 {
        let exponent = attempts.saturating_sub(1);
        now + (self.backoff_secs(exponent) as i64) * 1000
    }

    /// Whether a failed job should go back to pending.
    ///
    /// Returns true if:
    /// - The error is retryable (not permanent, not a cancellation)
    /// - The job has attempts left under the cap it was created with
    pub fn should_retry(&self, error: &ExecutionError, job: &Job) -> bool {
        error.is_retryable() && job.has_attempts_remaining()
    }

    /// Backoff duration in seconds after `retry_count` previous retries.
    pub fn backoff_secs(&self, retry_count: u32) -> u64 {
        let exponent = retry_count.min(i32::MAX as u32) as i32;
        let backoff = self.initial_backoff_secs as f64 * self.backoff_multiplier.powi(exponent);
        (backoff.min(self.max_backoff_secs as f64)) as u64
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_secs: 30,
            max_backoff_secs: 3600,
            backoff_multiplier: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry_store::{JobKind, JobState};

    fn job_at_attempt(attempts: u32, max_attempts: u32) -> Job {
        Job {
            id: 1,
            dataset_id: "ds".to_string(),
            kind: JobKind::Verify,
            state: JobState::Running,
            attempts,
            max_attempts,
            scheduled_at: 0,
            created_at: 0,
            claimed_by: Some("w1".to_string()),
            lease_expires_at: Some(0),
            last_heartbeat_at: None,
            started_at: None,
            finished_at: None,
            cancel_requested: false,
            result: None,
            error_kind: None,
            error_detail: None,
        }
    }

    #[test]
    fn test_settings_carry_over() {
        let policy = RetryPolicy::new(&RetrySettings {
            max_attempts: 4,
            initial_backoff_secs: 15,
            max_backoff_secs: 900,
            backoff_multiplier: 1.5,
        });

        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.backoff_secs(0), 15);
        assert_eq!(policy.backoff_secs(2), 33);
    }

    #[test]
    fn test_default_backoff_doubles_until_capped() {
        let policy = RetryPolicy::default();

        let waits: Vec<u64> = (0..9).map(|n| policy.backoff_secs(n)).collect();
        assert_eq!(waits, vec![30, 60, 120, 240, 480, 960, 1920, 3600, 3600]);
        assert_eq!(policy.backoff_secs(u32::MAX), 3600);
    }

    #[test]
    fn test_next_eligible_at_after_first_attempt() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff_secs: 30,
            max_backoff_secs: 3600,
            backoff_multiplier: 2.0,
        };

        assert_eq!(policy.next_eligible_at(1, 1_000), 31_000);
        assert_eq!(policy.next_eligible_at(2, 1_000), 61_000);
        // A job reclaimed before it ever ran still waits the initial backoff.
        assert_eq!(policy.next_eligible_at(0, 1_000), 31_000);
    }

    #[test]
    fn test_should_retry_respects_attempt_cap() {
        let policy = RetryPolicy::default();
        let timeout = ExecutionError::Transient("timed out".to_string());

        assert!(policy.should_retry(&timeout, &job_at_attempt(1, 3)));
        assert!(policy.should_retry(&timeout, &job_at_attempt(2, 3)));
        assert!(!policy.should_retry(&timeout, &job_at_attempt(3, 3)));
        // The job's own cap wins over the policy's current setting.
        assert!(policy.should_retry(&timeout, &job_at_attempt(3, 5)));
    }

    #[test]
    fn test_should_retry_never_for_permanent() {
        let policy = RetryPolicy::default();
        let gone = ExecutionError::Permanent("repository not found".to_string());

        let job = job_at_attempt(1, 3);

        assert!(!policy.should_retry(&gone, &job));
        assert!(!policy.should_retry(&ExecutionError::Cancelled, &job));
        assert!(policy.should_retry(&ExecutionError::Unexpected("crash".to_string()), &job));
    }

    #[test]
    fn test_no_backoff_retries_immediately() {
        let policy = RetryPolicy {
            initial_backoff_secs: 0,
            ..RetryPolicy::default()
        };

        assert_eq!(policy.next_eligible_at(1, 500), 500);
        assert_eq!(policy.next_eligible_at(7, 500), 500);
    }
}
