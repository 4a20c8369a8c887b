//! Durable record of datasets, jobs, leases and alerts.
//!
//! The store is the only synchronization point between the scheduler, the
//! worker pool and the monitor: every state transition is a conditional
//! update, so concurrent callers racing for the same row get exactly one
//! winner.

mod error;
mod models;
mod schema;
mod sqlite_registry_store;

pub use error::{StoreError, StoreResult};
pub use models::*;
pub use sqlite_registry_store::SqliteRegistryStore;

use std::time::Duration;

pub trait RegistryStore: Send + Sync {
    // === Datasets ===

    /// Insert a newly registered dataset. Fails with `DatasetAlreadyRegistered`
    /// if the URL is already known.
    fn insert_dataset(&self, dataset: &Dataset) -> StoreResult<()>;

    fn get_dataset(&self, id: &str) -> StoreResult<Option<Dataset>>;

    fn find_dataset_by_url(&self, url: &str) -> StoreResult<Option<Dataset>>;

    fn list_datasets(&self, filter: &DatasetFilter) -> StoreResult<Vec<Dataset>>;

    /// Datasets that are not retired and have no active job.
    fn schedulable_datasets(&self) -> StoreResult<Vec<Dataset>>;

    /// Datasets with at least `min_failures` consecutive failures.
    fn failing_datasets(&self, min_failures: u32) -> StoreResult<Vec<Dataset>>;

    /// Raise a dataset's status, provided its failure count is still the one
    /// the caller observed. Returns false if the dataset moved on meanwhile.
    fn escalate_status(
        &self,
        dataset_id: &str,
        status: DatasetStatus,
        observed_failures: u32,
    ) -> StoreResult<bool>;

    /// Record that new content was announced for a dataset.
    fn announce_update(&self, dataset_id: &str, now: i64) -> StoreResult<()>;

    /// Mark a dataset retired. Its pending job is cancelled and a leased job
    /// gets a cancellation request.
    fn retire_dataset(&self, dataset_id: &str, now: i64) -> StoreResult<()>;

    // === Jobs ===

    /// Create a pending job. Fails with `DuplicateActiveJob` if the dataset
    /// already has a pending, claimed or running job.
    fn create_job(
        &self,
        dataset_id: &str,
        kind: JobKind,
        scheduled_at: i64,
        max_attempts: u32,
    ) -> StoreResult<JobId>;

    fn get_job(&self, id: JobId) -> StoreResult<Option<Job>>;

    /// List jobs, most recent first.
    fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>>;

    fn active_job_for_dataset(&self, dataset_id: &str) -> StoreResult<Option<Job>>;

    /// Cancel a pending job, or request cancellation of a leased one.
    fn cancel_job(&self, id: JobId) -> StoreResult<CancelOutcome>;

    fn job_events(&self, id: JobId) -> StoreResult<Vec<JobEvent>>;

    /// Number of jobs in each state.
    fn count_jobs_by_state(&self) -> StoreResult<Vec<(JobState, usize)>>;

    /// Delete terminal jobs (and their events) finished before the cutoff.
    fn prune_finished_jobs(&self, finished_before: i64) -> StoreResult<usize>;

    // === Leases ===

    /// Atomically claim the oldest eligible pending job (by `scheduled_at`,
    /// then id) for `worker_id`. Increments the attempt count.
    fn claim_next(&self, worker_id: &str, lease_duration: Duration) -> StoreResult<Option<Job>>;

    /// claimed -> running.
    fn mark_running(&self, job_id: JobId, worker_id: &str) -> StoreResult<()>;

    /// Extend the lease. Fails with `LeaseLost` if the job was reclaimed.
    fn heartbeat(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease_duration: Duration,
    ) -> StoreResult<HeartbeatAck>;

    /// Finish a leased job successfully and apply the result to its dataset.
    fn complete(&self, job_id: JobId, worker_id: &str, result: &ExecutionResult)
        -> StoreResult<()>;

    /// Finish a leased job as failed and count the failure against its dataset.
    fn fail(&self, job_id: JobId, worker_id: &str, failure: &JobFailure) -> StoreResult<()>;

    /// Return a leased job to pending, eligible again at `next_eligible_at`.
    fn retry_later(
        &self,
        job_id: JobId,
        worker_id: &str,
        failure: &JobFailure,
        next_eligible_at: i64,
    ) -> StoreResult<()>;

    /// Finish a leased job as cancelled after the worker honoured a request.
    fn acknowledge_cancel(&self, job_id: JobId, worker_id: &str) -> StoreResult<()>;

    /// Leased jobs whose lease expired at or before `now`.
    fn expired_leases(&self, now: i64) -> StoreResult<Vec<Job>>;

    /// Take an expired lease away from its worker. Succeeds only if the job
    /// still carries the worker and lease expiry observed in `job`, so a
    /// given expiry is reclaimed at most once.
    fn reclaim_job(
        &self,
        job: &Job,
        disposition: ReclaimDisposition,
        now: i64,
    ) -> StoreResult<bool>;

    /// Running jobs started at or before `started_before`.
    fn long_running_jobs(&self, started_before: i64) -> StoreResult<Vec<Job>>;

    // === Alerts ===

    /// Datasets whose current status has not been alerted yet, or which
    /// recovered after an alert.
    fn datasets_pending_alert(&self) -> StoreResult<Vec<Dataset>>;

    /// Record an alert for the dataset's current status. Returns `None` if
    /// the transition was already alerted (or no longer applies).
    fn record_alert(
        &self,
        dataset_id: &str,
        kind: AlertKind,
        now: i64,
    ) -> StoreResult<Option<AlertEvent>>;

    fn list_alerts(&self, dataset_id: Option<&str>, limit: usize) -> StoreResult<Vec<AlertEvent>>;
}
