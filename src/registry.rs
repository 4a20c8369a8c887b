//! Inbound interface: what operators and other services call.

use crate::config::SchedulerSettings;
use crate::metrics;
use crate::registry_store::{
    now_millis, AlertEvent, CancelOutcome, Dataset, DatasetFilter, DatasetStatus, Job, JobEvent,
    JobFilter, JobId, JobKind, JobState, RegistryStore, StoreError, StoreResult,
};
use crate::retry_policy::RetryPolicy;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

const REMOTE_SCHEMES: [&str; 5] = ["http", "https", "ssh", "git", "file"];

lazy_static! {
    static ref SCHEME_URL: Regex = Regex::new(r"^([A-Za-z][A-Za-z0-9+.-]*)://(.*)$").unwrap();
    // [user@]host:path, as understood by git
    static ref SCP_LIKE: Regex = Regex::new(r"^(?:[A-Za-z0-9._~-]+@)?[A-Za-z0-9.-]+:.+$").unwrap();
}

/// Check that `url` names something the dataset tool can clone.
///
/// Accepts `http`, `https`, `ssh`, `git` and `file` URLs, scp-like
/// `host:path` locations and absolute local paths.
pub fn validate_dataset_url(url: &str) -> StoreResult<String> {
    let url = url.trim();
    let invalid = |reason: &str| StoreError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    if url.is_empty() {
        return Err(invalid("url is empty"));
    }
    if url.chars().any(char::is_whitespace) {
        return Err(invalid("url contains whitespace"));
    }

    if let Some(caps) = SCHEME_URL.captures(url) {
        let scheme = caps[1].to_ascii_lowercase();
        let rest = &caps[2];
        if !REMOTE_SCHEMES.contains(&scheme.as_str()) {
            return Err(invalid(&format!("unsupported scheme '{}'", scheme)));
        }
        if scheme == "file" {
            if !rest.starts_with('/') {
                return Err(invalid("file urls must use an absolute path"));
            }
        } else if rest.is_empty() || rest.starts_with('/') {
            return Err(invalid("missing host"));
        }
        return Ok(url.to_string());
    }

    if url.starts_with('/') {
        return Ok(url.to_string());
    }
    if SCP_LIKE.is_match(url) {
        return Ok(url.to_string());
    }

    Err(invalid("local paths must be absolute"))
}

/// User-facing view of a dataset's health. Retry bookkeeping stays internal.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetStatusReport {
    pub dataset_id: String,
    pub url: String,
    pub status: DatasetStatus,
    pub last_revision: Option<String>,
    pub last_checked_at: Option<i64>,
    pub last_changed_at: Option<i64>,
    pub last_error: Option<String>,
    pub retired: bool,
    pub active_job: Option<ActiveJob>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveJob {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
}

/// Facade over the store for registration, lookups and operator actions.
pub struct DatasetRegistry {
    store: Arc<dyn RegistryStore>,
    default_check_interval_secs: u64,
    retry_policy: RetryPolicy,
}

impl DatasetRegistry {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        scheduler: &SchedulerSettings,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            default_check_interval_secs: scheduler.default_check_interval_secs,
            retry_policy,
        }
    }

    /// Register a dataset and enqueue its register job right away, without
    /// waiting for the scheduler.
    pub fn register_dataset(
        &self,
        url: &str,
        check_interval_secs: Option<u64>,
    ) -> StoreResult<Dataset> {
        let url = validate_dataset_url(url)?;
        if check_interval_secs == Some(0) {
            return Err(StoreError::InvalidCheckInterval);
        }
        if self.store.find_dataset_by_url(&url)?.is_some() {
            return Err(StoreError::DatasetAlreadyRegistered(url));
        }

        let now = now_millis();
        let dataset = Dataset::new(
            url,
            check_interval_secs.unwrap_or(self.default_check_interval_secs),
            now,
        );
        self.store.insert_dataset(&dataset)?;

        let job_id = self.store.create_job(
            &dataset.id,
            JobKind::Register,
            now,
            self.retry_policy.max_attempts,
        )?;
        metrics::record_job_created(JobKind::Register);

        info!(
            dataset_id = %dataset.id,
            url = %dataset.url,
            job_id,
            "Registered dataset"
        );
        Ok(dataset)
    }

    pub fn get_dataset(&self, id: &str) -> StoreResult<Dataset> {
        self.store
            .get_dataset(id)?
            .ok_or_else(|| StoreError::DatasetNotFound(id.to_string()))
    }

    pub fn get_dataset_status(&self, id: &str) -> StoreResult<DatasetStatusReport> {
        let dataset = self.get_dataset(id)?;
        let active_job = self
            .store
            .active_job_for_dataset(&dataset.id)?
            .map(|job| ActiveJob {
                id: job.id,
                kind: job.kind,
                state: job.state,
            });

        Ok(DatasetStatusReport {
            retired: dataset.is_retired(),
            dataset_id: dataset.id,
            url: dataset.url,
            status: dataset.status,
            last_revision: dataset.last_revision,
            last_checked_at: dataset.last_checked_at,
            last_changed_at: dataset.last_changed_at,
            last_error: dataset.last_error,
            active_job,
        })
    }

    pub fn list_datasets(&self, filter: &DatasetFilter) -> StoreResult<Vec<Dataset>> {
        self.store.list_datasets(filter)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        self.store.list_jobs(filter)
    }

    pub fn get_job(&self, id: JobId) -> StoreResult<Job> {
        self.store.get_job(id)?.ok_or(StoreError::JobNotFound(id))
    }

    pub fn job_events(&self, id: JobId) -> StoreResult<Vec<JobEvent>> {
        self.get_job(id)?;
        self.store.job_events(id)
    }

    pub fn list_alerts(&self, dataset_id: Option<&str>, limit: usize) -> StoreResult<Vec<AlertEvent>> {
        self.store.list_alerts(dataset_id, limit)
    }

    /// Note that a dataset has new content. The scheduler enqueues a refresh
    /// job on its next tick.
    pub fn announce_update(&self, url: &str) -> StoreResult<Dataset> {
        let url = url.trim();
        let dataset = self
            .store
            .find_dataset_by_url(url)?
            .ok_or_else(|| StoreError::DatasetNotFound(url.to_string()))?;
        if dataset.is_retired() {
            return Err(StoreError::DatasetRetired(dataset.id));
        }

        self.store.announce_update(&dataset.id, now_millis())?;
        info!(dataset_id = %dataset.id, url = %dataset.url, "Update announced");
        self.get_dataset(&dataset.id)
    }

    pub fn cancel_job(&self, id: JobId) -> StoreResult<CancelOutcome> {
        let outcome = self.store.cancel_job(id)?;
        info!(job_id = id, "Job cancel: {:?}", outcome);
        Ok(outcome)
    }

    pub fn retire_dataset(&self, id: &str) -> StoreResult<()> {
        self.store.retire_dataset(id, now_millis())?;
        info!(dataset_id = %id, "Dataset retired");
        Ok(())
    }
}
