//! Periodic scheduler deciding which datasets need a new job.

mod check_policy;

pub use check_policy::{candidate_for, effective_interval_secs, prioritize, Candidate};

use crate::config::SchedulerSettings;
use crate::metrics;
use crate::registry_store::{now_millis, RegistryStore, StoreError, StoreResult};
use crate::retry_policy::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerTickReport {
    pub candidates: usize,
    pub created: usize,
    /// Datasets that got an active job from someone else since the scan.
    pub skipped_duplicates: usize,
}

pub struct Scheduler {
    store: Arc<dyn RegistryStore>,
    settings: SchedulerSettings,
    retry_policy: RetryPolicy,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        settings: SchedulerSettings,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            settings,
            retry_policy,
        }
    }

    /// Scan schedulable datasets and enqueue the jobs that are due.
    ///
    /// Running it twice in a row creates nothing the second time: the store
    /// rejects a second active job per dataset.
    pub fn tick(&self, now: i64) -> StoreResult<SchedulerTickReport> {
        let datasets = self.store.schedulable_datasets()?;
        let mut candidates: Vec<Candidate> = datasets
            .iter()
            .filter_map(|dataset| candidate_for(dataset, &self.settings, now))
            .collect();
        prioritize(&mut candidates);

        let mut report = SchedulerTickReport {
            candidates: candidates.len(),
            ..Default::default()
        };

        for candidate in candidates {
            if let Some(cap) = self.settings.max_jobs_per_tick {
                if report.created >= cap {
                    debug!(
                        "Scheduler reached its cap of {} jobs, leaving the rest for later",
                        cap
                    );
                    break;
                }
            }

            match self.store.create_job(
                &candidate.dataset_id,
                candidate.kind,
                now,
                self.retry_policy.max_attempts,
            ) {
                Ok(job_id) => {
                    debug!(
                        job_id,
                        dataset_id = %candidate.dataset_id,
                        kind = %candidate.kind,
                        overdue_ms = candidate.overdue_ms,
                        "Scheduled job"
                    );
                    metrics::record_job_created(candidate.kind);
                    report.created += 1;
                }
                Err(StoreError::DuplicateActiveJob(_)) => {
                    report.skipped_duplicates += 1;
                }
                // Retired between the scan and the insert.
                Err(StoreError::DatasetRetired(_)) | Err(StoreError::DatasetNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    /// Tick every `tick_interval_secs` until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Scheduler starting (tick={}s, default interval={}s)",
            self.settings.tick_interval_secs, self.settings.default_check_interval_secs
        );

        let mut ticker = tokio::time::interval(Duration::from_secs(self.settings.tick_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            match self.tick(now_millis()) {
                Ok(report) => {
                    metrics::record_tick("scheduler", "ok");
                    if report.created > 0 {
                        info!(
                            "Scheduler created {} jobs ({} candidates, {} already active)",
                            report.created, report.candidates, report.skipped_duplicates
                        );
                    }
                }
                Err(e) => {
                    metrics::record_tick("scheduler", "skipped");
                    warn!("Scheduler tick skipped: {}", e);
                }
            }
        }

        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry_store::{Dataset, JobFilter, JobKind, JobState, SqliteRegistryStore};

    const HOUR_MS: i64 = 3_600_000;

    fn scheduler(store: Arc<SqliteRegistryStore>, max_jobs_per_tick: Option<usize>) -> Scheduler {
        Scheduler::new(
            store,
            SchedulerSettings {
                max_jobs_per_tick,
                ..SchedulerSettings::default()
            },
            RetryPolicy::default(),
        )
    }

    fn processed_dataset(store: &SqliteRegistryStore, url: &str, last_checked_at: i64) -> Dataset {
        let mut dataset = Dataset::new(url, 3600, 0);
        dataset.processed = true;
        dataset.last_checked_at = Some(last_checked_at);
        store.insert_dataset(&dataset).unwrap();
        dataset
    }

    #[test]
    fn test_tick_creates_one_verify_job_for_stale_dataset() {
        let store = Arc::new(SqliteRegistryStore::in_memory().unwrap());
        let now = 100 * HOUR_MS;
        let dataset = processed_dataset(&store, "https://example.org/a", now - 2 * HOUR_MS);

        let report = scheduler(store.clone(), None).tick(now).unwrap();
        assert_eq!(report.created, 1);

        let jobs = store
            .list_jobs(&JobFilter {
                dataset_id: Some(dataset.id.clone()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, JobKind::Verify);
        assert_eq!(jobs[0].state, JobState::Pending);
        assert_eq!(jobs[0].max_attempts, 3);
    }

    #[test]
    fn test_tick_is_idempotent() {
        let store = Arc::new(SqliteRegistryStore::in_memory().unwrap());
        let now = 100 * HOUR_MS;
        processed_dataset(&store, "https://example.org/a", now - 2 * HOUR_MS);
        let scheduler = scheduler(store.clone(), None);

        assert_eq!(scheduler.tick(now).unwrap().created, 1);
        assert_eq!(scheduler.tick(now + 1_000).unwrap().created, 0);
        assert_eq!(store.list_jobs(&JobFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_tick_respects_cap_and_priority() {
        let store = Arc::new(SqliteRegistryStore::in_memory().unwrap());
        let now = 100 * HOUR_MS;
        processed_dataset(&store, "https://example.org/a", now - 2 * HOUR_MS);
        let fresh = Dataset::new("https://example.org/new", 3600, now);
        store.insert_dataset(&fresh).unwrap();

        let report = scheduler(store.clone(), Some(1)).tick(now).unwrap();
        assert_eq!(report.candidates, 2);
        assert_eq!(report.created, 1);

        let jobs = store.list_jobs(&JobFilter::default()).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].dataset_id, fresh.id);
        assert_eq!(jobs[0].kind, JobKind::Register);
    }

    #[test]
    fn test_tick_skips_retired_datasets() {
        let store = Arc::new(SqliteRegistryStore::in_memory().unwrap());
        let now = 100 * HOUR_MS;
        let dataset = processed_dataset(&store, "https://example.org/a", now - 2 * HOUR_MS);
        store.retire_dataset(&dataset.id, now).unwrap();

        assert_eq!(scheduler(store, None).tick(now).unwrap().created, 0);
    }
}
