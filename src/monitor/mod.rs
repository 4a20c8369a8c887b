//! Monitor: reclaims stuck jobs, escalates failing datasets and emits alerts.
//!
//! The monitor never runs dataset work itself. Each tick:
//! 1. Reclaims jobs whose lease expired without a heartbeat
//! 2. Raises dataset status once failure thresholds are crossed
//! 3. Sends one alert per status transition, plus recoveries
//! 4. Logs slow but alive jobs and prunes old finished jobs

mod alerts;

pub use alerts::{AlertNotifier, LogAlertNotifier, WebhookAlertNotifier};

use crate::config::MonitorSettings;
use crate::metrics;
use crate::registry_store::{
    now_millis, AlertKind, Dataset, DatasetStatus, Job, ReclaimDisposition, RegistryStore,
    StoreResult,
};
use crate::retry_policy::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DAY_MS: i64 = 86_400_000;

/// What one monitor tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorTickReport {
    pub reclaimed: usize,
    pub escalated: usize,
    pub alerts_sent: usize,
    pub long_running: usize,
    pub pruned: usize,
}

pub struct Monitor {
    store: Arc<dyn RegistryStore>,
    notifier: Arc<dyn AlertNotifier>,
    settings: MonitorSettings,
    retry_policy: RetryPolicy,
}

impl Monitor {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        notifier: Arc<dyn AlertNotifier>,
        settings: MonitorSettings,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            notifier,
            settings,
            retry_policy,
        }
    }

    pub async fn tick(&self, now: i64) -> StoreResult<MonitorTickReport> {
        let mut report = MonitorTickReport {
            reclaimed: self.reclaim_expired(now)?,
            escalated: self.escalate_failing()?,
            ..Default::default()
        };
        report.alerts_sent = self.send_alerts(now).await?;

        let long_running_ms = (self.settings.long_running_threshold_secs as i64) * 1000;
        let slow = self.store.long_running_jobs(now - long_running_ms)?;
        for job in &slow {
            info!(
                job_id = job.id,
                dataset_id = %job.dataset_id,
                kind = %job.kind,
                worker_id = job.claimed_by.as_deref().unwrap_or("-"),
                "Job still running after {}s",
                (now - job.started_at.unwrap_or(now)) / 1000
            );
        }
        report.long_running = slow.len();

        let retention_ms = (self.settings.job_retention_days as i64).saturating_mul(DAY_MS);
        report.pruned = self.store.prune_finished_jobs(now - retention_ms)?;
        if report.pruned > 0 {
            info!("Pruned {} finished jobs", report.pruned);
        }

        metrics::set_jobs_by_state(&self.store.count_jobs_by_state()?);
        Ok(report)
    }

    fn reclaim_expired(&self, now: i64) -> StoreResult<usize> {
        let mut reclaimed = 0;
        for job in self.store.expired_leases(now)? {
            let disposition = self.disposition_for(&job, now);
            if !self.store.reclaim_job(&job, disposition, now)? {
                // The worker heartbeated or reported in the meantime.
                debug!(job_id = job.id, "Lease renewed before reclaim, skipping");
                continue;
            }

            let label = match disposition {
                ReclaimDisposition::Pending { .. } => "pending",
                ReclaimDisposition::Failed => "failed",
                ReclaimDisposition::Cancelled => "cancelled",
            };
            warn!(
                job_id = job.id,
                dataset_id = %job.dataset_id,
                worker_id = job.claimed_by.as_deref().unwrap_or("-"),
                attempt = job.attempts,
                "Lease expired, job reclaimed to {}",
                label
            );
            metrics::record_lease_reclaimed(label);
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    fn disposition_for(&self, job: &Job, now: i64) -> ReclaimDisposition {
        if job.cancel_requested {
            ReclaimDisposition::Cancelled
        } else if job.has_attempts_remaining() {
            ReclaimDisposition::Pending {
                next_eligible_at: self.retry_policy.next_eligible_at(job.attempts, now),
            }
        } else {
            ReclaimDisposition::Failed
        }
    }

    /// Status a dataset should have given its failure count, if it is past a
    /// threshold.
    fn threshold_status(&self, dataset: &Dataset) -> Option<DatasetStatus> {
        if dataset.consecutive_failures >= self.settings.unreachable_threshold {
            Some(DatasetStatus::Unreachable)
        } else if dataset.consecutive_failures >= self.settings.degraded_threshold {
            Some(DatasetStatus::Degraded)
        } else {
            None
        }
    }

    fn escalate_failing(&self) -> StoreResult<usize> {
        let mut escalated = 0;
        for dataset in self.store.failing_datasets(self.settings.degraded_threshold)? {
            let Some(target) = self.threshold_status(&dataset) else {
                continue;
            };
            if target.severity() <= dataset.status.severity() {
                continue;
            }
            if self
                .store
                .escalate_status(&dataset.id, target, dataset.consecutive_failures)?
            {
                info!(
                    dataset_id = %dataset.id,
                    url = %dataset.url,
                    consecutive_failures = dataset.consecutive_failures,
                    "Dataset status {} -> {}",
                    dataset.status,
                    target
                );
                escalated += 1;
            }
        }
        Ok(escalated)
    }

    async fn send_alerts(&self, now: i64) -> StoreResult<usize> {
        let mut sent = 0;
        for dataset in self.store.datasets_pending_alert()? {
            let kind = AlertKind::for_status(dataset.status).unwrap_or(AlertKind::Recovered);
            let Some(alert) = self.store.record_alert(&dataset.id, kind, now)? else {
                continue;
            };

            metrics::record_alert(kind.as_str());
            // The alert is recorded either way; delivery is best effort.
            if let Err(e) = self.notifier.notify(&alert).await {
                warn!(
                    dataset_id = %alert.dataset_id,
                    "Failed to deliver {} alert: {:#}",
                    kind.as_str(),
                    e
                );
            }
            sent += 1;
        }
        Ok(sent)
    }

    /// Tick every `tick_interval_secs` until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Monitor starting (tick={}s, degraded at {} failures, unreachable at {})",
            self.settings.tick_interval_secs,
            self.settings.degraded_threshold,
            self.settings.unreachable_threshold
        );

        let mut ticker = tokio::time::interval(Duration::from_secs(self.settings.tick_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            match self.tick(now_millis()).await {
                Ok(report) => {
                    metrics::record_tick("monitor", "ok");
                    debug!("Monitor tick: {:?}", report);
                }
                Err(e) => {
                    metrics::record_tick("monitor", "skipped");
                    warn!("Monitor tick skipped: {}", e);
                }
            }
        }

        info!("Monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry_store::{
        ExecutionResult, FailureKind, HealthSignal, JobKind, JobState, SqliteRegistryStore,
    };

    fn monitor(store: Arc<SqliteRegistryStore>) -> Monitor {
        Monitor::new(
            store,
            Arc::new(LogAlertNotifier),
            MonitorSettings {
                degraded_threshold: 2,
                unreachable_threshold: 4,
                ..MonitorSettings::default()
            },
            RetryPolicy::default(),
        )
    }

    fn dataset_with_failures(store: &SqliteRegistryStore, failures: u32) -> Dataset {
        let mut dataset = Dataset::new("https://example.org/ds", 3600, 0);
        dataset.processed = true;
        dataset.consecutive_failures = failures;
        store.insert_dataset(&dataset).unwrap();
        dataset
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed_to_pending() {
        let store = Arc::new(SqliteRegistryStore::in_memory().unwrap());
        let dataset = dataset_with_failures(&store, 0);
        let id = store
            .create_job(&dataset.id, JobKind::Verify, 0, 3)
            .unwrap();
        store.claim_next("w1", Duration::ZERO).unwrap().unwrap();

        let now = now_millis() + 1;
        let report = monitor(store.clone()).tick(now).await.unwrap();
        assert_eq!(report.reclaimed, 1);

        let job = store.get_job(id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(job.scheduled_at > now);
        assert_eq!(job.claimed_by, None);

        // Already reclaimed: a second tick has nothing to do.
        assert_eq!(monitor(store).tick(now).await.unwrap().reclaimed, 0);
    }

    #[tokio::test]
    async fn test_escalation_never_downgrades() {
        let store = Arc::new(SqliteRegistryStore::in_memory().unwrap());
        let dataset = dataset_with_failures(&store, 4);

        let report = monitor(store.clone()).tick(now_millis()).await.unwrap();
        assert_eq!(report.escalated, 1);
        assert_eq!(report.alerts_sent, 1);
        let stored = store.get_dataset(&dataset.id).unwrap().unwrap();
        assert_eq!(stored.status, DatasetStatus::Unreachable);

        let report = monitor(store.clone()).tick(now_millis()).await.unwrap();
        assert_eq!(report.escalated, 0);
        assert_eq!(report.alerts_sent, 0);
    }

    #[tokio::test]
    async fn test_recovery_alert_after_success() {
        let store = Arc::new(SqliteRegistryStore::in_memory().unwrap());
        let dataset = dataset_with_failures(&store, 2);
        let monitor = monitor(store.clone());
        monitor.tick(now_millis()).await.unwrap();

        store
            .create_job(&dataset.id, JobKind::Verify, 0, 3)
            .unwrap();
        let job = store
            .claim_next("w1", Duration::from_secs(30))
            .unwrap()
            .unwrap();
        store
            .complete(
                job.id,
                "w1",
                &ExecutionResult {
                    revision: Some("abc".to_string()),
                    size_bytes: 1,
                    health_signal: HealthSignal::Healthy,
                    revision_changed: false,
                    metadata: None,
                    detail: None,
                },
            )
            .unwrap();

        let report = monitor.tick(now_millis()).await.unwrap();
        assert_eq!(report.alerts_sent, 1);
        let alerts = store.list_alerts(Some(&dataset.id), 10).unwrap();
        let kinds: Vec<AlertKind> = alerts.iter().map(|a| a.kind).collect();
        assert!(kinds.contains(&AlertKind::Degraded));
        assert!(kinds.contains(&AlertKind::Recovered));
    }

    #[tokio::test]
    async fn test_reclaim_at_cap_fails_job() {
        let store = Arc::new(SqliteRegistryStore::in_memory().unwrap());
        let dataset = dataset_with_failures(&store, 0);
        let id = store
            .create_job(&dataset.id, JobKind::Verify, 0, 1)
            .unwrap();
        store.claim_next("w1", Duration::ZERO).unwrap().unwrap();

        monitor(store.clone()).tick(now_millis() + 1).await.unwrap();

        let job = store.get_job(id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error_kind, Some(FailureKind::LeaseExpired));
        let stored = store.get_dataset(&dataset.id).unwrap().unwrap();
        assert_eq!(stored.consecutive_failures, 1);
    }
}
