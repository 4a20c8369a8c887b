use crate::registry_store::{JobId, RegistryStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum HeartbeatOutcome {
    /// The job finished and the worker stopped the heartbeat.
    Stopped,
    /// The monitor reclaimed the job; the worker must not report.
    LeaseLost,
}

/// Keeps one job's lease alive while the adapter runs it.
pub(super) struct Heartbeat {
    pub store: Arc<dyn RegistryStore>,
    pub job_id: JobId,
    pub worker_id: String,
    pub interval: Duration,
    pub lease_duration: Duration,
}

impl Heartbeat {
    /// Beat until `stop` is cancelled. A cancellation request on the job or a
    /// lost lease trips `cancel_job` so the adapter stops early.
    pub(super) async fn run(
        self,
        cancel_job: CancellationToken,
        stop: CancellationToken,
    ) -> HeartbeatOutcome {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the claim just set the lease.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => return HeartbeatOutcome::Stopped,
                _ = ticker.tick() => {}
            }

            match self
                .store
                .heartbeat(self.job_id, &self.worker_id, self.lease_duration)
            {
                Ok(ack) => {
                    debug!(
                        job_id = self.job_id,
                        lease_expires_at = ack.lease_expires_at,
                        "Heartbeat"
                    );
                    if ack.cancel_requested && !cancel_job.is_cancelled() {
                        info!(job_id = self.job_id, "Cancellation requested, stopping job");
                        cancel_job.cancel();
                    }
                }
                Err(StoreError::LeaseLost(_)) | Err(StoreError::JobNotFound(_)) => {
                    warn!(
                        job_id = self.job_id,
                        worker_id = %self.worker_id,
                        "Lease lost, abandoning job"
                    );
                    cancel_job.cancel();
                    return HeartbeatOutcome::LeaseLost;
                }
                Err(e) => {
                    warn!(job_id = self.job_id, "Heartbeat failed, will retry: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry_store::{now_millis, Dataset, JobKind, SqliteRegistryStore};

    fn claimed_job(store: &SqliteRegistryStore, lease: Duration) -> JobId {
        let dataset = Dataset::new("https://example.org/ds", 60, now_millis());
        store.insert_dataset(&dataset).unwrap();
        store
            .create_job(&dataset.id, JobKind::Verify, now_millis(), 3)
            .unwrap();
        store.claim_next("w1", lease).unwrap().unwrap().id
    }

    #[tokio::test]
    async fn test_heartbeat_relays_cancel_request() {
        let store = Arc::new(SqliteRegistryStore::in_memory().unwrap());
        let job_id = claimed_job(&store, Duration::from_secs(30));
        store.cancel_job(job_id).unwrap();

        let heartbeat = Heartbeat {
            store: store.clone(),
            job_id,
            worker_id: "w1".to_string(),
            interval: Duration::from_millis(20),
            lease_duration: Duration::from_secs(30),
        };
        let cancel_job = CancellationToken::new();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(heartbeat.run(cancel_job.clone(), stop.clone()));

        tokio::time::timeout(Duration::from_secs(2), cancel_job.cancelled())
            .await
            .unwrap();
        stop.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_heartbeat_reports_lost_lease() {
        let store = Arc::new(SqliteRegistryStore::in_memory().unwrap());
        let job_id = claimed_job(&store, Duration::from_secs(30));

        let heartbeat = Heartbeat {
            store: store.clone(),
            job_id,
            worker_id: "someone-else".to_string(),
            interval: Duration::from_millis(20),
            lease_duration: Duration::from_secs(30),
        };
        let cancel_job = CancellationToken::new();
        let outcome = heartbeat
            .run(cancel_job.clone(), CancellationToken::new())
            .await;

        assert_eq!(outcome, HeartbeatOutcome::LeaseLost);
        assert!(cancel_job.is_cancelled());
    }
}
