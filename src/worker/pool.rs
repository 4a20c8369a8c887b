use super::heartbeat::{Heartbeat, HeartbeatOutcome};
use super::slots::{SlotState, SlotStatus, SlotTable};
use crate::config::WorkerSettings;
use crate::execution::{ExecutionAdapter, ExecutionError, ExecutionRequest};
use crate::metrics;
use crate::registry_store::{
    now_millis, ExecutionResult, FailureKind, Job, JobFailure, RegistryStore, StoreError,
    StoreResult,
};
use crate::retry_policy::RetryPolicy;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Fixed-size pool of workers sharing one store and one adapter.
///
/// Each slot runs its own loop:
/// 1. Claim the oldest eligible pending job
/// 2. Mark it running and start heartbeating
/// 3. Run it through the adapter
/// 4. Report success, retry, failure or cancellation
///
/// A slot never holds more than one job.
pub struct WorkerPool {
    store: Arc<dyn RegistryStore>,
    adapter: Arc<dyn ExecutionAdapter>,
    settings: WorkerSettings,
    retry_policy: RetryPolicy,
    pool_id: String,
    slots: SlotTable,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        adapter: Arc<dyn ExecutionAdapter>,
        settings: WorkerSettings,
        retry_policy: RetryPolicy,
    ) -> Self {
        let slots = SlotTable::new(settings.pool_size);
        Self {
            store,
            adapter,
            settings,
            retry_policy,
            pool_id: format!("worker-{}", uuid::Uuid::new_v4()),
            slots,
        }
    }

    /// Identity used for leases taken by `slot`.
    pub fn worker_id(&self, slot: usize) -> String {
        format!("{}-{}", self.pool_id, slot)
    }

    pub fn slots(&self) -> Vec<SlotStatus> {
        self.slots.snapshot()
    }

    /// Run every slot until `shutdown` is cancelled. Slots stop claiming on
    /// shutdown and finish the job in hand.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Worker pool {} starting with {} slots (lease={}s, heartbeat={}s)",
            self.pool_id,
            self.settings.pool_size,
            self.settings.lease_duration_secs,
            self.settings.heartbeat_interval_secs
        );

        let handles: Vec<_> = (0..self.settings.pool_size)
            .map(|slot| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.run_slot(slot, shutdown).await })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("Worker slot task failed: {}", e);
            }
        }

        info!("Worker pool {} stopped", self.pool_id);
    }

    async fn run_slot(&self, slot: usize, shutdown: CancellationToken) {
        debug!(slot, "Worker slot started");
        while !shutdown.is_cancelled() {
            let idle = match self.process_next(slot).await {
                Ok(processed) => !processed,
                Err(e) => {
                    warn!(slot, "Worker slot store error, backing off: {}", e);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.poll_interval()) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }
        debug!(slot, "Worker slot stopped");
    }

    /// Claim one job for `slot` and drive it to the end.
    ///
    /// Returns `Ok(false)` when nothing was eligible.
    pub async fn process_next(&self, slot: usize) -> StoreResult<bool> {
        let worker_id = self.worker_id(slot);
        let Some(job) = self
            .store
            .claim_next(&worker_id, self.settings.lease_duration())?
        else {
            return Ok(false);
        };

        self.slots.set(slot, SlotState::Claimed, Some(job.id));
        info!(
            job_id = job.id,
            dataset_id = %job.dataset_id,
            kind = %job.kind,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "Claimed job"
        );

        let result = self.execute_claimed(slot, &worker_id, &job).await;
        self.slots.set(slot, SlotState::Idle, None);
        result.map(|_| true)
    }

    async fn execute_claimed(&self, slot: usize, worker_id: &str, job: &Job) -> StoreResult<()> {
        let Some(dataset) = self.store.get_dataset(&job.dataset_id)? else {
            let failure = JobFailure::new(FailureKind::Permanent, "dataset record is missing");
            return self.ignore_lease_lost(job, self.store.fail(job.id, worker_id, &failure));
        };

        if let Err(e) = self.store.mark_running(job.id, worker_id) {
            return self.ignore_lease_lost(job, Err(e));
        }
        self.slots.set(slot, SlotState::Executing, Some(job.id));

        let request = ExecutionRequest::for_job(job, dataset.url, dataset.last_revision);
        let cancel_job = CancellationToken::new();
        let stop_heartbeat = CancellationToken::new();
        let heartbeat = tokio::spawn(
            Heartbeat {
                store: self.store.clone(),
                job_id: job.id,
                worker_id: worker_id.to_string(),
                interval: self.settings.heartbeat_interval(),
                lease_duration: self.settings.lease_duration(),
            }
            .run(cancel_job.clone(), stop_heartbeat.clone()),
        );

        let started = Instant::now();
        let result = self.adapter.run(&request, &cancel_job).await;
        let elapsed = started.elapsed();

        stop_heartbeat.cancel();
        let heartbeat_outcome = match heartbeat.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(job_id = job.id, "Heartbeat task failed: {}", e);
                HeartbeatOutcome::Stopped
            }
        };
        if heartbeat_outcome == HeartbeatOutcome::LeaseLost {
            metrics::record_job_attempt(job.kind, "lease_lost", elapsed);
            return Ok(());
        }

        self.slots.set(slot, SlotState::Reporting, Some(job.id));
        self.report(job, worker_id, result, elapsed)
    }

    fn report(
        &self,
        job: &Job,
        worker_id: &str,
        result: Result<ExecutionResult, ExecutionError>,
        elapsed: Duration,
    ) -> StoreResult<()> {
        let (outcome, reported) = match result {
            Ok(result) => {
                info!(
                    job_id = job.id,
                    kind = %job.kind,
                    revision = result.revision.as_deref().unwrap_or("-"),
                    revision_changed = result.revision_changed,
                    health = ?result.health_signal,
                    "Job succeeded in {:.1}s",
                    elapsed.as_secs_f64()
                );
                ("succeeded", self.store.complete(job.id, worker_id, &result))
            }
            Err(error) => match error.to_failure() {
                None => {
                    info!(job_id = job.id, "Job cancelled");
                    ("cancelled", self.store.acknowledge_cancel(job.id, worker_id))
                }
                Some(failure) if self.retry_policy.should_retry(&error, job) => {
                    let next_eligible_at =
                        self.retry_policy.next_eligible_at(job.attempts, now_millis());
                    info!(
                        job_id = job.id,
                        attempt = job.attempts,
                        max_attempts = job.max_attempts,
                        "Job attempt failed, retrying later: {}",
                        error
                    );
                    (
                        "retried",
                        self.store
                            .retry_later(job.id, worker_id, &failure, next_eligible_at),
                    )
                }
                Some(failure) => {
                    warn!(
                        job_id = job.id,
                        dataset_id = %job.dataset_id,
                        attempt = job.attempts,
                        "Job failed: {}",
                        error
                    );
                    ("failed", self.store.fail(job.id, worker_id, &failure))
                }
            },
        };

        metrics::record_job_attempt(job.kind, outcome, elapsed);
        self.ignore_lease_lost(job, reported)
    }

    /// Losing the lease mid-flight is expected: the monitor owns the job now.
    fn ignore_lease_lost(&self, job: &Job, result: StoreResult<()>) -> StoreResult<()> {
        match result {
            Err(StoreError::LeaseLost(_)) => {
                info!(job_id = job.id, "Lease lost before reporting, dropping result");
                Ok(())
            }
            other => other,
        }
    }
}
