//! End-to-end tests for claim races, lease expiry and reclaim.

mod common;

use common::{monitor_settings, RecordingNotifier, TestEnv};
use dataset_registry::registry_store::{
    now_millis, Dataset, FailureKind, JobKind, JobState, RegistryStore, StoreError,
};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_concurrent_claims_yield_exactly_one_winner() {
    let env = TestEnv::new();
    let dataset = Dataset::new("https://example.org/ds.git", 3600, now_millis());
    env.store.insert_dataset(&dataset).unwrap();
    let job_id = env
        .store
        .create_job(&dataset.id, JobKind::Verify, now_millis(), 3)
        .unwrap();

    // Each worker gets its own connection to the shared database file.
    let claims: Vec<Option<i64>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = env.open_store();
                scope.spawn(move || {
                    store
                        .claim_next(&format!("worker-{}", i), Duration::from_secs(30))
                        .unwrap()
                        .map(|job| job.id)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<i64> = claims.into_iter().flatten().collect();
    assert_eq!(winners, vec![job_id]);

    let job = env.store.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Claimed);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed_exactly_once() {
    let env = TestEnv::new();
    let dataset = Dataset::new("https://example.org/ds.git", 3600, now_millis());
    env.store.insert_dataset(&dataset).unwrap();
    let job_id = env
        .store
        .create_job(&dataset.id, JobKind::Verify, now_millis(), 3)
        .unwrap();
    env.store.claim_next("stuck-worker", Duration::ZERO).unwrap().unwrap();
    env.store.mark_running(job_id, "stuck-worker").unwrap();

    // Two monitors racing over the same expiry.
    let notifier = Arc::new(RecordingNotifier::default());
    let first = env.monitor(notifier.clone(), monitor_settings(3, 6));
    let other_store = env.open_store();
    let second = dataset_registry::monitor::Monitor::new(
        other_store,
        notifier,
        monitor_settings(3, 6),
        env.retry_policy.clone(),
    );

    let now = now_millis() + 1;
    let (a, b) = tokio::join!(first.tick(now), second.tick(now));
    assert_eq!(a.unwrap().reclaimed + b.unwrap().reclaimed, 1);

    let job = env.store.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.error_kind, Some(FailureKind::LeaseExpired));
    assert!(job.claimed_by.is_none());

    // The reclaimed attempt still counts; the next claim is attempt two.
    let reclaimed = env
        .store
        .claim_next("fresh-worker", Duration::from_secs(30))
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.id, job_id);
    assert_eq!(reclaimed.attempts, 2);
}

#[tokio::test]
async fn test_heartbeat_after_reclaim_reports_lease_lost() {
    let env = TestEnv::new();
    let dataset = Dataset::new("https://example.org/ds.git", 3600, now_millis());
    env.store.insert_dataset(&dataset).unwrap();
    let job_id = env
        .store
        .create_job(&dataset.id, JobKind::Verify, now_millis(), 3)
        .unwrap();
    env.store.claim_next("slow-worker", Duration::ZERO).unwrap().unwrap();

    let monitor = env.monitor(Arc::new(RecordingNotifier::default()), monitor_settings(3, 6));
    assert_eq!(monitor.tick(now_millis() + 1).await.unwrap().reclaimed, 1);

    assert!(matches!(
        env.store
            .heartbeat(job_id, "slow-worker", Duration::from_secs(30)),
        Err(StoreError::LeaseLost(id)) if id == job_id
    ));
    assert!(matches!(
        env.store
            .complete(job_id, "slow-worker", &common::healthy_result("late")),
        Err(StoreError::LeaseLost(_))
    ));

    // The late result never reached the dataset.
    let stored = env.store.get_dataset(&dataset.id).unwrap().unwrap();
    assert_eq!(stored.last_revision, None);
}

#[tokio::test]
async fn test_live_heartbeat_prevents_reclaim() {
    let env = TestEnv::new();
    let dataset = Dataset::new("https://example.org/ds.git", 3600, now_millis());
    env.store.insert_dataset(&dataset).unwrap();
    let job_id = env
        .store
        .create_job(&dataset.id, JobKind::Verify, now_millis(), 3)
        .unwrap();
    env.store.claim_next("w1", Duration::from_secs(30)).unwrap().unwrap();
    env.store.mark_running(job_id, "w1").unwrap();
    env.store
        .heartbeat(job_id, "w1", Duration::from_secs(30))
        .unwrap();

    let monitor = env.monitor(Arc::new(RecordingNotifier::default()), monitor_settings(3, 6));
    assert_eq!(monitor.tick(now_millis()).await.unwrap().reclaimed, 0);
    assert_eq!(
        env.store.get_job(job_id).unwrap().unwrap().state,
        JobState::Running
    );
}
