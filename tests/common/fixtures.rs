use dataset_registry::config::{MonitorSettings, SchedulerSettings, WorkerSettings};
use dataset_registry::execution::ExecutionAdapter;
use dataset_registry::monitor::{AlertNotifier, Monitor};
use dataset_registry::registry_store::SqliteRegistryStore;
use dataset_registry::retry_policy::RetryPolicy;
use dataset_registry::scheduler::Scheduler;
use dataset_registry::worker::WorkerPool;
use dataset_registry::DatasetRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub const HOUR_MS: i64 = 3_600_000;

pub fn worker_settings() -> WorkerSettings {
    WorkerSettings {
        pool_size: 2,
        lease_duration_secs: 30,
        heartbeat_interval_secs: 5,
        poll_interval_ms: 10,
    }
}

pub fn monitor_settings(degraded_threshold: u32, unreachable_threshold: u32) -> MonitorSettings {
    MonitorSettings {
        degraded_threshold,
        unreachable_threshold,
        ..MonitorSettings::default()
    }
}

/// Three attempts, retries eligible immediately.
pub fn fast_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff_secs: 0,
        max_backoff_secs: 0,
        backoff_multiplier: 1.0,
    }
}

/// A registry database in its own temporary directory.
pub struct TestEnv {
    pub dir: TempDir,
    pub store: Arc<SqliteRegistryStore>,
    pub retry_policy: RetryPolicy,
}

#[allow(dead_code)]
impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteRegistryStore::new(dir.path().join("registry.db")).unwrap());
        Self {
            dir,
            store,
            retry_policy: fast_retry_policy(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("registry.db")
    }

    /// A second, independent connection to the same database file.
    pub fn open_store(&self) -> Arc<SqliteRegistryStore> {
        Arc::new(SqliteRegistryStore::new(self.db_path()).unwrap())
    }

    pub fn registry(&self) -> DatasetRegistry {
        DatasetRegistry::new(
            self.store.clone(),
            &SchedulerSettings::default(),
            self.retry_policy.clone(),
        )
    }

    pub fn worker_pool<A: ExecutionAdapter + 'static>(&self, adapter: A) -> WorkerPool {
        self.worker_pool_shared(Arc::new(adapter))
    }

    pub fn worker_pool_shared(&self, adapter: Arc<dyn ExecutionAdapter>) -> WorkerPool {
        WorkerPool::new(
            self.store.clone(),
            adapter,
            worker_settings(),
            self.retry_policy.clone(),
        )
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.store.clone(),
            SchedulerSettings::default(),
            self.retry_policy.clone(),
        )
    }

    pub fn monitor(&self, notifier: Arc<dyn AlertNotifier>, settings: MonitorSettings) -> Monitor {
        Monitor::new(
            self.store.clone(),
            notifier,
            settings,
            self.retry_policy.clone(),
        )
    }
}
