mod file_config;

pub use file_config::{
    AlertsConfig, FileConfig, MonitorConfig, RetryConfig, SchedulerConfig, ToolConfig,
    WorkerConfig,
};

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub metrics_port: u16,
    pub scratch_dir: Option<PathBuf>,
    pub pool_size: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    /// 0 disables the metrics endpoint.
    pub metrics_port: u16,

    pub worker: WorkerSettings,
    pub scheduler: SchedulerSettings,
    pub monitor: MonitorSettings,
    pub retry: RetrySettings,
    pub tool: ToolSettings,
    pub alerts: AlertSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let worker_file = file.worker.unwrap_or_default();
        let worker_defaults = WorkerSettings::default();
        let worker = WorkerSettings {
            pool_size: worker_file
                .pool_size
                .or(cli.pool_size)
                .unwrap_or(worker_defaults.pool_size),
            lease_duration_secs: worker_file
                .lease_duration_secs
                .unwrap_or(worker_defaults.lease_duration_secs),
            heartbeat_interval_secs: worker_file
                .heartbeat_interval_secs
                .unwrap_or(worker_defaults.heartbeat_interval_secs),
            poll_interval_ms: worker_file
                .poll_interval_ms
                .unwrap_or(worker_defaults.poll_interval_ms),
        };

        let scheduler_file = file.scheduler.unwrap_or_default();
        let scheduler_defaults = SchedulerSettings::default();
        let scheduler = SchedulerSettings {
            tick_interval_secs: scheduler_file
                .tick_interval_secs
                .unwrap_or(scheduler_defaults.tick_interval_secs),
            default_check_interval_secs: scheduler_file
                .default_check_interval_secs
                .unwrap_or(scheduler_defaults.default_check_interval_secs),
            backoff_multiplier: scheduler_file
                .backoff_multiplier
                .unwrap_or(scheduler_defaults.backoff_multiplier),
            max_check_interval_secs: scheduler_file
                .max_check_interval_secs
                .unwrap_or(scheduler_defaults.max_check_interval_secs),
            max_jobs_per_tick: scheduler_file.max_jobs_per_tick,
        };

        let monitor_file = file.monitor.unwrap_or_default();
        let monitor_defaults = MonitorSettings::default();
        let monitor = MonitorSettings {
            tick_interval_secs: monitor_file
                .tick_interval_secs
                .unwrap_or(monitor_defaults.tick_interval_secs),
            degraded_threshold: monitor_file
                .degraded_threshold
                .unwrap_or(monitor_defaults.degraded_threshold),
            unreachable_threshold: monitor_file
                .unreachable_threshold
                .unwrap_or(monitor_defaults.unreachable_threshold),
            long_running_threshold_secs: monitor_file
                .long_running_threshold_secs
                .unwrap_or(monitor_defaults.long_running_threshold_secs),
            job_retention_days: monitor_file
                .job_retention_days
                .unwrap_or(monitor_defaults.job_retention_days),
        };

        let retry_file = file.retry.unwrap_or_default();
        let retry_defaults = RetrySettings::default();
        let retry = RetrySettings {
            max_attempts: retry_file
                .max_attempts
                .unwrap_or(retry_defaults.max_attempts),
            initial_backoff_secs: retry_file
                .initial_backoff_secs
                .unwrap_or(retry_defaults.initial_backoff_secs),
            max_backoff_secs: retry_file
                .max_backoff_secs
                .unwrap_or(retry_defaults.max_backoff_secs),
            backoff_multiplier: retry_file
                .backoff_multiplier
                .unwrap_or(retry_defaults.backoff_multiplier),
        };

        let tool_file = file.tool.unwrap_or_default();
        let tool_defaults = ToolSettings::default();
        let tool = ToolSettings {
            clone_command: tool_file
                .clone_command
                .unwrap_or(tool_defaults.clone_command),
            revision_command: tool_file
                .revision_command
                .unwrap_or(tool_defaults.revision_command),
            describe_command: tool_file
                .describe_command
                .unwrap_or(tool_defaults.describe_command),
            annex_uuid_command: tool_file
                .annex_uuid_command
                .unwrap_or(tool_defaults.annex_uuid_command),
            branches_command: tool_file
                .branches_command
                .unwrap_or(tool_defaults.branches_command),
            tags_command: tool_file.tags_command.unwrap_or(tool_defaults.tags_command),
            verify_command: tool_file
                .verify_command
                .unwrap_or(tool_defaults.verify_command),
            timeout_secs: tool_file.timeout_secs.unwrap_or(tool_defaults.timeout_secs),
            scratch_dir: tool_file
                .scratch_dir
                .map(PathBuf::from)
                .or_else(|| cli.scratch_dir.clone())
                .unwrap_or_else(|| db_dir.join("scratch")),
        };

        let alerts_file = file.alerts.unwrap_or_default();
        let alerts = AlertSettings {
            webhook_url: alerts_file.webhook_url,
            webhook_timeout_secs: alerts_file
                .webhook_timeout_secs
                .unwrap_or(AlertSettings::default().webhook_timeout_secs),
        };

        let config = Self {
            db_dir,
            metrics_port,
            worker,
            scheduler,
            monitor,
            retry,
            tool,
            alerts,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.worker.pool_size == 0 {
            bail!("worker.pool_size must be at least 1");
        }
        if self.worker.heartbeat_interval_secs == 0 {
            bail!("worker.heartbeat_interval_secs must be greater than 0");
        }
        // A worker must get at least two heartbeats in per lease.
        if self.worker.heartbeat_interval_secs * 2 >= self.worker.lease_duration_secs {
            bail!(
                "worker.heartbeat_interval_secs ({}) must be less than half of lease_duration_secs ({})",
                self.worker.heartbeat_interval_secs,
                self.worker.lease_duration_secs
            );
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.backoff_multiplier < 1.0 || self.scheduler.backoff_multiplier < 1.0 {
            bail!("backoff multipliers must be at least 1.0");
        }
        if self.monitor.degraded_threshold == 0 {
            bail!("monitor.degraded_threshold must be at least 1");
        }
        if self.monitor.unreachable_threshold < self.monitor.degraded_threshold {
            bail!(
                "monitor.unreachable_threshold ({}) must not be below degraded_threshold ({})",
                self.monitor.unreachable_threshold,
                self.monitor.degraded_threshold
            );
        }
        if self.tool.timeout_secs == 0 {
            bail!("tool.timeout_secs must be greater than 0");
        }
        if self.scheduler.tick_interval_secs == 0 || self.monitor.tick_interval_secs == 0 {
            bail!("tick intervals must be greater than 0");
        }
        Ok(())
    }

    pub fn registry_db_path(&self) -> PathBuf {
        self.db_dir.join("registry.db")
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub pool_size: usize,
    pub lease_duration_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// How long an idle slot waits before trying to claim again.
    pub poll_interval_ms: u64,
}

impl WorkerSettings {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            pool_size: 4,
            lease_duration_secs: 300,
            heartbeat_interval_secs: 60,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval_secs: u64,
    /// Check interval given to datasets registered without one.
    pub default_check_interval_secs: u64,
    pub backoff_multiplier: f64,
    pub max_check_interval_secs: u64,
    pub max_jobs_per_tick: Option<usize>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            default_check_interval_secs: 86400,
            backoff_multiplier: 2.0,
            max_check_interval_secs: 7 * 86400,
            max_jobs_per_tick: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub tick_interval_secs: u64,
    pub degraded_threshold: u32,
    pub unreachable_threshold: u32,
    pub long_running_threshold_secs: u64,
    pub job_retention_days: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            degraded_threshold: 3,
            unreachable_threshold: 6,
            long_running_threshold_secs: 3600,
            job_retention_days: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_secs: 30,
            max_backoff_secs: 3600,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub clone_command: String,
    pub revision_command: String,
    pub describe_command: String,
    pub annex_uuid_command: String,
    pub branches_command: String,
    pub tags_command: String,
    pub verify_command: String,
    /// Hard limit for one job attempt, all steps included.
    pub timeout_secs: u64,
    pub scratch_dir: PathBuf,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            clone_command: "datalad clone {url} {workdir}".to_string(),
            revision_command: "git -C {workdir} rev-parse HEAD".to_string(),
            describe_command: "git -C {workdir} describe --tags --always".to_string(),
            annex_uuid_command: "git -C {workdir} config --get annex.uuid".to_string(),
            branches_command: "git -C {workdir} branch -r --format=%(refname:short)"
                .to_string(),
            tags_command: "git -C {workdir} tag --list".to_string(),
            verify_command: "git -C {workdir} fsck --connectivity-only".to_string(),
            timeout_secs: 1800,
            scratch_dir: std::env::temp_dir().join("dataset-registry"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub webhook_url: Option<String>,
    pub webhook_timeout_secs: u64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_timeout_secs: 10,
        }
    }
}
