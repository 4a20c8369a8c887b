use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub metrics_port: Option<u16>,

    // Per-role configs
    pub worker: Option<WorkerConfig>,
    pub scheduler: Option<SchedulerConfig>,
    pub monitor: Option<MonitorConfig>,
    pub retry: Option<RetryConfig>,
    pub tool: Option<ToolConfig>,
    pub alerts: Option<AlertsConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    pub pool_size: Option<usize>,
    pub lease_duration_secs: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_secs: Option<u64>,
    pub default_check_interval_secs: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub max_check_interval_secs: Option<u64>,
    pub max_jobs_per_tick: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    pub tick_interval_secs: Option<u64>,
    pub degraded_threshold: Option<u32>,
    pub unreachable_threshold: Option<u32>,
    pub long_running_threshold_secs: Option<u64>,
    pub job_retention_days: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub initial_backoff_secs: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub backoff_multiplier: Option<f64>,
}

/// Command templates accept `{url}`, `{workdir}` and `{revision}`.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ToolConfig {
    pub clone_command: Option<String>,
    pub revision_command: Option<String>,
    pub describe_command: Option<String>,
    pub annex_uuid_command: Option<String>,
    pub branches_command: Option<String>,
    pub tags_command: Option<String>,
    pub verify_command: Option<String>,
    pub timeout_secs: Option<u64>,
    pub scratch_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct AlertsConfig {
    /// When set, alerts are POSTed as JSON to this URL.
    pub webhook_url: Option<String>,
    pub webhook_timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_sections() {
        let config: FileConfig = toml::from_str(
            r#"
            db_dir = "/var/lib/registry"
            metrics_port = 9100

            [worker]
            pool_size = 8
            lease_duration_secs = 120

            [monitor]
            degraded_threshold = 2

            [tool]
            clone_command = "git clone {url} {workdir}"

            [alerts]
            webhook_url = "https://hooks.example.org/registry"
            "#,
        )
        .unwrap();

        assert_eq!(config.db_dir.as_deref(), Some("/var/lib/registry"));
        assert_eq!(config.metrics_port, Some(9100));
        let worker = config.worker.unwrap();
        assert_eq!(worker.pool_size, Some(8));
        assert_eq!(worker.heartbeat_interval_secs, None);
        assert_eq!(config.monitor.unwrap().degraded_threshold, Some(2));
        assert_eq!(
            config.tool.unwrap().clone_command.as_deref(),
            Some("git clone {url} {workdir}")
        );
        assert!(config.scheduler.is_none());
        assert!(config.alerts.unwrap().webhook_url.is_some());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[retry]\nmax_attempts = 5").unwrap();

        let config = FileConfig::load(file.path()).unwrap();
        assert_eq!(config.retry.unwrap().max_attempts, Some(5));
    }

    #[test]
    fn test_load_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[worker\npool_size = ").unwrap();

        let err = FileConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
