use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli_style;
use cli_style::{format_millis, format_size, get_styles};

use dataset_registry::config::{AppConfig, CliConfig, FileConfig};
use dataset_registry::execution::CliToolAdapter;
use dataset_registry::metrics;
use dataset_registry::monitor::{AlertNotifier, LogAlertNotifier, Monitor, WebhookAlertNotifier};
use dataset_registry::registry_store::{
    DatasetFilter, DatasetOrder, DatasetStatus, JobFilter, JobKind, JobState, RegistryStore,
    SqliteRegistryStore,
};
use dataset_registry::retry_policy::RetryPolicy;
use dataset_registry::scheduler::Scheduler;
use dataset_registry::worker::WorkerPool;
use dataset_registry::DatasetRegistry;

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(styles = get_styles(), version, about = "Dataset registry crawl pipeline")]
struct CliArgs {
    /// Path to a TOML config file. Its values override command line flags.
    #[clap(long, global = true, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding registry.db.
    #[clap(long, global = true, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// The port for the metrics server (Prometheus scraping). 0 disables it.
    #[clap(long, global = true, default_value_t = 9092)]
    pub metrics_port: u16,

    /// Where jobs clone datasets. Defaults to <db-dir>/scratch.
    #[clap(long, global = true, value_parser = parse_path)]
    pub scratch_dir: Option<PathBuf>,

    /// Number of worker slots.
    #[clap(long, global = true)]
    pub pool_size: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the worker pool, the scheduler and the monitor in one process.
    Run,

    /// Runs only the worker pool.
    Worker,

    /// Runs only the scheduler.
    Scheduler,

    /// Runs only the monitor.
    Monitor,

    /// Registers a dataset and enqueues its first collection.
    Register {
        url: String,
        /// Baseline check interval in seconds.
        #[clap(long)]
        interval: Option<u64>,
    },

    /// Announces new content for a registered dataset.
    Announce { url: String },

    /// Shows the status of a dataset.
    Status {
        dataset_id: String,
        #[clap(long)]
        json: bool,
    },

    /// Lists datasets.
    Datasets {
        #[clap(long)]
        status: Option<String>,
        /// Only URLs containing this text.
        #[clap(long)]
        contains: Option<String>,
        /// url, last_checked, last_changed or size.
        #[clap(long, default_value = "url")]
        order: String,
        #[clap(long)]
        desc: bool,
        #[clap(long)]
        include_retired: bool,
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },

    /// Lists jobs, most recent first.
    Jobs {
        #[clap(long)]
        dataset: Option<String>,
        #[clap(long)]
        state: Option<String>,
        #[clap(long)]
        kind: Option<String>,
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },

    /// Shows the lifecycle events of a job.
    Events { job_id: i64 },

    /// Lists emitted alerts.
    Alerts {
        #[clap(long)]
        dataset: Option<String>,
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },

    /// Cancels a job.
    Cancel { job_id: i64 },

    /// Retires a dataset. It is never scheduled again.
    Retire { dataset_id: String },
}

fn shutdown_on_signal() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("Shutdown requested, finishing jobs in hand...");
        token.cancel();
    });
    shutdown
}

struct Services {
    config: AppConfig,
    store: Arc<dyn RegistryStore>,
    retry_policy: RetryPolicy,
}

impl Services {
    fn open(cli_args: &CliArgs) -> Result<Self> {
        let file_config = match &cli_args.config {
            Some(path) => {
                info!("Loading config from {:?}", path);
                Some(FileConfig::load(path)?)
            }
            None => None,
        };
        let cli_config = CliConfig {
            db_dir: cli_args.db_dir.clone(),
            metrics_port: cli_args.metrics_port,
            scratch_dir: cli_args.scratch_dir.clone(),
            pool_size: cli_args.pool_size,
        };
        let config = AppConfig::resolve(&cli_config, file_config)?;

        let db_path = config.registry_db_path();
        info!("Opening SQLite registry database at {:?}...", db_path);
        let store: Arc<dyn RegistryStore> = Arc::new(SqliteRegistryStore::new(&db_path)?);
        let retry_policy = RetryPolicy::new(&config.retry);

        Ok(Self {
            config,
            store,
            retry_policy,
        })
    }

    fn registry(&self) -> DatasetRegistry {
        DatasetRegistry::new(
            self.store.clone(),
            &self.config.scheduler,
            self.retry_policy.clone(),
        )
    }

    fn worker_pool(&self) -> Result<Arc<WorkerPool>> {
        std::fs::create_dir_all(&self.config.tool.scratch_dir).with_context(|| {
            format!(
                "Failed to create scratch directory {:?}",
                self.config.tool.scratch_dir
            )
        })?;
        Ok(Arc::new(WorkerPool::new(
            self.store.clone(),
            Arc::new(CliToolAdapter::new(self.config.tool.clone())),
            self.config.worker.clone(),
            self.retry_policy.clone(),
        )))
    }

    fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.store.clone(),
            self.config.scheduler.clone(),
            self.retry_policy.clone(),
        )
    }

    fn monitor(&self) -> Result<Monitor> {
        let notifier: Arc<dyn AlertNotifier> = match &self.config.alerts.webhook_url {
            Some(url) => {
                info!("Alerts will be posted to {}", url);
                Arc::new(WebhookAlertNotifier::new(
                    url.clone(),
                    self.config.alerts.webhook_timeout_secs,
                )?)
            }
            None => Arc::new(LogAlertNotifier),
        };
        Ok(Monitor::new(
            self.store.clone(),
            notifier,
            self.config.monitor.clone(),
            self.retry_policy.clone(),
        ))
    }

    fn spawn_metrics_server(&self, shutdown: &CancellationToken) {
        metrics::init_metrics();
        let port = self.config.metrics_port;
        if port == 0 {
            info!("Metrics server disabled");
            return;
        }
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::run_metrics_server(port, shutdown).await {
                error!("Metrics server failed: {:#}", e);
            }
        });
    }
}

async fn run_roles(services: &Services, worker: bool, scheduler: bool, monitor: bool) -> Result<()> {
    let shutdown = shutdown_on_signal();
    services.spawn_metrics_server(&shutdown);

    let mut handles = Vec::new();
    if worker {
        let pool = services.worker_pool()?;
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move { pool.run(shutdown).await }));
    }
    if scheduler {
        let scheduler = services.scheduler();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move { scheduler.run(shutdown).await }));
    }
    if monitor {
        let monitor = services.monitor()?;
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move { monitor.run(shutdown).await }));
    }

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!("Task failed: {}", e);
        }
    }
    info!("Stopped");
    Ok(())
}

fn parse_enum<T>(value: Option<&str>, parse: fn(&str) -> Option<T>, what: &str) -> Result<Option<T>> {
    match value {
        None => Ok(None),
        Some(s) => match parse(s) {
            Some(v) => Ok(Some(v)),
            None => bail!("Unknown {}: {}", what, s),
        },
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let services = Services::open(&cli_args)?;
    let registry = services.registry();

    match cli_args.command {
        Command::Run => run_roles(&services, true, true, true).await?,
        Command::Worker => run_roles(&services, true, false, false).await?,
        Command::Scheduler => run_roles(&services, false, true, false).await?,
        Command::Monitor => run_roles(&services, false, false, true).await?,

        Command::Register { url, interval } => {
            let dataset = registry.register_dataset(&url, interval)?;
            println!("{}", dataset.id);
        }
        Command::Announce { url } => {
            let dataset = registry.announce_update(&url)?;
            println!("Update announced for {} ({})", dataset.url, dataset.id);
        }
        Command::Status { dataset_id, json } => {
            let report = registry.get_dataset_status(&dataset_id)?;
            if json {
                print_json(&report)?;
            } else {
                let dataset = registry.get_dataset(&dataset_id)?;
                println!("Dataset:       {}", report.dataset_id);
                println!("URL:           {}", report.url);
                println!("Status:        {}", report.status);
                println!(
                    "Revision:      {}",
                    report.last_revision.as_deref().unwrap_or("-")
                );
                println!(
                    "Size:          {}",
                    dataset.size_bytes.map(format_size).unwrap_or_else(|| "-".to_string())
                );
                println!("Last checked:  {}", format_millis(report.last_checked_at));
                println!("Last changed:  {}", format_millis(report.last_changed_at));
                if let Some(error) = &report.last_error {
                    println!("Last error:    {}", error);
                }
                if let Some(job) = &report.active_job {
                    println!("Active job:    #{} {} ({})", job.id, job.kind, job.state);
                }
                if report.retired {
                    println!("Retired");
                }
            }
        }
        Command::Datasets {
            status,
            contains,
            order,
            desc,
            include_retired,
            limit,
        } => {
            let filter = DatasetFilter {
                url_contains: contains,
                status: parse_enum(status.as_deref(), DatasetStatus::from_str, "status")?,
                include_retired,
                order_by: parse_enum(Some(order.as_str()), DatasetOrder::from_str, "order")?
                    .unwrap_or(DatasetOrder::Url),
                descending: desc,
                limit,
                offset: 0,
            };
            for dataset in registry.list_datasets(&filter)? {
                println!(
                    "{}  {:<11}  {:>12}  {}  {}",
                    dataset.id,
                    dataset.status,
                    dataset.size_bytes.map(format_size).unwrap_or_else(|| "-".to_string()),
                    format_millis(dataset.last_checked_at),
                    dataset.url
                );
            }
        }
        Command::Jobs {
            dataset,
            state,
            kind,
            limit,
        } => {
            let filter = JobFilter {
                dataset_id: dataset,
                state: parse_enum(state.as_deref(), JobState::from_str, "job state")?,
                kind: parse_enum(kind.as_deref(), JobKind::from_str, "job kind")?,
                limit,
                offset: 0,
            };
            for job in registry.list_jobs(&filter)? {
                println!(
                    "#{:<6} {:<8} {:<9} {}/{}  {}  {}{}",
                    job.id,
                    job.kind,
                    job.state,
                    job.attempts,
                    job.max_attempts,
                    format_millis(Some(job.created_at)),
                    job.dataset_id,
                    job.error_detail
                        .as_deref()
                        .map(|e| format!("  ({})", e))
                        .unwrap_or_default()
                );
            }
        }
        Command::Events { job_id } => {
            for event in registry.job_events(job_id)? {
                println!(
                    "{}  {:<16} {}",
                    format_millis(Some(event.timestamp)),
                    event.event_type.as_str(),
                    event.worker_id.as_deref().unwrap_or("")
                );
            }
        }
        Command::Alerts { dataset, limit } => {
            for alert in registry.list_alerts(dataset.as_deref(), limit)? {
                println!(
                    "{}  {:<11} {}  {}",
                    format_millis(Some(alert.created_at)),
                    alert.kind.as_str(),
                    alert.url,
                    alert.last_error.as_deref().unwrap_or("")
                );
            }
        }
        Command::Cancel { job_id } => {
            let outcome = registry.cancel_job(job_id)?;
            println!("{:?}", outcome);
        }
        Command::Retire { dataset_id } => {
            registry.retire_dataset(&dataset_id)?;
            println!("Retired {}", dataset_id);
        }
    }

    Ok(())
}
