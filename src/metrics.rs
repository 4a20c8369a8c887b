use anyhow::Result;
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::registry_store::{JobKind, JobState};

/// Metric name prefix for all registry metrics
const PREFIX: &str = "dataset_registry";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Job lifecycle
    pub static ref JOBS_CREATED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_created_total"), "Jobs created by the scheduler or on request"),
        &["kind"]
    ).expect("Failed to create jobs_created_total metric");

    pub static ref JOBS_FINISHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_attempts_total"), "Finished job attempts by outcome"),
        &["kind", "outcome"]
    ).expect("Failed to create job_attempts_total metric");

    pub static ref JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_duration_seconds"),
            "Time spent executing one job attempt"
        )
        .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]),
        &["kind"]
    ).expect("Failed to create job_duration_seconds metric");

    pub static ref JOBS_BY_STATE: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_jobs"), "Jobs currently stored, by state"),
        &["state"]
    ).expect("Failed to create jobs metric");

    // Workers
    pub static ref WORKER_SLOTS: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_worker_slots"), "Worker slots by state"),
        &["state"]
    ).expect("Failed to create worker_slots metric");

    // Monitor
    pub static ref LEASES_RECLAIMED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_leases_reclaimed_total"), "Expired leases reclaimed by the monitor"),
        &["disposition"]
    ).expect("Failed to create leases_reclaimed_total metric");

    pub static ref ALERTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_alerts_total"), "Dataset alerts emitted"),
        &["kind"]
    ).expect("Failed to create alerts_total metric");

    // Periodic loops
    pub static ref TICKS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_ticks_total"), "Scheduler and monitor ticks"),
        &["component", "result"]
    ).expect("Failed to create ticks_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(JOBS_CREATED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_FINISHED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_BY_STATE.clone()));
    let _ = REGISTRY.register(Box::new(WORKER_SLOTS.clone()));
    let _ = REGISTRY.register(Box::new(LEASES_RECLAIMED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(ALERTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TICKS_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_job_created(kind: JobKind) {
    JOBS_CREATED_TOTAL
        .with_label_values(&[kind.as_str()])
        .inc();
}

/// Record the end of one attempt. `outcome` is one of succeeded, failed,
/// retried, cancelled or lease_lost.
pub fn record_job_attempt(kind: JobKind, outcome: &str, duration: Duration) {
    JOBS_FINISHED_TOTAL
        .with_label_values(&[kind.as_str(), outcome])
        .inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[kind.as_str()])
        .observe(duration.as_secs_f64());
}

pub fn set_jobs_by_state(counts: &[(JobState, usize)]) {
    JOBS_BY_STATE.reset();
    for (state, count) in counts {
        JOBS_BY_STATE
            .with_label_values(&[state.as_str()])
            .set(*count as f64);
    }
}

pub fn set_worker_slots(counts: &[(&str, usize)]) {
    for (state, count) in counts {
        WORKER_SLOTS.with_label_values(&[state]).set(*count as f64);
    }
}

pub fn record_lease_reclaimed(disposition: &str) {
    LEASES_RECLAIMED_TOTAL
        .with_label_values(&[disposition])
        .inc();
}

pub fn record_alert(kind: &str) {
    ALERTS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_tick(component: &str, result: &str) {
    TICKS_TOTAL.with_label_values(&[component, result]).inc();
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_else(|_| String::from(""));
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

/// Serve `/metrics` until `shutdown` is cancelled.
pub async fn run_metrics_server(port: u16, shutdown: CancellationToken) -> Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!("Metrics available at port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
