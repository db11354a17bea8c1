use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all scheduler metrics
const PREFIX: &str = "dbp";

const MODES: [&str; 2] = ["immediate", "scheduled"];

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Job Error Metrics
    pub static ref JOB_ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_errors_total"), "Job errors by kind and data broker"),
        &["kind", "data_broker"]
    ).expect("Failed to create job_errors_total metric");

    // Batch Metrics
    pub static ref BATCHES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_batches_total"), "Finished batches by mode and outcome"),
        &["mode", "outcome"]
    ).expect("Failed to create batches_total metric");

    pub static ref BATCH_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_batch_duration_seconds"),
            "Batch duration in seconds"
        )
        .buckets(vec![1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]),
        &["mode"]
    ).expect("Failed to create batch_duration_seconds metric");

    pub static ref ACTIVE_MODE: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_active_mode"), "1 while a batch of the given mode is running"),
        &["mode"]
    ).expect("Failed to create active_mode metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(JOB_ERRORS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BATCHES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BATCH_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(ACTIVE_MODE.clone()));

    for mode in MODES {
        ACTIVE_MODE.with_label_values(&[mode]).set(0.0);
    }

    tracing::info!("Metrics system initialized successfully");
}

/// Record a job error forwarded to telemetry
pub fn record_job_error(kind: &str, data_broker: &str) {
    JOB_ERRORS_TOTAL
        .with_label_values(&[kind, data_broker])
        .inc();
}

/// Record a finished batch
pub fn record_batch_finished(mode: &str, outcome: &str, duration: Duration) {
    BATCHES_TOTAL.with_label_values(&[mode, outcome]).inc();
    BATCH_DURATION_SECONDS
        .with_label_values(&[mode])
        .observe(duration.as_secs_f64());
}

/// Mark which mode is currently running; `None` means idle.
pub fn set_active_mode(active: Option<&str>) {
    for mode in MODES {
        let value = if Some(mode) == active { 1.0 } else { 0.0 };
        ACTIVE_MODE.with_label_values(&[mode]).set(value);
    }
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
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

/// Serve `/metrics` on localhost until the task is dropped.
pub async fn run_metrics_server(port: u16) -> Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;

    Ok(axum::serve(listener, app).await?)
}
