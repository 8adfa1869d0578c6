use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Metric name prefix for all task host metrics
const PREFIX: &str = "taskhost";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref TASK_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_task_executions_total"), "Total task executions by outcome"),
        &["task", "status"]
    ).expect("Failed to create task_executions_total metric");

    pub static ref TASK_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_task_duration_seconds"),
            "Task execution duration in seconds"
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0]),
        &["task"]
    ).expect("Failed to create task_duration_seconds metric");

    pub static ref TASKS_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_tasks_running"), "Whether a task is currently executing"),
        &["task"]
    ).expect("Failed to create tasks_running metric");

    pub static ref TASK_PASS_ERRORS_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_task_pass_errors_total"),
        "Scheduler passes that failed before evaluating tasks"
    ).expect("Failed to create task_pass_errors_total metric");
}

/// Register all metrics with the Prometheus registry
pub fn init_metrics() {
    // Ignore errors if already registered (tests call this repeatedly)
    let _ = REGISTRY.register(Box::new(TASK_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TASK_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(TASKS_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(TASK_PASS_ERRORS_TOTAL.clone()));

    tracing::debug!("Task metrics registered");
}

pub fn record_task_execution(task: &str, status: &str, duration: Duration) {
    TASK_EXECUTIONS_TOTAL
        .with_label_values(&[task, status])
        .inc();
    TASK_DURATION_SECONDS
        .with_label_values(&[task])
        .observe(duration.as_secs_f64());
}

pub fn set_task_running(task: &str, running: bool) {
    TASKS_RUNNING
        .with_label_values(&[task])
        .set(if running { 1.0 } else { 0.0 });
}

pub fn record_pass_error() {
    TASK_PASS_ERRORS_TOTAL.inc();
}

/// Render all registered metrics in the Prometheus text format.
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    match gather_metrics() {
        Ok(response) => (StatusCode::OK, response),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

pub fn make_metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serve `/metrics` on localhost until `shutdown_token` is cancelled.
pub async fn run_metrics_server(port: u16, shutdown_token: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    axum::serve(listener, make_metrics_router())
        .with_graceful_shutdown(shutdown_token.cancelled_owned())
        .await?;
    Ok(())
}
