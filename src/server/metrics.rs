use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all StarSync metrics
const PREFIX: &str = "starsync";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Request Metrics
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["method", "path"]
    ).expect("Failed to create http_request_duration_seconds metric");

    // Authentication Metrics
    pub static ref AUTH_LOGIN_ATTEMPTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_auth_login_attempts_total"), "Total login attempts"),
        &["status"]
    ).expect("Failed to create auth_login_attempts_total metric");

    pub static ref AUTH_ACTIVE_SESSIONS: Gauge = Gauge::new(
        format!("{PREFIX}_auth_active_sessions"),
        "Number of active authentication sessions"
    ).expect("Failed to create auth_active_sessions metric");

    // Rating Run Metrics
    pub static ref RUNS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_runs_total"), "Finished rating runs"),
        &["kind", "trigger", "outcome"]
    ).expect("Failed to create runs_total metric");

    pub static ref RUN_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_run_duration_seconds"),
            "Rating run duration in seconds"
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0]),
        &["kind"]
    ).expect("Failed to create run_duration_seconds metric");

    pub static ref RUN_ACTIVE: Gauge = Gauge::new(
        format!("{PREFIX}_run_active"),
        "Whether a rating run is in progress (0 or 1)"
    ).expect("Failed to create run_active metric");

    pub static ref RUNS_REJECTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_runs_rejected_total"), "Triggers rejected because a run was active"),
        &["trigger"]
    ).expect("Failed to create runs_rejected_total metric");

    pub static ref TRACKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_tracks_total"), "Tracks processed by result"),
        &["result"]
    ).expect("Failed to create tracks_total metric");

    // Plex Metrics
    pub static ref PLEX_ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_plex_errors_total"), "Failed Plex calls by operation and kind"),
        &["operation", "kind"]
    ).expect("Failed to create plex_errors_total metric");

    // Webhook Metrics
    pub static ref WEBHOOK_EVENTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_webhook_events_total"), "Plex webhook deliveries by result"),
        &["result"]
    ).expect("Failed to create webhook_events_total metric");

    pub static ref PROCESS_MEMORY_BYTES: Gauge = Gauge::new(
        format!("{PREFIX}_process_memory_bytes"),
        "Process memory usage in bytes"
    ).expect("Failed to create process_memory_bytes metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(AUTH_LOGIN_ATTEMPTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(AUTH_ACTIVE_SESSIONS.clone()));
    let _ = REGISTRY.register(Box::new(RUNS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(RUN_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(RUN_ACTIVE.clone()));
    let _ = REGISTRY.register(Box::new(RUNS_REJECTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TRACKS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PLEX_ERRORS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(WEBHOOK_EVENTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PROCESS_MEMORY_BYTES.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

pub fn record_login_attempt(status: &str) {
    AUTH_LOGIN_ATTEMPTS_TOTAL.with_label_values(&[status]).inc();
}

pub fn set_active_sessions(count: usize) {
    AUTH_ACTIVE_SESSIONS.set(count as f64);
}

/// Record a finished run
pub fn record_run(kind: &str, trigger: &str, outcome: &str, duration: Duration) {
    RUNS_TOTAL
        .with_label_values(&[kind, trigger, outcome])
        .inc();
    RUN_DURATION_SECONDS
        .with_label_values(&[kind])
        .observe(duration.as_secs_f64());
}

pub fn set_run_active(active: bool) {
    RUN_ACTIVE.set(if active { 1.0 } else { 0.0 });
}

pub fn record_run_rejected(trigger: &str) {
    RUNS_REJECTED_TOTAL.with_label_values(&[trigger]).inc();
}

/// Add `count` tracks to the counter for `result` (rated, overwritten, skipped, failed, reset)
pub fn record_tracks(result: &str, count: usize) {
    if count > 0 {
        TRACKS_TOTAL
            .with_label_values(&[result])
            .inc_by(count as u64);
    }
}

pub fn record_plex_error(operation: &str, kind: &str) {
    PLEX_ERRORS_TOTAL
        .with_label_values(&[operation, kind])
        .inc();
}

pub fn record_webhook_event(result: &str) {
    WEBHOOK_EVENTS_TOTAL.with_label_values(&[result]).inc();
}

/// Update process memory usage
pub fn update_memory_usage() {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    // RSS is reported in kB
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        if let Ok(kb) = kb_str.parse::<f64>() {
                            PROCESS_MEMORY_BYTES.set(kb * 1024.0);
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    update_memory_usage();

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
