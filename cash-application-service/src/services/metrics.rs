//! Prometheus metrics for cash-application-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Counter for HTTP requests by route and status.
pub static HTTP_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "cash_application_http_requests_total",
        "Total number of HTTP requests",
        &["route", "status"]
    )
    .expect("Failed to register HTTP_REQUESTS")
});

/// Histogram for database query duration by operation.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "cash_application_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for workflow outcomes.
pub static WORKFLOW_OUTCOMES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "cash_application_workflow_outcomes_total",
        "Total number of workflows by terminal status",
        &["status"]
    )
    .expect("Failed to register WORKFLOW_OUTCOMES")
});

/// Histogram for end-to-end workflow duration.
pub static WORKFLOW_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "cash_application_workflow_duration_seconds",
        "Workflow duration in seconds",
        &["status"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]
    )
    .expect("Failed to register WORKFLOW_DURATION")
});

/// Counter for match outcomes by status and discrepancy.
pub static MATCH_OUTCOMES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "cash_application_match_outcomes_total",
        "Total number of match results",
        &["status", "discrepancy"]
    )
    .expect("Failed to register MATCH_OUTCOMES")
});

/// Counter for extractor runs by tier.
pub static EXTRACTIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "cash_application_extractions_total",
        "Total number of extraction runs",
        &["tier", "outcome"]
    )
    .expect("Failed to register EXTRACTIONS")
});

/// Counter for ERP facade calls.
pub static ERP_CALLS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "cash_application_erp_calls_total",
        "Total number of ERP calls",
        &["erp_system", "operation", "status"]
    )
    .expect("Failed to register ERP_CALLS")
});

/// Counter for communication dispatches.
pub static DISPATCHES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "cash_application_dispatches_total",
        "Total number of communication dispatches",
        &["kind", "status"]
    )
    .expect("Failed to register DISPATCHES")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "cash_application_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&HTTP_REQUESTS);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&WORKFLOW_OUTCOMES);
    Lazy::force(&WORKFLOW_DURATION);
    Lazy::force(&MATCH_OUTCOMES);
    Lazy::force(&EXTRACTIONS);
    Lazy::force(&ERP_CALLS);
    Lazy::force(&DISPATCHES);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a workflow terminal outcome with its duration.
pub fn record_workflow_outcome(status: &str, duration_secs: f64) {
    WORKFLOW_OUTCOMES.with_label_values(&[status]).inc();
    WORKFLOW_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// Record a match result.
pub fn record_match_outcome(status: &str, discrepancy: &str) {
    MATCH_OUTCOMES
        .with_label_values(&[status, discrepancy])
        .inc();
}

/// Record an extraction run.
pub fn record_extraction(tier: &str, found: bool) {
    EXTRACTIONS
        .with_label_values(&[tier, if found { "found" } else { "empty" }])
        .inc();
}

/// Record an ERP facade call.
pub fn record_erp_call(erp_system: &str, operation: &str, ok: bool) {
    ERP_CALLS
        .with_label_values(&[erp_system, operation, if ok { "ok" } else { "error" }])
        .inc();
}

/// Record a communication dispatch.
pub fn record_dispatch(kind: &str, status: &str) {
    DISPATCHES.with_label_values(&[kind, status]).inc();
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
