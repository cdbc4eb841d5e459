//! Metrics collection for the occupancy service
//!
//! This module defines and manages Prometheus metrics for HTTP traffic, occupancy operations,
//! lock contention and stock adjustments.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};

use crate::Result;

lazy_static! {
    // HTTP Request Metrics

    /// Total HTTP requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "wardline_http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .expect("Failed to register HTTP_REQUESTS_TOTAL");

    /// HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "wardline_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register HTTP_REQUEST_DURATION_SECONDS");

    /// In-flight HTTP requests
    pub static ref HTTP_REQUESTS_IN_FLIGHT: IntGaugeVec = register_int_gauge_vec!(
        "wardline_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
        &["method", "path"]
    )
    .expect("Failed to register HTTP_REQUESTS_IN_FLIGHT");

    // Occupancy Metrics

    /// Occupancy operations by operation and outcome code
    pub static ref OCCUPANCY_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "wardline_occupancy_operations_total",
        "Total number of occupancy operations",
        &["operation", "outcome"]
    )
    .expect("Failed to register OCCUPANCY_OPERATIONS_TOTAL");

    /// Available beds per ward, updated after every committed change
    pub static ref WARD_AVAILABLE_BEDS: IntGaugeVec = register_int_gauge_vec!(
        "wardline_ward_available_beds",
        "Number of available beds per ward",
        &["ward"]
    )
    .expect("Failed to register WARD_AVAILABLE_BEDS");

    // Lock Metrics

    /// Time spent acquiring a lock scope
    pub static ref LOCK_WAIT_SECONDS: HistogramVec = register_histogram_vec!(
        "wardline_lock_wait_seconds",
        "Time spent acquiring the locks of a unit of work",
        &["backend"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register LOCK_WAIT_SECONDS");

    /// Lock acquisitions that hit the timeout
    pub static ref LOCK_TIMEOUTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "wardline_lock_timeouts_total",
        "Total number of lock acquisitions that timed out",
        &["backend"]
    )
    .expect("Failed to register LOCK_TIMEOUTS_TOTAL");

    // Stock Metrics

    /// Stock adjustments by direction and flag
    pub static ref STOCK_ADJUSTMENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "wardline_stock_adjustments_total",
        "Total number of committed stock adjustments",
        &["direction", "flag"]
    )
    .expect("Failed to register STOCK_ADJUSTMENTS_TOTAL");
}

/// Count an operation under its outcome: `ok` or the error code.
pub fn record_operation<T>(operation: &str, result: &Result<T>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    };
    OCCUPANCY_OPERATIONS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
}

/// Helper to sanitize path for metrics labels (remove IDs, limit cardinality)
pub fn sanitize_path(path: &str) -> String {
    if path.is_empty() || path == "/" {
        return "/".to_string();
    }

    let mut previous = "";
    let segments: Vec<String> = path
        .split('/')
        .map(|segment| {
            // Patient ids are opaque strings, everything else is a UUID
            let is_id = previous == "patients" || uuid::Uuid::parse_str(segment).is_ok();
            previous = segment;
            if is_id {
                "{id}".to_string()
            } else {
                segment.to_string()
            }
        })
        .collect();

    segments.join("/")
}
