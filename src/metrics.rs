//! Prometheus metrics for uploads and admission control.
//!
//! Metrics are exposed on a dedicated listener (default: `0.0.0.0:9090`).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `tempdrop_uploads_total` - Upload attempts (label: status)
//! - `tempdrop_upload_bytes_total` - Bytes stored by successful uploads
//! - `tempdrop_rate_limit_rejections_total` - Admission rejections (label: limit_type)
//! - `tempdrop_rate_limit_store_errors_total` - Counting store failures (label: operation)
//! - `tempdrop_files_purged_total` - Expired files removed by the purge task
//!
//! ## Histograms
//! - `tempdrop_rate_limit_check_duration_seconds` - Admission check latency
//!
//! # Usage
//!
//! ```rust,ignore
//! use tempdrop::metrics::{init_metrics, record_upload};
//!
//! init_metrics("0.0.0.0:9090".parse()?)?;
//! record_upload("success", 1024);
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const UPLOADS_TOTAL: &str = "tempdrop_uploads_total";
    pub const UPLOAD_BYTES_TOTAL: &str = "tempdrop_upload_bytes_total";
    pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "tempdrop_rate_limit_rejections_total";
    pub const RATE_LIMIT_STORE_ERRORS_TOTAL: &str = "tempdrop_rate_limit_store_errors_total";
    pub const FILES_PURGED_TOTAL: &str = "tempdrop_files_purged_total";
    pub const RATE_LIMIT_CHECK_DURATION_SECONDS: &str =
        "tempdrop_rate_limit_check_duration_seconds";
}

/// Initialize the Prometheus metrics exporter.
///
/// Installs the global recorder, starts the HTTP listener on `metrics_addr`
/// and describes every metric.
///
/// # Errors
///
/// Returns a message if the exporter cannot be installed (for example the
/// port is taken or a recorder is already set).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(names::UPLOADS_TOTAL, "Total number of upload attempts");
    describe_counter!(
        names::UPLOAD_BYTES_TOTAL,
        "Total bytes stored by successful uploads"
    );
    describe_counter!(
        names::RATE_LIMIT_REJECTIONS_TOTAL,
        "Uploads rejected by the admission check"
    );
    describe_counter!(
        names::RATE_LIMIT_STORE_ERRORS_TOTAL,
        "Failures talking to the rate limit counting store"
    );
    describe_counter!(
        names::FILES_PURGED_TOTAL,
        "Expired files removed by the purge task"
    );

    describe_histogram!(
        names::RATE_LIMIT_CHECK_DURATION_SECONDS,
        "Admission check duration in seconds"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

/// Record an upload attempt; `bytes` is added to the byte total on success.
pub fn record_upload(status: &'static str, bytes: u64) {
    counter!(names::UPLOADS_TOTAL, "status" => status).increment(1);
    if status == "success" {
        counter!(names::UPLOAD_BYTES_TOTAL).increment(bytes);
    }
}

pub fn record_rate_limit_rejection(limit_type: &'static str) {
    counter!(names::RATE_LIMIT_REJECTIONS_TOTAL, "limit_type" => limit_type).increment(1);
}

/// Record a counting store failure during `operation` (`check` or `commit`).
pub fn record_store_error(operation: &'static str) {
    counter!(names::RATE_LIMIT_STORE_ERRORS_TOTAL, "operation" => operation).increment(1);
}

pub fn record_files_purged(count: u64) {
    counter!(names::FILES_PURGED_TOTAL).increment(count);
}

// =============================================================================
// Histogram Recording Functions
// =============================================================================

pub fn record_check_duration(duration_secs: f64) {
    histogram!(names::RATE_LIMIT_CHECK_DURATION_SECONDS).record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These only verify the recorders don't panic without an installed exporter.

    #[test]
    fn test_record_upload() {
        record_upload("success", 1024);
        record_upload("too_large", 0);
    }

    #[test]
    fn test_record_admission_metrics() {
        record_rate_limit_rejection("upload_count");
        record_store_error("commit");
        record_check_duration(0.002);
    }

    #[test]
    fn test_record_files_purged() {
        record_files_purged(3);
    }
}
