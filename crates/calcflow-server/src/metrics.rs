//! Prometheus metrics for the compute pipeline.
//!
//! Recording is always safe: without an installed recorder the `metrics`
//! macros are no-ops.

use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Metric names as constants for consistency.
pub mod names {
    // Cache metrics
    pub const CACHE_HITS_TOTAL: &str = "calcflow_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "calcflow_cache_misses_total";
    pub const CACHE_ERRORS_TOTAL: &str = "calcflow_cache_errors_total";

    // Pipeline metrics
    pub const COMPUTATIONS_TOTAL: &str = "calcflow_computations_total";
    pub const AUDIT_RECORDS_TOTAL: &str = "calcflow_audit_records_total";

    // Broker metrics
    pub const BROKER_CONNECT_FAILURES_TOTAL: &str = "calcflow_broker_connect_failures_total";
    pub const BROKER_PUBLISHED_TOTAL: &str = "calcflow_broker_published_total";
    pub const BROKER_PUBLISH_FAILURES_TOTAL: &str = "calcflow_broker_publish_failures_total";

    // Ingest metrics
    pub const INGEST_ACCEPTED_TOTAL: &str = "calcflow_ingest_accepted_total";
    pub const INGEST_DROPPED_TOTAL: &str = "calcflow_ingest_dropped_total";
}

/// Install the Prometheus exporter with its own HTTP listener.
///
/// Returns `true` if installation succeeded, `false` if already installed or
/// the listener could not be set up.
pub fn init_metrics(listen: &str) -> bool {
    if INSTALLED.load(Ordering::Acquire) {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    let addr: SocketAddr = match listen.parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(listen = %listen, error = %e, "Invalid metrics listen address");
            return false;
        }
    };

    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            INSTALLED.store(true, Ordering::Release);
            tracing::info!(listen = %addr, "Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus exporter");
            false
        }
    }
}

// =============================================================================
// Cache Metrics
// =============================================================================

pub fn record_cache_hit(operation: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "operation" => operation).increment(1);
}

pub fn record_cache_miss(operation: &'static str) {
    counter!(names::CACHE_MISSES_TOTAL, "operation" => operation).increment(1);
}

pub fn record_cache_error(stage: &'static str) {
    counter!(names::CACHE_ERRORS_TOTAL, "stage" => stage).increment(1);
}

// =============================================================================
// Pipeline Metrics
// =============================================================================

pub fn record_computation(operation: &'static str) {
    counter!(names::COMPUTATIONS_TOTAL, "operation" => operation).increment(1);
}

pub fn record_audit_write(outcome: &'static str) {
    counter!(names::AUDIT_RECORDS_TOTAL, "outcome" => outcome).increment(1);
}

// =============================================================================
// Broker Metrics
// =============================================================================

pub fn record_broker_connect_failure() {
    counter!(names::BROKER_CONNECT_FAILURES_TOTAL).increment(1);
}

pub fn record_published(topic: &str) {
    counter!(names::BROKER_PUBLISHED_TOTAL, "topic" => topic.to_string()).increment(1);
}

pub fn record_publish_failure(topic: &str) {
    counter!(names::BROKER_PUBLISH_FAILURES_TOTAL, "topic" => topic.to_string()).increment(1);
}

// =============================================================================
// Ingest Metrics
// =============================================================================

pub fn record_ingest_accepted() {
    counter!(names::INGEST_ACCEPTED_TOTAL).increment(1);
}

pub fn record_ingest_dropped(reason: &'static str) {
    counter!(names::INGEST_DROPPED_TOTAL, "reason" => reason).increment(1);
}
