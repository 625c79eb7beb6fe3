//! Prometheus metrics for the gatekeeper
//!
//! This module is only compiled when the `metrics` feature is enabled.
//!
//! ## HTTP
//! - `http_requests_total` - Counter by method, matched path and status
//! - `http_request_duration_seconds` - Histogram by method and matched path
//!
//! ## Admission
//! - `gatekeeper_requests_total` - Gated requests by endpoint and outcome code
//! - `gatekeeper_rate_limit_rejections_total` - Rate limit rejections by plan tier
//! - `gatekeeper_quota_rejections_total` - Quota rejections by plan tier
//! - `gatekeeper_key_cache_total` - Key resolver cache hits and misses
//! - `gatekeeper_result_cache_total` - Result cache hits, misses and errors
//! - `gatekeeper_degraded_events_total` - Fail-open events by component
//!
//! ## Background work
//! - `gatekeeper_background_jobs_total` - Work queue jobs by kind and outcome
//! - `gatekeeper_billing_events_total` - Billing notifications by outcome
//!
//! ## Cardinality
//!
//! No metric carries a tenant id label. Plan tier is the finest tenant
//! dimension exported, which keeps the series count fixed as tenants grow.

use axum::{
    extract::{MatchedPath, Request},
    http::StatusCode,
    middleware::Next,
    response::IntoResponse,
};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec,
    TextEncoder,
};
use std::time::Instant;

lazy_static! {
    /// Counter for total HTTP requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    /// Histogram for HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request latency in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    /// Counter for gated requests by endpoint and outcome ("OK" or an error code)
    pub static ref GATEKEEPER_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "gatekeeper_requests_total",
        "Gated requests by endpoint and outcome",
        &["endpoint", "outcome"]
    )
    .unwrap();

    pub static ref GATEKEEPER_RATE_LIMIT_REJECTIONS_TOTAL: CounterVec = register_counter_vec!(
        "gatekeeper_rate_limit_rejections_total",
        "Requests rejected by the per-minute rate limit",
        &["tier"]
    )
    .unwrap();

    pub static ref GATEKEEPER_QUOTA_REJECTIONS_TOTAL: CounterVec = register_counter_vec!(
        "gatekeeper_quota_rejections_total",
        "Requests rejected by the monthly quota",
        &["tier"]
    )
    .unwrap();

    pub static ref GATEKEEPER_KEY_CACHE_TOTAL: CounterVec = register_counter_vec!(
        "gatekeeper_key_cache_total",
        "Key resolver cache lookups",
        &["result"]  // "hit" or "miss"
    )
    .unwrap();

    pub static ref GATEKEEPER_RESULT_CACHE_TOTAL: CounterVec = register_counter_vec!(
        "gatekeeper_result_cache_total",
        "Result cache lookups",
        &["result"]  // "hit", "miss" or "error"
    )
    .unwrap();

    pub static ref GATEKEEPER_DEGRADED_EVENTS_TOTAL: CounterVec = register_counter_vec!(
        "gatekeeper_degraded_events_total",
        "Counter store failures absorbed by failing open",
        &["component"]
    )
    .unwrap();

    pub static ref GATEKEEPER_BACKGROUND_JOBS_TOTAL: CounterVec = register_counter_vec!(
        "gatekeeper_background_jobs_total",
        "Work queue jobs by kind and outcome",
        &["job", "outcome"]  // "queued", "dropped", "completed", "failed"
    )
    .unwrap();

    pub static ref GATEKEEPER_BILLING_EVENTS_TOTAL: CounterVec = register_counter_vec!(
        "gatekeeper_billing_events_total",
        "Billing notifications by outcome",
        &["outcome"]  // "applied", "duplicate", "rejected", "failed"
    )
    .unwrap();
}

/// Axum middleware to track HTTP request metrics
pub async fn track_metrics(req: Request, next: Next) -> impl IntoResponse {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &path, &status])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[&method, &path])
        .observe(duration);

    response
}

/// Handler for the `/metrics` endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", encoder.format_type())],
            buffer,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

pub fn record_gated_request(endpoint: &str, outcome: &str) {
    GATEKEEPER_REQUESTS_TOTAL
        .with_label_values(&[endpoint, outcome])
        .inc();
}

pub fn record_rate_limit_rejection(tier: &str) {
    GATEKEEPER_RATE_LIMIT_REJECTIONS_TOTAL
        .with_label_values(&[tier])
        .inc();
}

pub fn record_quota_rejection(tier: &str) {
    GATEKEEPER_QUOTA_REJECTIONS_TOTAL
        .with_label_values(&[tier])
        .inc();
}

pub fn record_key_cache(hit: bool) {
    GATEKEEPER_KEY_CACHE_TOTAL
        .with_label_values(&[if hit { "hit" } else { "miss" }])
        .inc();
}

/// `result` is one of "hit", "miss" or "error"
pub fn record_result_cache(result: &str) {
    GATEKEEPER_RESULT_CACHE_TOTAL
        .with_label_values(&[result])
        .inc();
}

pub fn record_degraded_event(component: &str) {
    GATEKEEPER_DEGRADED_EVENTS_TOTAL
        .with_label_values(&[component])
        .inc();
}

pub fn record_background_job(job: &str, outcome: &str) {
    GATEKEEPER_BACKGROUND_JOBS_TOTAL
        .with_label_values(&[job, outcome])
        .inc();
}

pub fn record_billing_event(outcome: &str) {
    GATEKEEPER_BILLING_EVENTS_TOTAL
        .with_label_values(&[outcome])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let before = GATEKEEPER_QUOTA_REJECTIONS_TOTAL
            .with_label_values(&["starter"])
            .get();
        record_quota_rejection("starter");
        let after = GATEKEEPER_QUOTA_REJECTIONS_TOTAL
            .with_label_values(&["starter"])
            .get();
        assert_eq!(after - before, 1.0);
    }

    #[tokio::test]
    async fn test_metrics_handler_exports_text_format() {
        record_background_job("record_usage", "queued");

        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("gatekeeper_background_jobs_total"));
    }
}
