//! Prometheus metrics exposition
//!
//! Gateway-level series, recorded here:
//!
//! - `ocr_requests_total` (counter): label `status`
//! - `ocr_request_duration_seconds` (histogram): label `status`
//!
//! Key-level series come from `key_pool` through the same recorder:
//! `ocr_key_attempts_total{outcome}`, `ocr_pool_exhausted_total`,
//! `ocr_usage_commit_failures_total`.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Bucket boundaries for `ocr_request_duration_seconds`, 50ms to 120s.
/// OCR.space commonly takes several seconds per image.
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("ocr_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("histogram bucket list is non-empty")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Must run once, before any metric is emitted.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed OCR request with its HTTP status.
pub fn record_request(status: u16, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("ocr_requests_total", "status" => status_str.clone()).increment(1);
    metrics::histogram!("ocr_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}
