//! HTTP metrics for the webhook server.
//!
//! Collectors are registered into the core [`Metrics`] registry so a
//! single `/metrics` scrape exposes both.

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts};

use unibot_core::Metrics;

#[derive(Clone)]
pub struct HttpMetrics {
    /// HTTP request duration in seconds.
    pub request_duration: HistogramVec,
    pub requests_total: IntCounterVec,
    pub requests_in_flight: IntGauge,
}

impl HttpMetrics {
    /// Create the collectors and register them with `metrics`.
    pub fn register(metrics: &Metrics) -> Result<Self, prometheus::Error> {
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "unibot_http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
            &["method", "path", "status"],
        )?;
        let requests_total = IntCounterVec::new(
            Opts::new("unibot_http_requests_total", "Total HTTP requests"),
            &["method", "path", "status"],
        )?;
        let requests_in_flight = IntGauge::new(
            "unibot_http_requests_in_flight",
            "Number of HTTP requests currently being processed",
        )?;

        let registry = metrics.registry();
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(requests_in_flight.clone()))?;

        Ok(Self {
            request_duration,
            requests_total,
            requests_in_flight,
        })
    }
}

/// Collapse a request path to a known route so label cardinality stays
/// bounded.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed {
        "/webhook" | "/healthz" | "/metrics" => trimmed.to_string(),
        "" => "/".to_string(),
        _ => "other".to_string(),
    }
}
