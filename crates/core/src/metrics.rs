//! Prometheus metrics for core components.
//!
//! A single [`Metrics`] value owns the registry and every collector. It is
//! built once at startup and handed to the components that record into it.
//!
//! - Webhook and pipeline outcomes
//! - Handlers, search tiers and cache lookups
//! - Upstream scraping (requests, retries, coalescing)
//! - Admission limiters, NLU and warm-up

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::store::StoreStats;

pub struct Metrics {
    registry: Registry,

    // =========================================================================
    // Webhook / pipeline
    // =========================================================================
    /// Inbound webhook events by type.
    pub webhook_events: IntCounterVec,
    /// Webhook requests rejected for a bad signature.
    pub signature_failures: IntCounter,
    /// Pipeline results by error classification (`ok` on success).
    pub pipeline_outcomes: IntCounterVec,
    /// Requests refused by an admission limiter.
    pub admission_denials: IntCounterVec,

    // =========================================================================
    // Query core
    // =========================================================================
    /// Handler invocations by module and outcome.
    pub handler_requests: IntCounterVec,
    /// Records returned by each search tier.
    pub search_results: IntCounterVec,
    /// Store lookups by entity kind and hit/miss.
    pub cache_lookups: IntCounterVec,
    /// Rows per store table (collected on scrape).
    pub store_rows: IntGaugeVec,

    // =========================================================================
    // Ingestion core
    // =========================================================================
    /// Upstream attempts by endpoint and outcome.
    pub upstream_requests: IntCounterVec,
    /// Upstream attempt latency.
    pub upstream_duration: HistogramVec,
    /// Retries scheduled per endpoint.
    pub upstream_retries: IntCounterVec,
    /// Callers that joined an in-flight request instead of issuing one.
    pub coalesced_requests: IntCounter,
    /// Records ingested by warm-up module.
    pub warmup_records: IntCounterVec,

    // =========================================================================
    // NLU
    // =========================================================================
    /// NLU calls by provider and outcome.
    pub nlu_calls: IntCounterVec,
}

impl Metrics {
    /// Create every collector and register it with a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let webhook_events = IntCounterVec::new(
            Opts::new("unibot_webhook_events_total", "Inbound webhook events"),
            &["type"],
        )?;
        let signature_failures = IntCounter::new(
            "unibot_webhook_signature_failures_total",
            "Webhook requests with an invalid signature",
        )?;
        let pipeline_outcomes = IntCounterVec::new(
            Opts::new(
                "unibot_pipeline_outcomes_total",
                "Pipeline results by classification",
            ),
            &["classification"],
        )?;
        let admission_denials = IntCounterVec::new(
            Opts::new(
                "unibot_admission_denials_total",
                "Requests refused by an admission limiter",
            ),
            &["limiter", "layer"],
        )?;
        let handler_requests = IntCounterVec::new(
            Opts::new("unibot_handler_requests_total", "Handler invocations"),
            &["module", "outcome"],
        )?;
        let search_results = IntCounterVec::new(
            Opts::new(
                "unibot_search_results_total",
                "Records returned per search tier",
            ),
            &["module", "tier"],
        )?;
        let cache_lookups = IntCounterVec::new(
            Opts::new("unibot_cache_lookups_total", "Store lookups by result"),
            &["kind", "result"],
        )?;
        let store_rows = IntGaugeVec::new(
            Opts::new("unibot_store_rows", "Rows per store table"),
            &["table"],
        )?;
        let upstream_requests = IntCounterVec::new(
            Opts::new("unibot_upstream_requests_total", "Upstream HTTP attempts"),
            &["endpoint", "outcome"],
        )?;
        let upstream_duration = HistogramVec::new(
            HistogramOpts::new(
                "unibot_upstream_request_duration_seconds",
                "Upstream HTTP attempt duration",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["endpoint"],
        )?;
        let upstream_retries = IntCounterVec::new(
            Opts::new("unibot_upstream_retries_total", "Upstream retries"),
            &["endpoint"],
        )?;
        let coalesced_requests = IntCounter::new(
            "unibot_upstream_coalesced_total",
            "Requests served by an identical in-flight request",
        )?;
        let warmup_records = IntCounterVec::new(
            Opts::new("unibot_warmup_records_total", "Records ingested by warm-up"),
            &["module"],
        )?;
        let nlu_calls = IntCounterVec::new(
            Opts::new("unibot_nlu_calls_total", "NLU calls"),
            &["provider", "outcome"],
        )?;

        registry.register(Box::new(webhook_events.clone()))?;
        registry.register(Box::new(signature_failures.clone()))?;
        registry.register(Box::new(pipeline_outcomes.clone()))?;
        registry.register(Box::new(admission_denials.clone()))?;
        registry.register(Box::new(handler_requests.clone()))?;
        registry.register(Box::new(search_results.clone()))?;
        registry.register(Box::new(cache_lookups.clone()))?;
        registry.register(Box::new(store_rows.clone()))?;
        registry.register(Box::new(upstream_requests.clone()))?;
        registry.register(Box::new(upstream_duration.clone()))?;
        registry.register(Box::new(upstream_retries.clone()))?;
        registry.register(Box::new(coalesced_requests.clone()))?;
        registry.register(Box::new(warmup_records.clone()))?;
        registry.register(Box::new(nlu_calls.clone()))?;

        Ok(Self {
            registry,
            webhook_events,
            signature_failures,
            pipeline_outcomes,
            admission_denials,
            handler_requests,
            search_results,
            cache_lookups,
            store_rows,
            upstream_requests,
            upstream_duration,
            upstream_retries,
            coalesced_requests,
            warmup_records,
            nlu_calls,
        })
    }

    /// Registry that other layers (e.g. HTTP middleware) register into.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Update the store row gauges.
    pub fn record_store_stats(&self, stats: &StoreStats) {
        for (table, rows) in [
            ("students", stats.students),
            ("contacts", stats.contacts),
            ("courses", stats.courses),
            ("historical_courses", stats.historical_courses),
            ("programs", stats.programs),
        ] {
            self.store_rows
                .with_label_values(&[table])
                .set(rows.min(i64::MAX as u64) as i64);
        }
    }

    /// Encode all metrics as Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_returns_prometheus_format() {
        let metrics = Metrics::new().unwrap();
        metrics
            .upstream_requests
            .with_label_values(&["lms", "ok"])
            .inc();

        let output = metrics.encode().unwrap();
        assert!(output.contains("unibot_upstream_requests_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.coalesced_requests.inc();
        assert_eq!(a.coalesced_requests.get(), 1);
        assert_eq!(b.coalesced_requests.get(), 0);
    }

    #[test]
    fn test_store_stats_gauges() {
        let metrics = Metrics::new().unwrap();
        metrics.record_store_stats(&StoreStats {
            students: 3,
            ..Default::default()
        });
        assert_eq!(metrics.store_rows.with_label_values(&["students"]).get(), 3);
        let output = metrics.encode().unwrap();
        assert!(output.contains("unibot_store_rows"));
    }
}
