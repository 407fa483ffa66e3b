use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use unibot_core::{Metrics, Processor, Store};

use crate::line::Replier;
use crate::metrics::HttpMetrics;

/// Shared application state
pub struct AppState {
    processor: Arc<Processor>,
    replier: Arc<dyn Replier>,
    store: Arc<dyn Store>,
    metrics: Arc<Metrics>,
    http_metrics: HttpMetrics,
    channel_secret: String,
    warmup_done: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(
        processor: Arc<Processor>,
        replier: Arc<dyn Replier>,
        store: Arc<dyn Store>,
        metrics: Arc<Metrics>,
        http_metrics: HttpMetrics,
        channel_secret: impl Into<String>,
    ) -> Self {
        Self {
            processor,
            replier,
            store,
            metrics,
            http_metrics,
            channel_secret: channel_secret.into(),
            warmup_done: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    pub fn replier(&self) -> &Arc<dyn Replier> {
        &self.replier
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn http_metrics(&self) -> &HttpMetrics {
        &self.http_metrics
    }

    pub fn channel_secret(&self) -> &str {
        &self.channel_secret
    }

    /// Flag set once the startup warm-up finished, even partially.
    pub fn warmup_flag(&self) -> Arc<AtomicBool> {
        self.warmup_done.clone()
    }

    pub fn is_warm(&self) -> bool {
        self.warmup_done.load(Ordering::Acquire)
    }
}
