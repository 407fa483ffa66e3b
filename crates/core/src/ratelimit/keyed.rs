//! Per-key limiter composing a token bucket and an optional sliding window.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info};

use super::{SlidingWindow, TokenBucket};
use crate::config::LimitsConfig;

/// Parameters of one keyed limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedLimiterConfig {
    pub burst: u32,
    /// One token regained per interval.
    pub refill_every: Duration,
    /// Optional cap per sliding day.
    pub daily_max: Option<u64>,
}

impl KeyedLimiterConfig {
    /// Per-chat message admission.
    pub fn chat(limits: &LimitsConfig) -> Self {
        Self {
            burst: limits.chat_burst,
            refill_every: secs(limits.chat_refill_secs),
            daily_max: None,
        }
    }

    /// Per-chat LLM admission.
    pub fn llm(limits: &LimitsConfig) -> Self {
        Self {
            burst: limits.llm_burst,
            refill_every: secs(limits.llm_refill_secs),
            daily_max: Some(limits.llm_daily as u64),
        }
    }
}

fn secs(s: f64) -> Duration {
    Duration::try_from_secs_f64(s).unwrap_or(Duration::ZERO)
}

/// Which layer refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitLayer {
    Burst,
    Daily,
}

impl LimitLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitLayer::Burst => "burst",
            LimitLayer::Daily => "daily",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied(LimitLayer),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

struct Entry {
    bucket: TokenBucket,
    window: Option<SlidingWindow>,
}

impl Entry {
    fn is_idle(&mut self) -> bool {
        self.bucket.is_idle() && self.window.as_mut().map_or(true, |w| w.is_idle())
    }
}

/// Limiter keyed by chat identifier.
///
/// Entries are created on first reference and removed by [`cleanup`](Self::cleanup)
/// once idle. Admission across layers is atomic under the entry lock.
pub struct KeyedLimiter {
    name: &'static str,
    config: KeyedLimiterConfig,
    entries: RwLock<HashMap<String, Arc<Mutex<Entry>>>>,
}

impl KeyedLimiter {
    pub fn new(name: &'static str, config: KeyedLimiterConfig) -> Self {
        Self {
            name,
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn new_entry(&self) -> Entry {
        Entry {
            bucket: TokenBucket::every(self.config.burst, self.config.refill_every),
            window: self.config.daily_max.map(SlidingWindow::daily),
        }
    }

    async fn entry(&self, key: &str) -> Arc<Mutex<Entry>> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(key) {
                return Arc::clone(entry);
            }
        }
        let mut entries = self.entries.write().await;
        Arc::clone(
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(self.new_entry()))),
        )
    }

    /// Check every layer and consume from all of them only if all pass.
    pub async fn allow(&self, key: &str) -> Admission {
        let entry = self.entry(key).await;
        let mut entry = entry.lock().await;

        if !entry.bucket.check() {
            return Admission::Denied(LimitLayer::Burst);
        }
        if let Some(window) = entry.window.as_mut() {
            if !window.check() {
                return Admission::Denied(LimitLayer::Daily);
            }
        }

        entry.bucket.consume();
        if let Some(window) = entry.window.as_mut() {
            window.consume();
        }
        Admission::Allowed
    }

    /// Tokens currently in a key's bucket, if the key is tracked.
    pub async fn available(&self, key: &str) -> Option<f64> {
        let entry = {
            let entries = self.entries.read().await;
            entries.get(key).cloned()
        }?;
        let mut entry = entry.lock().await;
        Some(entry.bucket.available())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop idle entries. Entries locked by an in-flight admission are kept.
    pub async fn cleanup(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        // Outside handles belong to callers between `entry` and `lock`.
        entries.retain(|_, entry| {
            if Arc::strong_count(entry) > 1 {
                return true;
            }
            match entry.try_lock() {
                Ok(mut e) => !e.is_idle(),
                Err(_) => true,
            }
        });
        before - entries.len()
    }

    /// Spawn the periodic cleanup loop.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            info!(limiter = limiter.name, "Limiter cleanup loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(limiter = limiter.name, "Limiter cleanup loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let removed = limiter.cleanup().await;
                        if removed > 0 {
                            debug!(limiter = limiter.name, removed, "Evicted idle limiter entries");
                        }
                    }
                }
            }
            info!(limiter = limiter.name, "Limiter cleanup loop stopped");
        })
    }
}
