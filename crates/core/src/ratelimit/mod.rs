//! Rate limiting primitives.
//!
//! Two primitives ([`TokenBucket`], [`SlidingWindow`]) and one compositor
//! ([`KeyedLimiter`]). The three limiters the service runs are built from
//! these: the global [`UpstreamLimiter`], per-chat admission and per-chat
//! LLM admission.

mod keyed;
mod sliding_window;
mod token_bucket;

pub use keyed::{Admission, KeyedLimiter, KeyedLimiterConfig, LimitLayer};
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::config::ScraperConfig;
use crate::context::{ContextError, RequestContext};

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AcquireError {
    #[error("timed out waiting for an upstream token")]
    Timeout,

    #[error("canceled while waiting for an upstream token")]
    Canceled,
}

/// Global limiter on aggregate upstream request rate.
pub struct UpstreamLimiter {
    bucket: Mutex<TokenBucket>,
    max_wait: Duration,
}

impl UpstreamLimiter {
    pub fn new(burst: u32, requests_per_second: f64, max_wait: Duration) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(burst, requests_per_second)),
            max_wait,
        }
    }

    pub fn from_config(config: &ScraperConfig) -> Self {
        Self::new(
            config.burst,
            config.requests_per_second,
            Duration::from_millis(config.acquire_timeout_ms),
        )
    }

    /// Wait for a token, giving up after the configured wait or when the
    /// context ends.
    pub async fn acquire(&self, ctx: &RequestContext) -> Result<(), AcquireError> {
        let started = Instant::now();
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                if bucket.allow() {
                    return Ok(());
                }
                bucket.wait_time()
            };

            if started.elapsed().saturating_add(wait) > self.max_wait {
                return Err(AcquireError::Timeout);
            }
            ctx.sleep(wait).await.map_err(|e| match e {
                ContextError::Canceled => AcquireError::Canceled,
                ContextError::DeadlineExceeded => AcquireError::Timeout,
            })?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = UpstreamLimiter::new(1, 2.0, Duration::from_secs(1));
        let ctx = RequestContext::background();
        limiter.acquire(&ctx).await.unwrap();

        let started = Instant::now();
        limiter.acquire(&ctx).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(499));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let limiter = UpstreamLimiter::new(1, 0.1, Duration::from_secs(1));
        let ctx = RequestContext::background();
        limiter.acquire(&ctx).await.unwrap();
        assert_eq!(limiter.acquire(&ctx).await, Err(AcquireError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_honors_cancellation() {
        let limiter = UpstreamLimiter::new(1, 0.5, Duration::from_secs(10));
        let (ctx, handle) = RequestContext::cancellable();
        limiter.acquire(&ctx).await.unwrap();
        handle.cancel();
        assert_eq!(limiter.acquire(&ctx).await, Err(AcquireError::Canceled));
    }
}
