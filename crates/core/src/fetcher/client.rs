//! Production scraper client.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use rand::Rng;
use reqwest::header::USER_AGENT;
use reqwest::Client;
use tokio::time::Duration;
use tracing::{debug, warn, Instrument};

use super::{Fetch, FetchError, FetchRequest, FetchResponse, SingleFlight, UserAgentPool};
use crate::config::ScraperConfig;
use crate::context::{ContextError, RequestContext};
use crate::metrics::Metrics;
use crate::ratelimit::{AcquireError, UpstreamLimiter};

/// Retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Hard ceiling on the whole retry loop.
    pub budget: Duration,
    /// Timeout of one HTTP attempt.
    pub request_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ScraperConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            budget: Duration::from_secs(config.retry_budget_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    /// `min(base × 2^attempt, max)` scaled by `jitter`, which is clamped to `[0.5, 1.0]`.
    pub fn backoff(&self, attempt: u32, jitter: f64) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let raw = self.base_backoff.saturating_mul(factor).min(self.max_backoff);
        raw.mul_f64(jitter.clamp(0.5, 1.0))
    }
}

fn jitter() -> f64 {
    rand::thread_rng().gen_range(0.5..=1.0)
}

/// How a failed attempt should be treated by the retry loop.
enum Failure {
    /// Give up now and report this error.
    Fatal(FetchError),
    /// Back off and try again if the schedule allows.
    Retriable(FetchError),
}

struct Inner {
    http: Client,
    endpoints: BTreeMap<String, Vec<String>>,
    limiter: UpstreamLimiter,
    agents: UserAgentPool,
    policy: RetryPolicy,
    flights: SingleFlight<Result<FetchResponse, FetchError>>,
    metrics: Arc<Metrics>,
}

/// Rate-limited, retrying, coalescing HTTP client with mirror failover.
#[derive(Clone)]
pub struct ScraperClient {
    inner: Arc<Inner>,
}

impl ScraperClient {
    pub fn new(config: &ScraperConfig, metrics: Arc<Metrics>) -> Result<Self, FetchError> {
        let policy = RetryPolicy::from_config(config);
        let http = Client::builder()
            .timeout(policy.request_timeout)
            .cookie_store(true)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                endpoints: config.endpoints.clone(),
                limiter: UpstreamLimiter::from_config(config),
                agents: UserAgentPool::new(&config.user_agents),
                policy,
                flights: SingleFlight::new(),
                metrics,
            }),
        })
    }

    /// Mirrors configured for a logical endpoint.
    pub fn mirrors(&self, endpoint: &str) -> Option<&[String]> {
        self.inner.endpoints.get(endpoint).map(|m| m.as_slice())
    }

    /// Run the full retry loop under the retry budget.
    async fn execute(
        inner: Arc<Inner>,
        ctx: RequestContext,
        req: FetchRequest,
    ) -> Result<FetchResponse, FetchError> {
        let mirrors = inner
            .endpoints
            .get(&req.endpoint)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| FetchError::UnknownEndpoint(req.endpoint.clone()))?;

        let ctx = ctx.with_timeout(inner.policy.budget);
        match ctx.guard(Self::retry_loop(&inner, &ctx, &req, mirrors)).await {
            Ok(result) => result,
            Err(ContextError::Canceled) => Err(FetchError::Canceled),
            Err(ContextError::DeadlineExceeded) => {
                warn!(endpoint = %req.endpoint, path = %req.path, "Retry budget exhausted");
                Err(FetchError::Timeout)
            }
        }
    }

    async fn retry_loop(
        inner: &Inner,
        ctx: &RequestContext,
        req: &FetchRequest,
        mirrors: &[String],
    ) -> Result<FetchResponse, FetchError> {
        let mut last = FetchError::Timeout;
        for attempt in 0..=inner.policy.max_retries {
            if attempt > 0 {
                let wait = inner.policy.backoff(attempt - 1, jitter());
                inner
                    .metrics
                    .upstream_retries
                    .with_label_values(&[req.endpoint.as_str()])
                    .inc();
                debug!(endpoint = %req.endpoint, attempt, wait_ms = wait.as_millis() as u64, "Backing off");
                ctx.sleep(wait).await.map_err(|e| match e {
                    ContextError::Canceled => FetchError::Canceled,
                    ContextError::DeadlineExceeded => FetchError::Timeout,
                })?;
            }

            match Self::try_mirrors(inner, ctx, req, mirrors).await {
                Ok(resp) => return Ok(resp),
                Err(Failure::Fatal(e)) => return Err(e),
                Err(Failure::Retriable(e)) => {
                    warn!(endpoint = %req.endpoint, attempt, error = %e, "Upstream attempt failed");
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// One pass over the mirrors in order.
    async fn try_mirrors(
        inner: &Inner,
        ctx: &RequestContext,
        req: &FetchRequest,
        mirrors: &[String],
    ) -> Result<FetchResponse, Failure> {
        let mut last = None;
        for base in mirrors {
            inner.limiter.acquire(ctx).await.map_err(|e| {
                Failure::Fatal(match e {
                    AcquireError::Canceled => FetchError::Canceled,
                    AcquireError::Timeout => FetchError::Timeout,
                })
            })?;

            match Self::attempt(inner, ctx, req, base).await {
                Ok(resp) => return Ok(resp),
                Err(e @ FetchError::Canceled) => return Err(Failure::Fatal(e)),
                Err(e) if e.is_retriable() => {
                    debug!(endpoint = %req.endpoint, mirror = %base, error = %e, "Rolling to next mirror");
                    last = Some(e);
                }
                Err(e) => return Err(Failure::Fatal(e)),
            }
        }

        let last = last.unwrap_or(FetchError::Timeout);
        if mirrors.len() > 1 {
            Err(Failure::Retriable(FetchError::AllMirrorsFailed(format!(
                "{}: {}",
                req.endpoint, last
            ))))
        } else {
            Err(Failure::Retriable(last))
        }
    }

    /// A single HTTP GET against one mirror.
    async fn attempt(
        inner: &Inner,
        ctx: &RequestContext,
        req: &FetchRequest,
        base: &str,
    ) -> Result<FetchResponse, FetchError> {
        let url = format!("{}{}", base.trim_end_matches('/'), req.path_and_query());
        let started = Instant::now();

        let result = ctx
            .guard(async {
                let response = inner
                    .http
                    .get(&url)
                    .header(USER_AGENT, inner.agents.next())
                    .send()
                    .await
                    .map_err(classify_reqwest)?;

                let status = response.status().as_u16();
                if !response.status().is_success() {
                    return Err(FetchError::UpstreamHttp { status });
                }
                let final_url = response.url().to_string();
                let body = response.bytes().await.map_err(classify_reqwest)?;
                Ok::<_, FetchError>(FetchResponse::new(status, final_url, body.to_vec()))
            })
            .await
            .unwrap_or_else(|e| {
                Err(match e {
                    ContextError::Canceled => FetchError::Canceled,
                    ContextError::DeadlineExceeded => FetchError::Timeout,
                })
            });

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.classification(),
        };
        inner
            .metrics
            .upstream_requests
            .with_label_values(&[req.endpoint.as_str(), outcome])
            .inc();
        inner
            .metrics
            .upstream_duration
            .with_label_values(&[req.endpoint.as_str()])
            .observe(started.elapsed().as_secs_f64());

        result
    }
}

fn classify_reqwest(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(e.to_string())
    }
}

#[async_trait]
impl Fetch for ScraperClient {
    async fn fetch(
        &self,
        ctx: &RequestContext,
        req: FetchRequest,
    ) -> Result<FetchResponse, FetchError> {
        let key = req.fingerprint();
        let span = ctx.span("fetch");
        let (flight, joined) = self.inner.flights.join(&key, || {
            let inner = Arc::clone(&self.inner);
            // The shared work must not die with whichever caller started it.
            let detached = ctx.preserve_tracing();
            Self::execute(inner, detached, req)
                .instrument(span)
                .boxed()
        });

        if joined {
            self.inner.metrics.coalesced_requests.inc();
            debug!(key = %key, "Joined in-flight upstream request");
        }

        match ctx.guard(flight).await {
            Ok(result) => result,
            Err(ContextError::Canceled) => Err(FetchError::Canceled),
            Err(ContextError::DeadlineExceeded) => Err(FetchError::Timeout),
        }
    }
}
