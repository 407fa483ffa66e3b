//! Polite upstream HTTP.
//!
//! Adapters talk to upstream sites through the [`Fetch`] trait. The
//! production [`ScraperClient`] owns every piece of request policy:
//! admission, user-agent rotation, mirror failover, retries with backoff
//! and request coalescing.

mod client;
mod singleflight;
mod user_agent;

pub use client::{RetryPolicy, ScraperClient};
pub use singleflight::SingleFlight;
pub use user_agent::UserAgentPool;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::RequestContext;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request canceled")]
    Canceled,

    #[error("request timed out")]
    Timeout,

    #[error("upstream returned HTTP {status}")]
    UpstreamHttp { status: u16 },

    #[error("all mirrors failed: {0}")]
    AllMirrorsFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),
}

impl FetchError {
    /// Worth another attempt after a backoff.
    pub fn is_retriable(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Transport(_) | FetchError::AllMirrorsFailed(_) => true,
            FetchError::UpstreamHttp { status } => *status == 429 || *status >= 500,
            FetchError::Canceled | FetchError::UnknownEndpoint(_) => false,
        }
    }

    /// Short label for metrics and logs.
    pub fn classification(&self) -> &'static str {
        match self {
            FetchError::Canceled => "canceled",
            FetchError::Timeout => "timeout",
            FetchError::UpstreamHttp { status } if *status == 429 => "http_429",
            FetchError::UpstreamHttp { status } if *status >= 500 => "http_5xx",
            FetchError::UpstreamHttp { .. } => "http_4xx",
            FetchError::AllMirrorsFailed(_) => "all_mirrors_failed",
            FetchError::Transport(_) => "transport",
            FetchError::UnknownEndpoint(_) => "unknown_endpoint",
        }
    }
}

/// A read-shaped request against a logical endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Logical endpoint name (e.g. `lms`), resolved to mirrors by the client.
    pub endpoint: String,
    pub path: String,
    /// Already-encoded query string without the leading `?`.
    pub query: Option<String>,
}

impl FetchRequest {
    pub fn new(endpoint: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            path: path.into(),
            query: None,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.query = if query.is_empty() { None } else { Some(query) };
        self
    }

    /// Path plus query, as appended to a mirror base URL.
    pub fn path_and_query(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        match &self.query {
            Some(q) => format!("{}?{}", path, q),
            None => path,
        }
    }

    /// Coalescing key: endpoint, normalized path and sorted query pairs.
    pub fn fingerprint(&self) -> String {
        let mut path = String::with_capacity(self.path.len() + 1);
        for segment in self.path.split('/').filter(|s| !s.is_empty()) {
            path.push('/');
            path.push_str(segment);
        }
        if path.is_empty() {
            path.push('/');
        }

        let mut pairs: Vec<&str> = self
            .query
            .as_deref()
            .unwrap_or("")
            .split('&')
            .filter(|p| !p.is_empty())
            .collect();
        pairs.sort_unstable();

        format!("{}|{}|{}", self.endpoint, path, pairs.join("&"))
    }
}

/// A successful upstream response.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    /// Final URL (after redirects).
    pub url: String,
    pub body: Arc<[u8]>,
}

impl FetchResponse {
    pub fn new(status: u16, url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            url: url.into(),
            body: Arc::from(body.into()),
        }
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Upstream fetch seam.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(
        &self,
        ctx: &RequestContext,
        req: FetchRequest,
    ) -> Result<FetchResponse, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_normalizes_path_and_query() {
        let a = FetchRequest::new("course", "//query//list/").with_query("b=2&a=1");
        let b = FetchRequest::new("course", "/query/list").with_query("a=1&b=2&");
        assert_eq!(a.fingerprint(), b.fingerprint());

        let other = FetchRequest::new("lms", "/query/list").with_query("a=1&b=2");
        assert_ne!(a.fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_path_and_query() {
        let req = FetchRequest::new("lms", "search.php").with_query("id=1");
        assert_eq!(req.path_and_query(), "/search.php?id=1");
        assert_eq!(FetchRequest::new("lms", "/").path_and_query(), "/");
    }

    #[test]
    fn test_retriable_classes() {
        assert!(FetchError::UpstreamHttp { status: 503 }.is_retriable());
        assert!(FetchError::UpstreamHttp { status: 429 }.is_retriable());
        assert!(!FetchError::UpstreamHttp { status: 404 }.is_retriable());
        assert!(!FetchError::Canceled.is_retriable());
        assert!(FetchError::Transport("reset".into()).is_retriable());
    }
}
