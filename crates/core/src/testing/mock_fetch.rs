//! Mock upstream for testing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::context::{ContextError, RequestContext};
use crate::fetcher::{Fetch, FetchError, FetchRequest, FetchResponse};

/// A route handler that builds a body from the request.
type RouteFn = Arc<dyn Fn(&FetchRequest) -> Result<Vec<u8>, FetchError> + Send + Sync>;

#[derive(Clone)]
enum Route {
    Body(Vec<u8>),
    Dynamic(RouteFn),
    Fail(FetchError),
}

#[derive(Default)]
struct State {
    routes: HashMap<(String, String), Route>,
    calls: Vec<FetchRequest>,
    delay: Option<Duration>,
}

/// Mock implementation of the [`Fetch`] trait.
///
/// Routes are keyed by `(endpoint, path)`; the query string is ignored for
/// routing but recorded. Unrouted requests answer HTTP 404.
///
/// # Example
///
/// ```rust,ignore
/// let fetch = MockFetch::new();
/// fetch.on("program", "/programs", fixtures::program_page(&[("AI", "/p/ai", "跨領域")]));
/// fetch.fail("sea", "/contact/search", FetchError::Transport("down".into()));
///
/// // ... exercise an adapter ...
/// assert_eq!(fetch.calls_to("/programs"), 1);
/// ```
#[derive(Default)]
pub struct MockFetch {
    state: Mutex<State>,
}

impl std::fmt::Debug for MockFetch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockFetch")
            .field("calls", &self.call_count())
            .finish()
    }
}

impl MockFetch {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn route(&self, endpoint: &str, path: &str, route: Route) {
        self.state()
            .routes
            .insert((endpoint.to_string(), path.to_string()), route);
    }

    /// Answer `endpoint` + `path` with a fixed body.
    pub fn on(&self, endpoint: &str, path: &str, body: impl Into<Vec<u8>>) {
        self.route(endpoint, path, Route::Body(body.into()));
    }

    /// Answer `endpoint` + `path` with a body computed from the request.
    pub fn on_fn<F>(&self, endpoint: &str, path: &str, f: F)
    where
        F: Fn(&FetchRequest) -> Result<Vec<u8>, FetchError> + Send + Sync + 'static,
    {
        self.route(endpoint, path, Route::Dynamic(Arc::new(f)));
    }

    /// Fail every request to `endpoint` + `path`.
    pub fn fail(&self, endpoint: &str, path: &str, error: FetchError) {
        self.route(endpoint, path, Route::Fail(error));
    }

    /// Delay every response (cancellation-aware).
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<FetchRequest> {
        self.state().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    /// Number of requests to `path` on any endpoint.
    pub fn calls_to(&self, path: &str) -> usize {
        self.state().calls.iter().filter(|r| r.path == path).count()
    }
}

#[async_trait]
impl Fetch for MockFetch {
    async fn fetch(
        &self,
        ctx: &RequestContext,
        req: FetchRequest,
    ) -> Result<FetchResponse, FetchError> {
        let (route, delay) = {
            let mut state = self.state();
            state.calls.push(req.clone());
            let route = state
                .routes
                .get(&(req.endpoint.clone(), req.path.clone()))
                .cloned();
            (route, state.delay)
        };

        if let Some(delay) = delay {
            ctx.sleep(delay).await.map_err(|e| match e {
                ContextError::Canceled => FetchError::Canceled,
                ContextError::DeadlineExceeded => FetchError::Timeout,
            })?;
        }

        let url = format!("https://{}.mock{}", req.endpoint, req.path_and_query());
        let body = match route {
            Some(Route::Body(body)) => body,
            Some(Route::Dynamic(f)) => f(&req)?,
            Some(Route::Fail(e)) => return Err(e),
            None => return Err(FetchError::UpstreamHttp { status: 404 }),
        };
        Ok(FetchResponse::new(200, url, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_routes_and_records() {
        let fetch = MockFetch::new();
        fetch.on("lms", "/a", "hello");
        let ctx = RequestContext::background();

        let resp = fetch
            .fetch(&ctx, FetchRequest::new("lms", "/a").with_query("x=1"))
            .await
            .unwrap();
        assert_eq!(resp.text(), "hello");
        assert_eq!(resp.url, "https://lms.mock/a?x=1");

        let err = fetch.fetch(&ctx, FetchRequest::new("lms", "/b")).await.unwrap_err();
        assert_eq!(err, FetchError::UpstreamHttp { status: 404 });
        assert_eq!(fetch.call_count(), 2);
        assert_eq!(fetch.calls_to("/a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_honours_deadline() {
        let fetch = MockFetch::new();
        fetch.on("lms", "/a", "slow");
        fetch.set_delay(Duration::from_secs(5));
        let ctx = RequestContext::background().with_timeout(Duration::from_secs(1));

        let err = fetch.fetch(&ctx, FetchRequest::new("lms", "/a")).await.unwrap_err();
        assert_eq!(err, FetchError::Timeout);
    }
}
