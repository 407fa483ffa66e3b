//! HTTP metrics middleware.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;

use crate::metrics::normalize_path;
use crate::state::AppState;

/// Records request duration, request count and requests in flight.
pub async fn metrics_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let metrics = state.http_metrics();
    let start = Instant::now();
    let method = request.method().to_string();
    let path = normalize_path(request.uri().path());

    metrics.requests_in_flight.inc();

    let response = next.run(request).await;

    metrics.requests_in_flight.dec();

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    metrics
        .request_duration
        .with_label_values(&[&method, &path, &status])
        .observe(duration);
    metrics
        .requests_total
        .with_label_values(&[&method, &path, &status])
        .inc();

    response
}
