//! `POST /webhook`: signature check, envelope parsing and per-event
//! processing.
//!
//! Every event runs on its own task. The handler waits for all of them
//! (each is bounded by the processing deadline) so that graceful shutdown
//! drains replies still in flight.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::line::{verify_signature, WebhookEnvelope, SIGNATURE_HEADER};
use crate::state::AppState;

pub async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_signature(state.channel_secret(), &body, signature) {
        state.metrics().signature_failures.inc();
        warn!("Rejected webhook with invalid signature");
        return StatusCode::UNAUTHORIZED;
    }

    let envelope: WebhookEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Malformed webhook body");
            return StatusCode::BAD_REQUEST;
        }
    };
    debug!(
        events = envelope.events.len(),
        destination = envelope.destination.as_deref().unwrap_or(""),
        "Webhook received"
    );

    let mut tasks = Vec::with_capacity(envelope.events.len());
    for raw in envelope.events {
        let Some(event) = raw.to_event() else {
            continue;
        };
        let reply_token = raw.reply_token;
        let state = state.clone();
        tasks.push(tokio::spawn(async move {
            let messages = state.processor().process(event).await;
            let Some(token) = reply_token else {
                return;
            };
            if messages.is_empty() {
                return;
            }
            match state.replier().reply(&token, &messages).await {
                Ok(()) => info!(count = messages.len(), "Reply sent"),
                Err(e) => error!(error = %e, "Failed to send reply"),
            }
        }));
    }

    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!(error = %e, "Event task failed");
        }
    }

    StatusCode::OK
}
