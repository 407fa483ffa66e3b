//! In-process server fixture.
//!
//! Builds the real router around a core test environment (in-memory
//! store, mock upstream, manual clock) and a replier that records what
//! would have been sent to the platform.

#![allow(dead_code)]

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use unibot_core::testing::{fixtures, MockIntentParser};
use unibot_core::Message;
use unibot_server::line::{sign, SIGNATURE_HEADER};
use unibot_server::{create_router, AppState, HttpMetrics, Replier, ReplyError};

pub use unibot_core::testing::fixtures::TestEnv;

pub const CHANNEL_SECRET: &str = "test-channel-secret";

/// Replies captured instead of being posted.
#[derive(Default)]
pub struct RecordingReplier {
    replies: Mutex<Vec<(String, Vec<Message>)>>,
}

impl RecordingReplier {
    pub fn replies(&self) -> Vec<(String, Vec<Message>)> {
        self.replies.lock().unwrap().clone()
    }
}

#[async_trait]
impl Replier for RecordingReplier {
    async fn reply(&self, reply_token: &str, messages: &[Message]) -> Result<(), ReplyError> {
        self.replies
            .lock()
            .unwrap()
            .push((reply_token.to_string(), messages.to_vec()));
        Ok(())
    }
}

pub struct TestFixture {
    pub router: Router,
    pub state: Arc<AppState>,
    pub env: TestEnv,
    pub replier: Arc<RecordingReplier>,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: String,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

impl TestFixture {
    /// Fixture whose startup warm-up has already finished.
    pub fn new() -> Self {
        let fixture = Self::cold();
        fixture.state.warmup_flag().store(true, Ordering::Release);
        fixture
    }

    /// Fixture still waiting for the startup warm-up.
    pub fn cold() -> Self {
        let env = fixtures::env();
        let processor = Arc::new(fixtures::processor(
            &env,
            Arc::new(MockIntentParser::disabled()),
        ));
        let http_metrics = HttpMetrics::register(&env.metrics).unwrap();
        let replier = Arc::new(RecordingReplier::default());
        let state = Arc::new(AppState::new(
            processor,
            replier.clone(),
            env.store.clone(),
            env.metrics.clone(),
            http_metrics,
            CHANNEL_SECRET,
        ));
        Self {
            router: create_router(state.clone()),
            state,
            env,
            replier,
        }
    }

    async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        TestResponse {
            status,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        }
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.send(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
    }

    /// POST a correctly signed webhook body.
    pub async fn post_webhook(&self, body: &str) -> TestResponse {
        let signature = sign(CHANNEL_SECRET, body.as_bytes()).unwrap();
        self.post_webhook_with_signature(body, Some(&signature)).await
    }

    pub async fn post_webhook_with_signature(
        &self,
        body: &str,
        signature: Option<&str>,
    ) -> TestResponse {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }
}

/// One text message event from a personal chat.
pub fn text_event(reply_token: &str, user: &str, text: &str) -> Value {
    serde_json::json!({
        "type": "message",
        "replyToken": reply_token,
        "source": { "type": "user", "userId": user },
        "message": { "type": "text", "id": "m1", "text": text, "quoteToken": "q-1" }
    })
}

pub fn envelope(events: Vec<Value>) -> String {
    serde_json::json!({ "destination": "Ubot", "events": events }).to_string()
}
