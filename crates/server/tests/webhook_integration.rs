//! Webhook, health and metrics endpoints through the real router.

mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{envelope, text_event, TestFixture};
use unibot_core::store::{Contact, Store};
use unibot_core::Message;

#[tokio::test]
async fn test_signed_text_event_is_answered() {
    let fixture = TestFixture::new();

    let response = fixture
        .post_webhook(&envelope(vec![text_event("r1", "U1", "說明")]))
        .await;
    assert_eq!(response.status, StatusCode::OK);

    let replies = fixture.replier.replies();
    assert_eq!(replies.len(), 1);
    let (token, messages) = &replies[0];
    assert_eq!(token, "r1");
    assert!(messages[0].as_text().unwrap().contains("課程"));
    assert!(matches!(
        &messages[0],
        Message::Text { quote_token: Some(q), .. } if q == "q-1"
    ));
}

#[tokio::test]
async fn test_invalid_signature_is_rejected() {
    let fixture = TestFixture::new();
    let body = envelope(vec![text_event("r1", "U1", "說明")]);

    let response = fixture
        .post_webhook_with_signature(&body, Some("bm90LXRoZS1zaWduYXR1cmU="))
        .await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);

    let response = fixture.post_webhook_with_signature(&body, None).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);

    assert!(fixture.replier.replies().is_empty());
    assert_eq!(fixture.env.metrics.signature_failures.get(), 2);
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let fixture = TestFixture::new();
    let response = fixture.post_webhook("{\"events\": [").await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_empty_verification_envelope() {
    let fixture = TestFixture::new();
    let response = fixture.post_webhook(&envelope(Vec::new())).await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(fixture.replier.replies().is_empty());
}

#[tokio::test]
async fn test_each_event_gets_its_own_reply() {
    let fixture = TestFixture::new();
    fixture
        .env
        .store
        .save_contacts(&[Contact::person("王小明", Some("資訊中心".into()))])
        .unwrap();

    let response = fixture
        .post_webhook(&envelope(vec![
            text_event("r1", "U1", "聯絡 王小明"),
            text_event("r2", "U2", "說明"),
            json!({"type": "unfollow", "source": {"type": "user", "userId": "U3"}}),
        ]))
        .await;
    assert_eq!(response.status, StatusCode::OK);

    let mut replies = fixture.replier.replies();
    replies.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].0, "r1");
    assert!(matches!(replies[0].1[0], Message::Carousel { .. }));
    assert_eq!(replies[1].0, "r2");
}

#[tokio::test]
async fn test_unaddressed_group_message_gets_no_reply() {
    let fixture = TestFixture::new();
    let event = json!({
        "type": "message",
        "replyToken": "r1",
        "source": { "type": "group", "groupId": "G1", "userId": "U1" },
        "message": { "type": "text", "id": "m1", "text": "今天午餐吃什麼" }
    });

    let response = fixture.post_webhook(&envelope(vec![event])).await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(fixture.replier.replies().is_empty());
}

#[tokio::test]
async fn test_follow_event_gets_welcome() {
    let fixture = TestFixture::new();
    let event = json!({
        "type": "follow",
        "replyToken": "r1",
        "source": { "type": "user", "userId": "U1" }
    });

    fixture.post_webhook(&envelope(vec![event])).await;
    let replies = fixture.replier.replies();
    assert_eq!(replies.len(), 1);
    assert!(replies[0].1[0].as_text().unwrap().starts_with("嗨！"));
}

#[tokio::test]
async fn test_healthz_waits_for_warmup() {
    let fixture = TestFixture::cold();
    let response = fixture.get("/healthz").await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.json()["warmup"], false);
    assert_eq!(response.json()["store"], true);

    let fixture = TestFixture::new();
    let response = fixture.get("/healthz").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json()["status"], "ok");
}

#[tokio::test]
async fn test_metrics_exposition() {
    let fixture = TestFixture::new();
    fixture
        .post_webhook(&envelope(vec![text_event("r1", "U1", "說明")]))
        .await;
    fixture.get("/healthz").await;

    let response = fixture.get("/metrics").await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.body.contains("unibot_webhook_events_total"));
    assert!(response.body.contains("unibot_store_rows"));
    assert!(response
        .body
        .contains("unibot_http_requests_total{method=\"GET\",path=\"/healthz\",status=\"200\"} 1"));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let fixture = TestFixture::new();
    let response = fixture.get("/wp-login.php").await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}
