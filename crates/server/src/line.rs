//! LINE Messaging API transport.
//!
//! Inbound: webhook envelope types, signature verification and the
//! mapping onto core [`Event`]s. Outbound: rendering core [`Message`]s as
//! LINE message objects and posting them with the reply token.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use unibot_core::processor::{ChatKind, Mention};
use unibot_core::{Action, Bubble, Event, EventInput, EventSource, Message};

/// Header carrying the base64 HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "x-line-signature";

type HmacSha256 = Hmac<Sha256>;

/// Check `signature` against the HMAC-SHA256 of `body` keyed by the
/// channel secret. Comparison is constant-time.
pub fn verify_signature(channel_secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = STANDARD.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(channel_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Compute the signature header value for `body`.
pub fn sign(channel_secret: &str, body: &[u8]) -> Result<String, hmac::digest::InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(channel_secret.as_bytes())?;
    mac.update(body);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub reply_token: Option<String>,
    #[serde(default)]
    pub source: Option<Source>,
    #[serde(default)]
    pub message: Option<InboundMessage>,
    #[serde(default)]
    pub postback: Option<PostbackContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub quote_token: Option<String>,
    #[serde(default)]
    pub mention: Option<MentionContent>,
}

#[derive(Debug, Deserialize)]
pub struct MentionContent {
    #[serde(default)]
    pub mentionees: Vec<Mentionee>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mentionee {
    pub index: usize,
    pub length: usize,
    #[serde(default)]
    pub is_self: bool,
}

#[derive(Debug, Deserialize)]
pub struct PostbackContent {
    pub data: String,
}

impl Source {
    fn to_event_source(&self) -> Option<EventSource> {
        let (kind, chat_id) = match self.kind.as_str() {
            "user" => (ChatKind::Personal, self.user_id.clone()?),
            "group" => (ChatKind::Group, self.group_id.clone()?),
            "room" => (ChatKind::Room, self.room_id.clone()?),
            _ => return None,
        };
        Some(EventSource {
            kind,
            chat_id,
            user_id: self.user_id.clone(),
        })
    }
}

impl WebhookEvent {
    /// Map onto a core event. Event and message types the bot does not
    /// handle (unfollow, images, ...) yield `None`.
    pub fn to_event(&self) -> Option<Event> {
        let source = self.source.as_ref()?.to_event_source()?;
        let input = match self.kind.as_str() {
            "message" => {
                let message = self.message.as_ref()?;
                match message.kind.as_str() {
                    "text" => EventInput::Text {
                        text: message.text.clone().unwrap_or_default(),
                        mentions: message
                            .mention
                            .as_ref()
                            .map(|m| {
                                m.mentionees
                                    .iter()
                                    .map(|m| Mention {
                                        index: m.index,
                                        length: m.length,
                                        is_self: m.is_self,
                                    })
                                    .collect()
                            })
                            .unwrap_or_default(),
                        quote_token: message.quote_token.clone(),
                    },
                    "sticker" => EventInput::Sticker {
                        quote_token: message.quote_token.clone(),
                    },
                    other => {
                        debug!(message_type = other, "Ignoring message type");
                        return None;
                    }
                }
            }
            "postback" => EventInput::Postback {
                data: self.postback.as_ref()?.data.clone(),
            },
            "follow" => EventInput::Follow,
            "join" => EventInput::Join,
            other => {
                debug!(event_type = other, "Ignoring event type");
                return None;
            }
        };
        Some(Event::new(source, input))
    }
}

fn render_action(action: &Action) -> Value {
    match action {
        Action::Postback {
            label,
            data,
            display_text,
        } => {
            let mut value = json!({ "type": "postback", "label": label, "data": data });
            if let Some(text) = display_text {
                value["displayText"] = json!(text);
            }
            value
        }
        Action::Message { label, text } => json!({ "type": "message", "label": label, "text": text }),
        Action::Uri { label, uri } => json!({ "type": "uri", "label": label, "uri": uri }),
    }
}

fn render_bubble(bubble: &Bubble) -> Value {
    let mut body = vec![json!({
        "type": "text",
        "text": bubble.title,
        "weight": "bold",
        "size": "lg",
        "wrap": true,
    })];
    if let Some(subtitle) = &bubble.subtitle {
        body.push(json!({
            "type": "text",
            "text": subtitle,
            "size": "sm",
            "color": "#888888",
            "wrap": true,
        }));
    }
    for line in &bubble.lines {
        body.push(json!({ "type": "text", "text": line, "size": "sm", "wrap": true }));
    }

    let mut value = json!({
        "type": "bubble",
        "body": { "type": "box", "layout": "vertical", "spacing": "sm", "contents": body },
    });
    if !bubble.actions.is_empty() {
        let buttons: Vec<Value> = bubble
            .actions
            .iter()
            .map(|a| json!({ "type": "button", "style": "link", "height": "sm", "action": render_action(a) }))
            .collect();
        value["footer"] = json!({ "type": "box", "layout": "vertical", "spacing": "sm", "contents": buttons });
    }
    value
}

/// Render one core message as a LINE message object.
pub fn render_message(message: &Message) -> Value {
    match message {
        Message::Text {
            text,
            quick_replies,
            quote_token,
        } => {
            let mut value = json!({ "type": "text", "text": text });
            if let Some(token) = quote_token {
                value["quoteToken"] = json!(token);
            }
            if !quick_replies.is_empty() {
                let items: Vec<Value> = quick_replies
                    .iter()
                    .map(|a| json!({ "type": "action", "action": render_action(a) }))
                    .collect();
                value["quickReply"] = json!({ "items": items });
            }
            value
        }
        Message::Carousel { alt_text, bubbles } => json!({
            "type": "flex",
            "altText": alt_text,
            "contents": {
                "type": "carousel",
                "contents": bubbles.iter().map(render_bubble).collect::<Vec<_>>(),
            },
        }),
        Message::Sticker {
            package_id,
            sticker_id,
            quote_token,
        } => {
            let mut value = json!({ "type": "sticker", "packageId": package_id, "stickerId": sticker_id });
            if let Some(token) = quote_token {
                value["quoteToken"] = json!(token);
            }
            value
        }
    }
}

/// Body of a reply API call.
pub fn reply_body(reply_token: &str, messages: &[Message]) -> Value {
    json!({
        "replyToken": reply_token,
        "messages": messages.iter().map(render_message).collect::<Vec<_>>(),
    })
}

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("reply request failed: {0}")]
    Transport(String),

    #[error("reply API returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Sends reply messages back to the platform.
#[async_trait]
pub trait Replier: Send + Sync {
    async fn reply(&self, reply_token: &str, messages: &[Message]) -> Result<(), ReplyError>;
}

/// Reply API client.
pub struct LineReplyClient {
    client: reqwest::Client,
    endpoint: String,
    access_token: String,
}

impl LineReplyClient {
    pub fn new(api_base: &str, access_token: impl Into<String>) -> Result<Self, ReplyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ReplyError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/v2/bot/message/reply", api_base.trim_end_matches('/')),
            access_token: access_token.into(),
        })
    }
}

#[async_trait]
impl Replier for LineReplyClient {
    async fn reply(&self, reply_token: &str, messages: &[Message]) -> Result<(), ReplyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.access_token)
            .json(&reply_body(reply_token, messages))
            .send()
            .await
            .map_err(|e| ReplyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReplyError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_verification() {
        let body = br#"{"events":[]}"#;
        let signature = sign("secret", body).unwrap();
        assert!(verify_signature("secret", body, &signature));
        assert!(!verify_signature("other", body, &signature));
        assert!(!verify_signature("secret", b"tampered", &signature));
        assert!(!verify_signature("secret", body, "not base64!"));
    }

    #[test]
    fn test_text_event_with_mention() {
        let envelope: WebhookEnvelope = serde_json::from_str(
            r#"{
                "destination": "Ubot",
                "events": [{
                    "type": "message",
                    "replyToken": "r1",
                    "source": {"type": "group", "groupId": "G1", "userId": "U1"},
                    "message": {
                        "type": "text", "id": "1", "text": "@bot 課程 微積分",
                        "quoteToken": "q1",
                        "mention": {"mentionees": [{"index": 0, "length": 4, "type": "user", "isSelf": true}]}
                    }
                }]
            }"#,
        )
        .unwrap();

        let event = envelope.events[0].to_event().unwrap();
        assert_eq!(event.source.kind, ChatKind::Group);
        assert_eq!(event.source.chat_id, "G1");
        assert_eq!(
            event.input,
            EventInput::Text {
                text: "@bot 課程 微積分".to_string(),
                mentions: vec![Mention {
                    index: 0,
                    length: 4,
                    is_self: true
                }],
                quote_token: Some("q1".to_string()),
            }
        );
    }

    #[test]
    fn test_unhandled_events_are_skipped() {
        let envelope: WebhookEnvelope = serde_json::from_str(
            r#"{"events": [
                {"type": "unfollow", "source": {"type": "user", "userId": "U1"}},
                {"type": "message", "replyToken": "r", "source": {"type": "user", "userId": "U1"},
                 "message": {"type": "image", "id": "2"}},
                {"type": "postback", "replyToken": "r", "source": {"type": "room", "roomId": "R1"},
                 "postback": {"data": "{}"}}
            ]}"#,
        )
        .unwrap();

        let events: Vec<_> = envelope.events.iter().filter_map(|e| e.to_event()).collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source.kind, ChatKind::Room);
        assert_eq!(events[0].source.user_id, None);
    }

    #[test]
    fn test_render_text_with_quick_reply_and_quote() {
        let mut message = Message::text("查詢逾時了").with_quick_replies(vec![Action::message("重試", "課程 微積分")]);
        message.set_quote_token("q-1");

        let value = render_message(&message);
        assert_eq!(value["type"], "text");
        assert_eq!(value["quoteToken"], "q-1");
        assert_eq!(value["quickReply"]["items"][0]["action"]["type"], "message");
        assert_eq!(value["quickReply"]["items"][0]["action"]["text"], "課程 微積分");
    }

    #[test]
    fn test_render_carousel() {
        let message = Message::Carousel {
            alt_text: "課程查詢結果".to_string(),
            bubbles: vec![
                Bubble::new("微積分")
                    .subtitle("1131U0001")
                    .line("教師：張三")
                    .action(Action::uri("撥打", "tel:0223456789")),
                Bubble::new("線性代數"),
            ],
        };

        let value = render_message(&message);
        assert_eq!(value["type"], "flex");
        assert_eq!(value["altText"], "課程查詢結果");
        let bubbles = value["contents"]["contents"].as_array().unwrap();
        assert_eq!(bubbles.len(), 2);
        assert_eq!(bubbles[0]["body"]["contents"].as_array().unwrap().len(), 3);
        assert_eq!(bubbles[0]["footer"]["contents"][0]["action"]["uri"], "tel:0223456789");
        assert!(bubbles[1].get("footer").is_none());
    }

    #[test]
    fn test_reply_body() {
        let body = reply_body("r1", &[Message::sticker("446", "1988")]);
        assert_eq!(body["replyToken"], "r1");
        assert_eq!(body["messages"][0]["packageId"], "446");
        assert!(body["messages"][0].get("quoteToken").is_none());
    }
}
