//! Platform-neutral inbound events.

use serde::{Deserialize, Serialize};

/// Where a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    /// One-to-one chat with the bot.
    Personal,
    Group,
    Room,
}

impl ChatKind {
    pub fn is_personal(&self) -> bool {
        matches!(self, ChatKind::Personal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Personal => "personal",
            ChatKind::Group => "group",
            ChatKind::Room => "room",
        }
    }
}

/// An `@` mention span, measured in codepoints of the original text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mention {
    pub index: usize,
    pub length: usize,
    /// The mention targets this bot.
    pub is_self: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSource {
    pub kind: ChatKind,
    /// Group, room or user id; the admission key.
    pub chat_id: String,
    pub user_id: Option<String>,
}

impl EventSource {
    pub fn personal(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            kind: ChatKind::Personal,
            chat_id: user_id.clone(),
            user_id: Some(user_id),
        }
    }

    pub fn group(group_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            kind: ChatKind::Group,
            chat_id: group_id.into(),
            user_id: Some(user_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventInput {
    Text {
        text: String,
        mentions: Vec<Mention>,
        quote_token: Option<String>,
    },
    Sticker {
        quote_token: Option<String>,
    },
    Postback {
        data: String,
    },
    /// The user added the bot as a friend.
    Follow,
    /// The bot was added to a group or room.
    Join,
}

impl EventInput {
    pub fn text(text: impl Into<String>) -> Self {
        EventInput::Text {
            text: text.into(),
            mentions: Vec::new(),
            quote_token: None,
        }
    }

    /// Label for the `webhook_events` metric.
    pub fn kind(&self) -> &'static str {
        match self {
            EventInput::Text { .. } => "text",
            EventInput::Sticker { .. } => "sticker",
            EventInput::Postback { .. } => "postback",
            EventInput::Follow => "follow",
            EventInput::Join => "join",
        }
    }

    pub fn quote_token(&self) -> Option<&str> {
        match self {
            EventInput::Text { quote_token, .. } | EventInput::Sticker { quote_token } => {
                quote_token.as_deref()
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub source: EventSource,
    pub input: EventInput,
}

impl Event {
    pub fn new(source: EventSource, input: EventInput) -> Self {
        Self { source, input }
    }
}
