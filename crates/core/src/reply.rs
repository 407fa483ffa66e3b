//! Platform-neutral reply model.
//!
//! Handlers build [`Message`] values; the server crate maps them onto the
//! messaging platform's wire format. Everything here counts text in
//! codepoints, never bytes.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::EnvelopeConfig;
use crate::postback::{Postback, PostbackError};

/// Longest action label the platform renders.
pub const MAX_LABEL_CHARS: usize = 20;

const ELLIPSIS: char = '…';

/// A button or quick-reply action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Sends structured data back to the bot.
    Postback {
        label: String,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_text: Option<String>,
    },
    /// Sends `text` as if the user typed it.
    Message { label: String, text: String },
    /// Opens a link (`tel:` and `mailto:` included).
    Uri { label: String, uri: String },
}

impl Action {
    /// Postback action; fails if the encoded payload is over `max_bytes`.
    pub fn postback(
        label: &str,
        postback: &Postback,
        max_bytes: usize,
    ) -> Result<Self, PostbackError> {
        Ok(Action::Postback {
            label: truncate_chars(label, MAX_LABEL_CHARS),
            data: postback.encode(max_bytes)?,
            display_text: Some(label.to_string()),
        })
    }

    pub fn message(label: &str, text: impl Into<String>) -> Self {
        Action::Message {
            label: truncate_chars(label, MAX_LABEL_CHARS),
            text: text.into(),
        }
    }

    pub fn uri(label: &str, uri: impl Into<String>) -> Self {
        Action::Uri {
            label: truncate_chars(label, MAX_LABEL_CHARS),
            uri: uri.into(),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Action::Postback { label, .. } | Action::Message { label, .. } | Action::Uri { label, .. } => {
                label
            }
        }
    }
}

/// One card of a carousel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bubble {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    /// Body lines, rendered in order.
    #[serde(default)]
    pub lines: Vec<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl Bubble {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn subtitle(mut self, subtitle: impl Into<String>) -> Self {
        self.subtitle = Some(subtitle.into());
        self
    }

    /// Append a `label: value` line when `value` is present.
    pub fn field(mut self, label: &str, value: Option<&str>) -> Self {
        if let Some(v) = value.filter(|v| !v.is_empty()) {
            self.lines.push(format!("{}：{}", label, v));
        }
        self
    }

    pub fn line(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }
}

/// An outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        quick_replies: Vec<Action>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quote_token: Option<String>,
    },
    Carousel {
        alt_text: String,
        bubbles: Vec<Bubble>,
    },
    Sticker {
        package_id: String,
        sticker_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quote_token: Option<String>,
    },
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Message::Text {
            text: text.into(),
            quick_replies: Vec::new(),
            quote_token: None,
        }
    }

    pub fn sticker(package_id: impl Into<String>, sticker_id: impl Into<String>) -> Self {
        Message::Sticker {
            package_id: package_id.into(),
            sticker_id: sticker_id.into(),
            quote_token: None,
        }
    }

    /// Attach quick replies to a text message; other kinds are unchanged.
    pub fn with_quick_replies(mut self, actions: Vec<Action>) -> Self {
        if let Message::Text { quick_replies, .. } = &mut self {
            *quick_replies = actions;
        }
        self
    }

    /// Text and sticker messages can quote the user's message.
    pub fn supports_quote(&self) -> bool {
        matches!(self, Message::Text { .. } | Message::Sticker { .. })
    }

    /// Set the quote token if this kind supports quoting.
    pub fn set_quote_token(&mut self, token: &str) -> bool {
        match self {
            Message::Text { quote_token, .. } | Message::Sticker { quote_token, .. } => {
                *quote_token = Some(token.to_string());
                true
            }
            Message::Carousel { .. } => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// Truncate to `max` codepoints, marking the cut with an ellipsis.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut out: String = s.chars().take(max - 1).collect();
    out.push(ELLIPSIS);
    out
}

/// Pack whole lines into chunks of at most `max_chars` codepoints. A line
/// longer than that is split across consecutive chunks. Each chunk carries
/// the number of source lines completed by its end.
pub fn chunk_lines(lines: &[String], max_chars: usize) -> Vec<(String, usize)> {
    let mut chunks: Vec<(String, usize)> = Vec::new();
    if max_chars == 0 {
        return chunks;
    }
    let mut open: Option<(String, usize)> = None;

    for (i, line) in lines.iter().enumerate() {
        let line_len = line.chars().count();
        if let Some((text, len)) = open.as_mut() {
            if *len + 1 + line_len <= max_chars {
                text.push('\n');
                text.push_str(line);
                *len += 1 + line_len;
                continue;
            }
        }
        if let Some((text, _)) = open.take() {
            chunks.push((text, i));
        }

        if line_len <= max_chars {
            open = Some((line.clone(), line_len));
        } else {
            let chars: Vec<char> = line.chars().collect();
            let pieces = chars.chunks(max_chars).count();
            for (n, piece) in chars.chunks(max_chars).enumerate() {
                let done = if n + 1 == pieces { i + 1 } else { i };
                chunks.push((piece.iter().collect(), done));
            }
        }
    }
    if let Some((text, _)) = open {
        chunks.push((text, lines.len()));
    }
    chunks
}

/// Group bubbles into carousels of at most `max_bubbles` each.
pub fn carousels(alt_text: &str, bubbles: Vec<Bubble>, max_bubbles: usize) -> Vec<Message> {
    let per = max_bubbles.max(1);
    let mut out = Vec::new();
    let mut iter = bubbles.into_iter().peekable();
    while iter.peek().is_some() {
        let chunk: Vec<Bubble> = iter.by_ref().take(per).collect();
        out.push(Message::Carousel {
            alt_text: alt_text.to_string(),
            bubbles: chunk,
        });
    }
    out
}

/// Note appended when only part of a result set is shown.
pub fn truncation_note(shown: usize, total: usize) -> Message {
    Message::text(format!(
        "結果過多，僅顯示前 {} 筆（共 {} 筆，省略 {} 筆）。請輸入更精確的關鍵字。",
        shown,
        total,
        total.saturating_sub(shown)
    ))
}

/// Render a result set as carousels within the envelope.
///
/// `total` is the size of the full result set, which may exceed
/// `bubbles.len()` when the caller already applied a domain cap. When
/// anything is left out, the last message is a [`truncation_note`].
pub fn bubble_reply(
    alt_text: &str,
    bubbles: Vec<Bubble>,
    total: usize,
    envelope: &EnvelopeConfig,
) -> Vec<Message> {
    let per = envelope.max_bubbles.max(1);
    let total = total.max(bubbles.len());
    let full_capacity = envelope.max_messages * per;
    let capacity = if total > bubbles.len() || total > full_capacity {
        envelope.max_messages.saturating_sub(1) * per
    } else {
        full_capacity
    };

    let mut bubbles = bubbles;
    bubbles.truncate(capacity);
    let shown = bubbles.len();
    let mut messages = carousels(alt_text, bubbles, per);
    if shown < total {
        messages.push(truncation_note(shown, total));
    }
    messages
}

/// Render lines as chunked text messages within the envelope.
pub fn text_reply(lines: &[String], total: usize, envelope: &EnvelopeConfig) -> Vec<Message> {
    let total = total.max(lines.len());
    let mut chunks = chunk_lines(lines, envelope.max_text_chars);
    let truncated = total > lines.len() || chunks.len() > envelope.max_messages;
    if truncated {
        chunks.truncate(envelope.max_messages.saturating_sub(1));
    }
    let shown_lines = chunks.last().map_or(0, |(_, done)| *done);
    let mut messages: Vec<Message> = chunks
        .into_iter()
        .map(|(text, _)| Message::text(text))
        .collect();
    if truncated {
        messages.push(truncation_note(shown_lines, total));
    }
    messages
}

/// Final pass before sending: clip long texts and drop messages beyond the
/// per-reply limit.
pub fn enforce_envelope(mut messages: Vec<Message>, envelope: &EnvelopeConfig) -> Vec<Message> {
    for message in &mut messages {
        match message {
            Message::Text { text, .. } => {
                if text.chars().count() > envelope.max_text_chars {
                    *text = truncate_chars(text, envelope.max_text_chars);
                }
            }
            Message::Carousel { bubbles, .. } => {
                if bubbles.len() > envelope.max_bubbles {
                    bubbles.truncate(envelope.max_bubbles);
                }
            }
            Message::Sticker { .. } => {}
        }
    }
    if messages.len() > envelope.max_messages {
        warn!(
            count = messages.len(),
            limit = envelope.max_messages,
            "Dropping messages beyond envelope limit"
        );
        messages.truncate(envelope.max_messages);
    }
    messages
}
