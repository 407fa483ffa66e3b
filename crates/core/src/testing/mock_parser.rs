//! Mock NLU parser and sticker source for testing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::nlu::{IntentParser, NluError, NluOutcome, ParsedIntent};
use crate::processor::StickerSource;
use crate::reply::Message;

enum Script {
    Disabled,
    Outcome(NluOutcome),
    Fail(Mutex<Option<NluError>>),
}

/// Intent parser returning a scripted outcome and counting calls.
pub struct MockIntentParser {
    script: Script,
    expansions: Vec<String>,
    calls: AtomicUsize,
}

impl MockIntentParser {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            expansions: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::with_script(Script::Disabled)
    }

    pub fn direct_reply(text: &str) -> Self {
        Self::with_script(Script::Outcome(NluOutcome::DirectReply(text.to_string())))
    }

    pub fn intent(module: &str, intent: &str, params: &[(&str, &str)]) -> Self {
        Self::with_script(Script::Outcome(NluOutcome::Intent(ParsedIntent {
            module: module.to_string(),
            intent: intent.to_string(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })))
    }

    /// Fails the first parse with `error`, later ones as invalid output.
    pub fn failing(error: NluError) -> Self {
        Self::with_script(Script::Fail(Mutex::new(Some(error))))
    }

    /// Phrasings returned by `expand_query`.
    pub fn with_expansions(mut self, expansions: &[&str]) -> Self {
        self.expansions = expansions.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Number of `parse` and `expand_query` calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IntentParser for MockIntentParser {
    fn is_enabled(&self) -> bool {
        !matches!(self.script, Script::Disabled)
    }

    async fn parse(&self, _ctx: &RequestContext, _text: &str) -> Result<NluOutcome, NluError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Disabled => Err(NluError::Disabled),
            Script::Outcome(outcome) => Ok(outcome.clone()),
            Script::Fail(error) => Err(error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .unwrap_or_else(|| NluError::InvalidOutput("scripted failure".into()))),
        }
    }

    async fn expand_query(
        &self,
        _ctx: &RequestContext,
        _query: &str,
    ) -> Result<Vec<String>, NluError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Disabled => Err(NluError::Disabled),
            _ => Ok(self.expansions.clone()),
        }
    }
}

/// Sticker source that always answers the same sticker and counts picks.
#[derive(Debug, Default)]
pub struct RecordingStickers {
    picks: AtomicUsize,
}

impl RecordingStickers {
    pub fn picks(&self) -> usize {
        self.picks.load(Ordering::SeqCst)
    }
}

impl StickerSource for RecordingStickers {
    fn pick(&self) -> Option<Message> {
        self.picks.fetch_add(1, Ordering::SeqCst);
        Some(Message::sticker("446", "1988"))
    }
}
