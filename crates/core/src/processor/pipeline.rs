//! The request pipeline: admission, sanitisation, dispatch, NLU fallback
//! and error-to-reply mapping.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, warn, Instrument};

use super::config::{is_help_keyword, ProcessorConfig};
use super::sanitize::{sanitize, sanitize_postback, strip_mentions};
use super::stickers::StickerSource;
use super::types::{Event, EventInput, EventSource, Mention};
use crate::adapters::AdapterError;
use crate::context::{ContextError, RequestContext, TraceFields};
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::fetcher::FetchError;
use crate::handlers::HandlerError;
use crate::metrics::Metrics;
use crate::nlu::{IntentParser, NluError, NluOutcome};
use crate::ratelimit::{Admission, KeyedLimiter};
use crate::reply::{enforce_envelope, Action, Message};

/// Replies of one event plus the classification recorded for it.
#[derive(Debug)]
struct Outcome {
    classification: &'static str,
    messages: Vec<Message>,
}

impl Outcome {
    fn reply(classification: &'static str, messages: Vec<Message>) -> Self {
        Self {
            classification,
            messages,
        }
    }

    fn silent(classification: &'static str) -> Self {
        Self::reply(classification, Vec::new())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn example_actions() -> Vec<Action> {
    vec![
        Action::message("查課程", "課程 微積分"),
        Action::message("找聯絡人", "聯絡 資訊中心"),
        Action::message("查學程", "學程"),
        Action::message("緊急電話", "緊急"),
    ]
}

/// Processes platform-neutral events into replies.
pub struct Processor {
    config: ProcessorConfig,
    dispatcher: Arc<Dispatcher>,
    parser: Arc<dyn IntentParser>,
    chat_limiter: Arc<KeyedLimiter>,
    llm_limiter: Arc<KeyedLimiter>,
    stickers: Arc<dyn StickerSource>,
    metrics: Arc<Metrics>,
}

impl Processor {
    pub fn new(
        config: ProcessorConfig,
        dispatcher: Arc<Dispatcher>,
        parser: Arc<dyn IntentParser>,
        chat_limiter: Arc<KeyedLimiter>,
        llm_limiter: Arc<KeyedLimiter>,
        stickers: Arc<dyn StickerSource>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            parser,
            chat_limiter,
            llm_limiter,
            stickers,
            metrics,
        }
    }

    /// Handle one event. Never fails: every problem becomes a reply (or
    /// silence) and a `pipeline_outcomes` increment.
    pub async fn process(&self, event: Event) -> Vec<Message> {
        let kind = event.input.kind();
        self.metrics.webhook_events.with_label_values(&[kind]).inc();

        let quote_token = event.input.quote_token().map(str::to_string);
        let (ctx, _cancel) = RequestContext::with_fields(TraceFields {
            chat_id: Some(event.source.chat_id.clone()),
            user_id: event.source.user_id.clone(),
            quote_token: quote_token.clone(),
        });
        let span = ctx.span(kind);

        let outcome = AssertUnwindSafe(self.run(&ctx, &event))
            .catch_unwind()
            .instrument(span)
            .await
            .unwrap_or_else(|panic| {
                error!(
                    chat_id = %event.source.chat_id,
                    panic = %panic_message(panic.as_ref()),
                    backtrace = %std::backtrace::Backtrace::force_capture(),
                    "Handler panicked"
                );
                Outcome::reply("panic", vec![self.failure_message()])
            });

        self.metrics
            .pipeline_outcomes
            .with_label_values(&[outcome.classification])
            .inc();
        debug!(
            classification = outcome.classification,
            replies = outcome.messages.len(),
            "Event processed"
        );

        let mut messages = enforce_envelope(outcome.messages, &self.config.envelope);
        if let (Some(token), Some(first)) = (quote_token.as_deref(), messages.first_mut()) {
            first.set_quote_token(token);
        }
        messages
    }

    async fn run(&self, ctx: &RequestContext, event: &Event) -> Outcome {
        match &event.input {
            EventInput::Text { text, mentions, .. } => {
                self.handle_text(ctx, &event.source, text, mentions).await
            }
            EventInput::Sticker { .. } => self.handle_sticker(&event.source).await,
            EventInput::Postback { data } => self.handle_postback(ctx, data).await,
            EventInput::Follow | EventInput::Join => {
                info!(kind = event.input.kind(), chat_id = %event.source.chat_id, "Welcome");
                Outcome::reply("welcome", vec![self.welcome_message()])
            }
        }
    }

    async fn admit(&self, source: &EventSource) -> Option<Outcome> {
        match self.chat_limiter.allow(&source.chat_id).await {
            Admission::Allowed => None,
            Admission::Denied(layer) => {
                self.metrics
                    .admission_denials
                    .with_label_values(&[self.chat_limiter.name(), layer.as_str()])
                    .inc();
                debug!(chat_id = %source.chat_id, "Chat admission denied");
                Some(if source.kind.is_personal() {
                    Outcome::reply(
                        "rate_limited",
                        vec![Message::text("訊息太頻繁了，請稍等幾秒再試。")],
                    )
                } else {
                    Outcome::silent("rate_limited")
                })
            }
        }
    }

    async fn handle_sticker(&self, source: &EventSource) -> Outcome {
        if let Some(denied) = self.admit(source).await {
            return denied;
        }
        if !source.kind.is_personal() {
            return Outcome::silent("ignored");
        }
        match self.stickers.pick() {
            Some(sticker) => Outcome::reply("sticker", vec![sticker]),
            None => Outcome::silent("sticker"),
        }
    }

    async fn handle_text(
        &self,
        ctx: &RequestContext,
        source: &EventSource,
        original: &str,
        mentions: &[Mention],
    ) -> Outcome {
        if let Some(denied) = self.admit(source).await {
            return denied;
        }
        let personal = source.kind.is_personal();
        let mentioned = mentions.iter().any(|m| m.is_self);
        let may_reply = personal || mentioned;

        if original.chars().count() > self.config.max_input_chars {
            return if may_reply {
                Outcome::reply(
                    "invalid_input",
                    vec![Message::text(format!(
                        "訊息太長了，請精簡到 {} 字以內。",
                        self.config.max_input_chars
                    ))],
                )
            } else {
                Outcome::silent("invalid_input")
            };
        }

        let text = sanitize(original);
        if text.is_empty() {
            return if may_reply {
                Outcome::reply("invalid_input", vec![self.help_message()])
            } else {
                Outcome::silent("invalid_input")
            };
        }
        if is_help_keyword(&text) {
            return Outcome::reply("help", vec![self.help_message()]);
        }

        let pctx = ctx.with_timeout(self.config.webhook_timeout);
        match self.dispatcher.dispatch_message(&pctx, &text).await {
            Ok(messages) if !messages.is_empty() => return Outcome::reply("ok", messages),
            Ok(_) => {}
            Err(e) => return self.dispatch_failure(e, &text),
        }

        if !personal && !mentioned {
            return Outcome::silent("ignored");
        }

        let text = if mentions.is_empty() {
            text
        } else {
            let stripped = sanitize(&strip_mentions(original, mentions));
            if stripped.is_empty() || is_help_keyword(&stripped) {
                return Outcome::reply("help", vec![self.help_message()]);
            }
            if stripped != text {
                match self.dispatcher.dispatch_message(&pctx, &stripped).await {
                    Ok(messages) if !messages.is_empty() => {
                        return Outcome::reply("ok", messages)
                    }
                    Ok(_) => {}
                    Err(e) => return self.dispatch_failure(e, &stripped),
                }
            }
            stripped
        };

        self.natural_language(&pctx, source, &text).await
    }

    async fn natural_language(
        &self,
        ctx: &RequestContext,
        source: &EventSource,
        text: &str,
    ) -> Outcome {
        if !self.parser.is_enabled() {
            return Outcome::reply(
                "keyword_help",
                vec![self.contextual_help("我看不懂這則訊息，請用關鍵字查詢：")],
            );
        }

        if let Admission::Denied(layer) = self.llm_limiter.allow(&source.chat_id).await {
            self.metrics
                .admission_denials
                .with_label_values(&[self.llm_limiter.name(), layer.as_str()])
                .inc();
            return if source.kind.is_personal() {
                Outcome::reply(
                    "llm_rate_limited",
                    vec![self.contextual_help(
                        "智慧問答的使用次數已達上限，請改用關鍵字查詢：",
                    )],
                )
            } else {
                Outcome::silent("llm_rate_limited")
            };
        }

        match self.parser.parse(ctx, text).await {
            Ok(NluOutcome::DirectReply(message)) => {
                Outcome::reply("direct_reply", vec![Message::text(message)])
            }
            Ok(NluOutcome::Intent(intent)) => {
                info!(module = %intent.module, intent = %intent.intent, "NLU dispatch");
                match self
                    .dispatcher
                    .dispatch_intent(ctx, &intent.module, &intent.intent, &intent.params)
                    .await
                {
                    Ok(messages) if !messages.is_empty() => Outcome::reply("nlu_ok", messages),
                    Ok(_) => Outcome::reply(
                        "nlu_empty",
                        vec![self.contextual_help("我理解了您的問題，但沒有找到結果。可以試試：")],
                    ),
                    Err(e) => self.nlu_dispatch_failure(e, text),
                }
            }
            Err(e) => self.nlu_failure(e),
        }
    }

    async fn handle_postback(&self, ctx: &RequestContext, data: &str) -> Outcome {
        if data.len() > self.config.envelope.max_postback_bytes {
            warn!(len = data.len(), "Oversized postback payload");
            return Outcome::reply("invalid_input", vec![self.expired_button_message()]);
        }
        let data = sanitize_postback(data);
        if data.is_empty() {
            return Outcome::reply("invalid_input", vec![self.expired_button_message()]);
        }
        if is_help_keyword(&data) {
            return Outcome::reply("help", vec![self.help_message()]);
        }

        let pctx = ctx.with_timeout(self.config.webhook_timeout);
        match self.dispatcher.dispatch_postback(&pctx, &data).await {
            Ok(messages) if !messages.is_empty() => Outcome::reply("ok", messages),
            Ok(_) => Outcome::reply("unknown_postback", vec![self.expired_button_message()]),
            Err(e @ (DispatchError::Postback(_) | DispatchError::UnknownModule(_))) => {
                debug!(error = %e, "Unroutable postback");
                Outcome::reply(e.classification(), vec![self.expired_button_message()])
            }
            Err(e) => self.dispatch_failure(e, ""),
        }
    }

    /// User-visible reply for a failed keyword or postback dispatch.
    fn dispatch_failure(&self, e: DispatchError, retry_text: &str) -> Outcome {
        let classification = e.classification();
        let message = match &e {
            DispatchError::Handler(HandlerError::Context(_))
            | DispatchError::Handler(HandlerError::Upstream(AdapterError::Fetch(
                FetchError::Timeout | FetchError::Canceled,
            ))) => {
                warn!(error = %e, "Request timed out");
                self.with_retry(Message::text("查詢逾時了，請稍後再試一次。"), retry_text)
            }
            DispatchError::Handler(HandlerError::Upstream(_)) => {
                warn!(error = %e, "Upstream unavailable");
                self.with_retry(
                    Message::text("資料來源暫時無法連線，請稍後再試。"),
                    retry_text,
                )
            }
            DispatchError::UnknownIntent { .. }
            | DispatchError::MissingParameter(_)
            | DispatchError::Handler(HandlerError::InvalidParameter { .. }) => {
                self.contextual_help("查詢格式不太對，可以參考：")
            }
            DispatchError::Postback(_) | DispatchError::UnknownModule(_) => {
                self.expired_button_message()
            }
            _ => {
                error!(error = %e, "Dispatch failed");
                self.failure_message()
            }
        };
        Outcome::reply(classification, vec![message])
    }

    fn nlu_dispatch_failure(&self, e: DispatchError, text: &str) -> Outcome {
        match e {
            DispatchError::UnknownModule(_)
            | DispatchError::UnknownIntent { .. }
            | DispatchError::MissingParameter(_)
            | DispatchError::Handler(HandlerError::InvalidParameter { .. }) => {
                warn!(error = %e, "NLU intent could not be dispatched");
                Outcome::reply(
                    "nlu_dispatch_failed",
                    vec![self.contextual_help("我大概知道您想查什麼，但缺少一些資訊。可以試試：")],
                )
            }
            other => self.dispatch_failure(other, text),
        }
    }

    fn nlu_failure(&self, e: NluError) -> Outcome {
        let (classification, intro) = match &e {
            NluError::Context(ContextError::DeadlineExceeded)
            | NluError::Llm(crate::nlu::LlmError::Timeout(_)) => {
                ("nlu_timeout", "智慧問答回應逾時，請改用關鍵字查詢：")
            }
            NluError::Llm(_) | NluError::Disabled | NluError::Context(_) => {
                ("nlu_unavailable", "智慧問答暫時無法使用，請改用關鍵字查詢：")
            }
            NluError::UnknownFunction(_) | NluError::InvalidOutput(_) => {
                ("nlu_not_understood", "我看不懂這則訊息，請用關鍵字查詢：")
            }
        };
        warn!(error = %e, classification, "NLU failed");
        Outcome::reply(classification, vec![self.contextual_help(intro)])
    }

    fn with_retry(&self, message: Message, retry_text: &str) -> Message {
        if retry_text.is_empty() {
            message
        } else {
            message.with_quick_replies(vec![Action::message("重試", retry_text)])
        }
    }

    fn help_message(&self) -> Message {
        Message::text(format!(
            "我是{}，可以幫你查詢：\n\
             ・課程：課程 微積分、課程 U0001、課程 110 微積分\n\
             ・找課：找課 想學的主題\n\
             ・聯絡資訊：聯絡 資訊中心、緊急\n\
             ・學生：學號 411285001、學生 王小明、學年 112\n\
             ・學程：學程、學程 人工智慧",
            self.config.bot_name
        ))
        .with_quick_replies(example_actions())
    }

    fn contextual_help(&self, intro: &str) -> Message {
        Message::text(format!(
            "{}\n・課程 課名或老師\n・聯絡 單位或姓名\n・學程 名稱\n・學號 或 學生 姓名",
            intro
        ))
        .with_quick_replies(example_actions())
    }

    fn welcome_message(&self) -> Message {
        Message::text(format!(
            "嗨！我是{}。輸入關鍵字就能查課程、聯絡資訊、學生與學程。輸入「說明」看完整用法。",
            self.config.bot_name
        ))
        .with_quick_replies(example_actions())
    }

    fn expired_button_message(&self) -> Message {
        Message::text("這個按鈕已失效，請重新查詢。")
    }

    fn failure_message(&self) -> Message {
        Message::text("系統發生錯誤，請稍後再試。")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixtures, MockIntentParser, RecordingStickers};

    fn text_event(source: EventSource, text: &str) -> Event {
        Event::new(source, EventInput::text(text))
    }

    #[tokio::test]
    async fn test_help_keyword_short_circuits() {
        let env = fixtures::env();
        let processor = fixtures::processor(&env, Arc::new(MockIntentParser::disabled()));
        let reply = processor
            .process(text_event(EventSource::personal("U1"), "說明"))
            .await;
        assert!(reply[0].as_text().unwrap().contains("課程"));
        assert_eq!(env.fetch.call_count(), 0);
    }

    #[tokio::test]
    async fn test_over_length_input_rejected() {
        let env = fixtures::env();
        let processor = fixtures::processor(&env, Arc::new(MockIntentParser::disabled()));
        let long = "課".repeat(201);
        let reply = processor
            .process(text_event(EventSource::personal("U1"), &long))
            .await;
        assert!(reply[0].as_text().unwrap().contains("200"));
    }

    #[tokio::test]
    async fn test_unclaimed_group_text_is_ignored() {
        let env = fixtures::env();
        let parser = Arc::new(MockIntentParser::direct_reply("hi"));
        let processor = fixtures::processor(&env, parser.clone());
        let reply = processor
            .process(text_event(EventSource::group("G1", "U1"), "今天天氣真好"))
            .await;
        assert!(reply.is_empty());
        assert_eq!(parser.calls(), 0);
    }

    #[tokio::test]
    async fn test_keyword_mode_help_without_nlu() {
        let env = fixtures::env();
        let processor = fixtures::processor(&env, Arc::new(MockIntentParser::disabled()));
        let reply = processor
            .process(text_event(EventSource::personal("U1"), "今天天氣真好"))
            .await;
        assert!(reply[0].as_text().unwrap().contains("關鍵字"));
    }

    #[tokio::test]
    async fn test_direct_reply_and_quote_token() {
        let env = fixtures::env();
        let processor = fixtures::processor(&env, Arc::new(MockIntentParser::direct_reply("你好！")));
        let event = Event::new(
            EventSource::personal("U1"),
            EventInput::Text {
                text: "哈囉".to_string(),
                mentions: Vec::new(),
                quote_token: Some("q-1".to_string()),
            },
        );
        let reply = processor.process(event).await;
        assert_eq!(reply.len(), 1);
        assert!(matches!(
            &reply[0],
            Message::Text { text, quote_token: Some(q), .. } if text == "你好！" && q == "q-1"
        ));
    }

    #[tokio::test]
    async fn test_nlu_failure_gives_contextual_help() {
        let env = fixtures::env();
        let processor = fixtures::processor(
            &env,
            Arc::new(MockIntentParser::failing(NluError::InvalidOutput("bad".into()))),
        );
        let reply = processor
            .process(text_event(EventSource::personal("U1"), "嗯嗯嗯"))
            .await;
        assert!(reply[0].as_text().unwrap().starts_with("我看不懂"));
    }

    #[tokio::test]
    async fn test_nlu_intent_missing_parameter() {
        let env = fixtures::env();
        let processor = fixtures::processor(
            &env,
            Arc::new(MockIntentParser::intent("course", "search", &[])),
        );
        let reply = processor
            .process(text_event(EventSource::personal("U1"), "我想查一門課"))
            .await;
        assert!(reply[0].as_text().unwrap().contains("缺少"));
    }

    #[tokio::test]
    async fn test_stickers_only_in_personal_chats() {
        let env = fixtures::env();
        let stickers = Arc::new(RecordingStickers::default());
        let processor = fixtures::processor_with_stickers(
            &env,
            Arc::new(MockIntentParser::disabled()),
            stickers.clone(),
        );
        let sticker = |source| Event::new(source, EventInput::Sticker { quote_token: None });

        let reply = processor.process(sticker(EventSource::personal("U1"))).await;
        assert!(matches!(reply[0], Message::Sticker { .. }));
        let reply = processor.process(sticker(EventSource::group("G1", "U1"))).await;
        assert!(reply.is_empty());
        assert_eq!(stickers.picks(), 1);
    }

    #[tokio::test]
    async fn test_invalid_postbacks() {
        let env = fixtures::env();
        let processor = fixtures::processor(&env, Arc::new(MockIntentParser::disabled()));
        let source = EventSource::personal("U1");

        for data in [
            "course$detail$1131U0001".to_string(),
            "x".repeat(400),
            "{\"m\":\"weather\",\"a\":\"today\"}".to_string(),
        ] {
            let reply = processor
                .process(Event::new(source.clone(), EventInput::Postback { data }))
                .await;
            assert_eq!(reply[0].as_text(), Some("這個按鈕已失效，請重新查詢。"));
        }
    }

    #[tokio::test]
    async fn test_follow_gets_welcome() {
        let env = fixtures::env();
        let processor = fixtures::processor(&env, Arc::new(MockIntentParser::disabled()));
        let reply = processor
            .process(Event::new(EventSource::personal("U1"), EventInput::Follow))
            .await;
        assert!(reply[0].as_text().unwrap().starts_with("嗨"));
    }

    #[tokio::test]
    async fn test_upstream_failure_offers_retry() {
        let env = fixtures::env();
        env.fetch.fail(
            "sea",
            "/contact/search",
            FetchError::AllMirrorsFailed("sea".into()),
        );
        let processor = fixtures::processor(&env, Arc::new(MockIntentParser::disabled()));
        let reply = processor
            .process(text_event(EventSource::personal("U1"), "聯絡 王小明"))
            .await;
        let Message::Text { text, quick_replies, .. } = &reply[0] else {
            panic!("expected text");
        };
        assert!(text.contains("資料來源"));
        assert_eq!(quick_replies[0].label(), "重試");
    }

    /// Answers every text, but only after a minute.
    struct Stuck;

    #[async_trait::async_trait]
    impl crate::handlers::Handler for Stuck {
        fn module(&self) -> &'static str {
            "stuck"
        }

        fn can_handle(&self, _text: &str) -> bool {
            true
        }

        async fn handle_message(
            &self,
            _ctx: &RequestContext,
            _text: &str,
        ) -> Result<Vec<Message>, HandlerError> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(vec![Message::text("late")])
        }

        async fn handle_postback(
            &self,
            _ctx: &RequestContext,
            _postback: &crate::postback::Postback,
        ) -> Result<Vec<Message>, HandlerError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_webhook_deadline_bounds_slow_handler() {
        use crate::config::LimitsConfig;
        use crate::ratelimit::KeyedLimiterConfig;

        let env = fixtures::env();
        let dispatcher = Dispatcher::new(env.metrics.clone())
            .with(Arc::new(Stuck))
            .unwrap();
        let limits = LimitsConfig::default();
        let processor = Processor::new(
            ProcessorConfig {
                webhook_timeout: std::time::Duration::from_secs(2),
                ..ProcessorConfig::default()
            },
            Arc::new(dispatcher),
            Arc::new(MockIntentParser::disabled()),
            Arc::new(KeyedLimiter::new("chat", KeyedLimiterConfig::chat(&limits))),
            Arc::new(KeyedLimiter::new("llm", KeyedLimiterConfig::llm(&limits))),
            Arc::new(RecordingStickers::default()),
            env.metrics.clone(),
        );

        let started = tokio::time::Instant::now();
        let reply = processor
            .process(text_event(EventSource::personal("U1"), "課程 微積分"))
            .await;
        assert!(started.elapsed() < std::time::Duration::from_secs(3));
        let Message::Text { text, quick_replies, .. } = &reply[0] else {
            panic!("expected text, got {:?}", reply);
        };
        assert!(text.contains("逾時"));
        assert_eq!(quick_replies[0].label(), "重試");
        assert_eq!(
            env.metrics
                .pipeline_outcomes
                .with_label_values(&["timeout"])
                .get(),
            1
        );
    }
}
