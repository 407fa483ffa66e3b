//! End-to-end processor scenarios.
//!
//! Events go through the full pipeline (admission, sanitisation, keyword
//! dispatch, handlers, store, mock upstream, envelope) and the tests look
//! only at the replies and at upstream call counts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use unibot_core::config::LimitsConfig;
use unibot_core::dispatcher::Dispatcher;
use unibot_core::handlers::{Handler, HandlerError};
use unibot_core::postback::Postback;
use unibot_core::processor::{
    Event, EventInput, EventSource, Mention, Processor, ProcessorConfig, RandomStickers,
};
use unibot_core::ratelimit::{KeyedLimiter, KeyedLimiterConfig};
use unibot_core::store::{Contact, Course, CourseNamespace, Store};
use unibot_core::testing::{fixtures, MockIntentParser};
use unibot_core::{Message, RequestContext};

fn personal(text: &str) -> Event {
    Event::new(EventSource::personal("U1"), EventInput::text(text))
}

fn bubble_titles(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .flat_map(|m| match m {
            Message::Carousel { bubbles, .. } => bubbles.iter().map(|b| b.title.clone()).collect(),
            _ => Vec::new(),
        })
        .collect()
}

fn keyword_processor(env: &fixtures::TestEnv) -> Processor {
    fixtures::processor(env, Arc::new(MockIntentParser::disabled()))
}

#[tokio::test]
async fn test_exact_and_fuzzy_results_are_unioned() {
    let env = fixtures::env();
    env.store
        .save_courses(
            CourseNamespace::Active,
            &[
                fixtures::course(113, 1, "U0001", "線性代數", &["張三"]),
                fixtures::course(113, 1, "U0002", "線代講義", &["李四"]),
                fixtures::course(113, 1, "U0003", "微積分", &["王五"]),
            ],
        )
        .unwrap();

    let reply = keyword_processor(&env).process(personal("課程 線代")).await;
    let mut titles = bubble_titles(&reply);
    titles.sort();
    assert_eq!(titles, vec!["線代講義", "線性代數"]);
    assert_eq!(env.fetch.call_count(), 0);
}

#[tokio::test]
async fn test_abbreviation_recovered_by_fuzzy_match() {
    let env = fixtures::env();
    env.store
        .save_contacts(&[Contact::person("王小明", Some("資訊中心".into()))])
        .unwrap();

    let reply = keyword_processor(&env).process(personal("聯絡 王明")).await;
    assert_eq!(bubble_titles(&reply), vec!["王小明"]);
    assert_eq!(env.fetch.call_count(), 0);
}

#[tokio::test]
async fn test_cache_miss_scrapes_two_semesters_then_hits_store() {
    let env = fixtures::env();
    env.fetch.on(
        "course",
        "/course/list",
        fixtures::course_page(&[fixtures::course(113, 1, "U9999", "探測", &[])]),
    );
    env.fetch.on_fn("course", "/course/query", |req| {
        let query = req.query.clone().unwrap_or_default();
        let param = |name: &str| {
            query
                .split('&')
                .find_map(|p| p.strip_prefix(&format!("{}=", name)))
                .and_then(|v| v.parse::<i32>().ok())
                .unwrap_or(0)
        };
        let (year, term) = (param("year"), param("term") as u8);
        Ok(fixtures::course_page(&[fixtures::course(
            year,
            term,
            "U0001",
            "微積分",
            &["張三"],
        )])
        .into_bytes())
    });
    let processor = keyword_processor(&env);

    let first = processor.process(personal("課程 微積分")).await;
    assert_eq!(bubble_titles(&first).len(), 2);
    assert_eq!(env.fetch.calls_to("/course/query"), 2);
    assert!(env
        .store
        .get_course(CourseNamespace::Active, "1131U0001")
        .unwrap()
        .is_some());

    let second = processor.process(personal("課程 微積分")).await;
    assert_eq!(first, second);
    assert_eq!(env.fetch.calls_to("/course/query"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_burst_then_rate_limit_then_refill() {
    let env = fixtures::env();
    let limits = LimitsConfig {
        chat_burst: 6,
        chat_refill_secs: 5.0,
        ..LimitsConfig::default()
    };
    let processor = fixtures::processor_with_limits(
        &env,
        Arc::new(MockIntentParser::disabled()),
        Arc::new(RandomStickers::default()),
        &limits,
    );

    for _ in 0..6 {
        let reply = processor.process(personal("說明")).await;
        assert!(reply[0].as_text().unwrap().contains("課程"));
    }
    let denied = processor.process(personal("說明")).await;
    assert!(denied[0].as_text().unwrap().contains("太頻繁"));

    tokio::time::advance(Duration::from_secs(5)).await;
    let admitted = processor.process(personal("說明")).await;
    assert!(admitted[0].as_text().unwrap().contains("課程"));

    // Group chats are dropped silently once limited.
    let group = EventSource::group("G1", "U2");
    for _ in 0..6 {
        processor
            .process(Event::new(group.clone(), EventInput::text("說明")))
            .await;
    }
    let silent = processor
        .process(Event::new(group, EventInput::text("說明")))
        .await;
    assert!(silent.is_empty());
}

#[tokio::test]
async fn test_group_mention_is_stripped_before_dispatch() {
    let env = fixtures::env();
    env.store
        .save_courses(
            CourseNamespace::Active,
            &[fixtures::course(113, 1, "U0001", "微積分", &["張三"])],
        )
        .unwrap();
    let processor = keyword_processor(&env);

    let event = Event::new(
        EventSource::group("G1", "U1"),
        EventInput::Text {
            text: "@bot 課程 微積分".to_string(),
            mentions: vec![Mention {
                index: 0,
                length: 4,
                is_self: true,
            }],
            quote_token: None,
        },
    );
    let reply = processor.process(event).await;
    assert_eq!(bubble_titles(&reply), vec!["微積分"]);
}

#[tokio::test]
async fn test_large_result_set_is_split_and_truncated() {
    let env = fixtures::env();
    let courses: Vec<Course> = (1..=41)
        .map(|i| fixtures::course(113, 1, &format!("U{:04}", i), &format!("微積分{}", i), &["張三"]))
        .collect();
    env.store
        .save_courses(CourseNamespace::Active, &courses)
        .unwrap();

    let reply = keyword_processor(&env).process(personal("課程 微積分")).await;
    assert_eq!(reply.len(), 5);
    for message in &reply[..4] {
        let Message::Carousel { bubbles, .. } = message else {
            panic!("expected carousel, got {:?}", message);
        };
        assert_eq!(bubbles.len(), 10);
    }
    let note = reply[4].as_text().unwrap();
    assert!(note.contains("共 41 筆"));
    assert!(note.contains("省略 1 筆"));
}

#[tokio::test(start_paused = true)]
async fn test_slow_upstream_times_out_with_retry_action() {
    let env = fixtures::env();
    env.fetch.on("course", "/course/query", fixtures::course_page(&[]));
    env.fetch.set_delay(Duration::from_secs(60));
    let processor = Processor::new(
        ProcessorConfig {
            webhook_timeout: Duration::from_secs(2),
            ..ProcessorConfig::default()
        },
        fixtures::dispatcher(&env, Arc::new(MockIntentParser::disabled())),
        Arc::new(MockIntentParser::disabled()),
        Arc::new(KeyedLimiter::new(
            "chat",
            KeyedLimiterConfig::chat(&LimitsConfig::default()),
        )),
        Arc::new(KeyedLimiter::new(
            "llm",
            KeyedLimiterConfig::llm(&LimitsConfig::default()),
        )),
        Arc::new(RandomStickers::default()),
        env.metrics.clone(),
    );

    let reply = processor.process(personal("課程 微積分")).await;
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

struct Exploding;

#[async_trait]
impl Handler for Exploding {
    fn module(&self) -> &'static str {
        "boom"
    }

    fn can_handle(&self, text: &str) -> bool {
        text == "boom"
    }

    async fn handle_message(
        &self,
        _ctx: &RequestContext,
        _text: &str,
    ) -> Result<Vec<Message>, HandlerError> {
        panic!("handler bug");
    }

    async fn handle_postback(
        &self,
        _ctx: &RequestContext,
        _postback: &Postback,
    ) -> Result<Vec<Message>, HandlerError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_handler_panic_becomes_generic_failure() {
    let env = fixtures::env();
    let dispatcher = Dispatcher::new(env.metrics.clone())
        .with(Arc::new(Exploding))
        .unwrap();
    let parser = Arc::new(MockIntentParser::disabled());
    let processor = Processor::new(
        ProcessorConfig::default(),
        Arc::new(dispatcher),
        parser,
        Arc::new(KeyedLimiter::new(
            "chat",
            KeyedLimiterConfig::chat(&LimitsConfig::default()),
        )),
        Arc::new(KeyedLimiter::new(
            "llm",
            KeyedLimiterConfig::llm(&LimitsConfig::default()),
        )),
        Arc::new(RandomStickers::default()),
        env.metrics.clone(),
    );

    let reply = processor.process(personal("boom")).await;
    assert_eq!(reply[0].as_text(), Some("系統發生錯誤，請稍後再試。"));
    assert_eq!(
        env.metrics
            .pipeline_outcomes
            .with_label_values(&["panic"])
            .get(),
        1
    );
}

#[tokio::test]
async fn test_nlu_intent_is_dispatched() {
    let env = fixtures::env();
    env.store
        .save_contacts(&[Contact::person("王小明", Some("資訊中心".into()))])
        .unwrap();
    let processor = fixtures::processor(
        &env,
        Arc::new(MockIntentParser::intent("contact", "search", &[("query", "王小明")])),
    );

    let reply = processor
        .process(personal("請問王小明老師的電話是多少"))
        .await;
    assert_eq!(bubble_titles(&reply), vec!["王小明"]);
}
