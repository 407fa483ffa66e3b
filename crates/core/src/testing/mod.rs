//! Testing utilities and mock implementations.
//!
//! Mocks stand in for every outside dependency (upstream sites, the clock,
//! the LLM) so handler, processor and server tests run against an
//! in-memory store with no network.
//!
//! # Example
//!
//! ```rust,ignore
//! use unibot_core::testing::fixtures;
//!
//! let (handler, env) = fixtures::program_handler();
//! env.fetch.on("program", "/programs", fixtures::program_page(&[("AI", "/p/ai", "跨領域")]));
//! ```

mod manual_clock;
mod mock_fetch;
mod mock_parser;

pub use manual_clock::ManualClock;
pub use mock_fetch::MockFetch;
pub use mock_parser::{MockIntentParser, RecordingStickers};

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::sync::Arc;

    use super::{ManualClock, MockFetch, MockIntentParser};
    use crate::adapters::CourseAdapter;
    use crate::config::{EnvelopeConfig, LimitsConfig, SmartSearchConfig};
    use crate::dispatcher::Dispatcher;
    use crate::handlers::{
        ContactHandler, CourseHandler, HandlerDeps, ProgramHandler, SemesterDetector, SmartSearch,
        StudentHandler,
    };
    use crate::metrics::Metrics;
    use crate::nlu::IntentParser;
    use crate::processor::{Processor, ProcessorConfig, RandomStickers, StickerSource};
    use crate::ratelimit::{KeyedLimiter, KeyedLimiterConfig};
    use crate::store::{Contact, ContactKind, Course, SqliteStore, TtlPolicy};

    /// Default "now" of test environments: first week of semester 113-1.
    pub const NOW: &str = "2024-10-01T12:00:00Z";

    /// Everything a handler needs, with the concrete mocks kept reachable.
    pub struct TestEnv {
        pub store: Arc<SqliteStore>,
        pub fetch: Arc<MockFetch>,
        pub clock: Arc<ManualClock>,
        pub metrics: Arc<Metrics>,
        pub deps: HandlerDeps,
    }

    pub fn env() -> TestEnv {
        env_with_clock(ManualClock::at(NOW))
    }

    pub fn env_with_clock(clock: ManualClock) -> TestEnv {
        let clock = Arc::new(clock);
        let store = Arc::new(
            SqliteStore::in_memory(TtlPolicy::default(), clock.clone())
                .expect("in-memory store"),
        );
        let fetch = Arc::new(MockFetch::new());
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let deps = HandlerDeps {
            store: store.clone(),
            fetch: fetch.clone(),
            clock: clock.clone(),
            metrics: metrics.clone(),
            envelope: EnvelopeConfig::default(),
        };
        TestEnv {
            store,
            fetch,
            clock,
            metrics,
            deps,
        }
    }

    fn semester_detector(env: &TestEnv) -> Arc<SemesterDetector> {
        Arc::new(SemesterDetector::new(
            env.store.clone(),
            CourseAdapter::new(env.fetch.clone()),
            env.clock.clone(),
        ))
    }

    pub fn student_handler() -> (StudentHandler, TestEnv) {
        let env = env();
        (StudentHandler::new(env.deps.clone()), env)
    }

    pub fn contact_handler() -> (ContactHandler, TestEnv) {
        let env = env();
        (ContactHandler::new(env.deps.clone()), env)
    }

    pub fn course_handler() -> (CourseHandler, TestEnv) {
        let env = env();
        let handler = CourseHandler::new(env.deps.clone(), semester_detector(&env));
        (handler, env)
    }

    /// Course handler with ranked search and NLU expansion disabled.
    pub fn course_handler_with_smart() -> (CourseHandler, TestEnv) {
        let env = env();
        let handler = CourseHandler::new(env.deps.clone(), semester_detector(&env))
            .with_smart_search(smart_search(&env, Arc::new(MockIntentParser::disabled())));
        (handler, env)
    }

    fn smart_search(env: &TestEnv, parser: Arc<dyn IntentParser>) -> Arc<SmartSearch> {
        let limits = LimitsConfig::default();
        Arc::new(SmartSearch::new(
            &SmartSearchConfig::default(),
            parser,
            Arc::new(KeyedLimiter::new("llm", KeyedLimiterConfig::llm(&limits))),
            env.metrics.clone(),
        ))
    }

    pub fn program_handler() -> (ProgramHandler, TestEnv) {
        let env = env();
        (ProgramHandler::new(env.deps.clone()), env)
    }

    /// A dispatcher with every module registered in production order.
    pub fn dispatcher(env: &TestEnv, parser: Arc<dyn IntentParser>) -> Arc<Dispatcher> {
        let course = CourseHandler::new(env.deps.clone(), semester_detector(env))
            .with_smart_search(smart_search(env, parser));
        let dispatcher = Dispatcher::new(env.metrics.clone())
            .with(Arc::new(StudentHandler::new(env.deps.clone())))
            .and_then(|d| d.with(Arc::new(ContactHandler::new(env.deps.clone()))))
            .and_then(|d| d.with(Arc::new(course)))
            .and_then(|d| d.with(Arc::new(ProgramHandler::new(env.deps.clone()))))
            .expect("unique modules");
        Arc::new(dispatcher)
    }

    pub fn processor(env: &TestEnv, parser: Arc<dyn IntentParser>) -> Processor {
        processor_with_stickers(env, parser, Arc::new(RandomStickers::default()))
    }

    pub fn processor_with_stickers(
        env: &TestEnv,
        parser: Arc<dyn IntentParser>,
        stickers: Arc<dyn StickerSource>,
    ) -> Processor {
        processor_with_limits(env, parser, stickers, &LimitsConfig::default())
    }

    pub fn processor_with_limits(
        env: &TestEnv,
        parser: Arc<dyn IntentParser>,
        stickers: Arc<dyn StickerSource>,
        limits: &LimitsConfig,
    ) -> Processor {
        Processor::new(
            ProcessorConfig::default(),
            dispatcher(env, parser.clone()),
            parser,
            Arc::new(KeyedLimiter::new("chat", KeyedLimiterConfig::chat(limits))),
            Arc::new(KeyedLimiter::new("llm", KeyedLimiterConfig::llm(limits))),
            stickers,
            env.metrics.clone(),
        )
    }

    /// A course of one semester with teachers and no schedule.
    pub fn course(year: i32, term: u8, no: &str, title: &str, teachers: &[&str]) -> Course {
        Course::new(year, term, no, title)
            .expect("valid course")
            .with_teachers(teachers.iter().map(|t| t.to_string()).collect(), Vec::new())
    }

    /// Student result page, Big5-encoded like the real portfolio site.
    pub fn student_page(rows: &[(&str, &str, &str)]) -> Vec<u8> {
        let mut html = String::from("<html><body><table class=\"result\">\n");
        html.push_str("<tr><th>學號</th><th>姓名</th><th>系所</th></tr>\n");
        for (id, name, department) in rows {
            html.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                id, name, department
            ));
        }
        html.push_str("</table></body></html>");
        encoding_rs::BIG5.encode(&html).0.into_owned()
    }

    /// Course table page. Every row carries its own semester.
    pub fn course_page(courses: &[Course]) -> String {
        let mut html = String::from("<table id=\"courses\">\n<tr><th>課號</th><th>課名</th></tr>\n");
        for c in courses {
            let spans = |items: &[String]| {
                items
                    .iter()
                    .map(|i| format!("<span>{}</span>", i))
                    .collect::<String>()
            };
            html.push_str(&format!(
                "<tr data-year=\"{}\" data-term=\"{}\">\
                 <td class=\"no\">{}</td>\
                 <td class=\"title\"><a href=\"/course/detail?uid={}\">{}</a></td>\
                 <td class=\"teachers\">{}</td>\
                 <td class=\"time\">{}</td>\
                 <td class=\"location\">{}</td>\
                 <td class=\"note\">{}</td></tr>\n",
                c.year,
                c.term,
                c.no,
                c.uid,
                c.title,
                c.teachers.join("、"),
                spans(&c.times),
                spans(&c.locations),
                c.note.as_deref().unwrap_or(""),
            ));
        }
        html.push_str("</table>");
        html
    }

    /// Contact directory page.
    pub fn contact_page(contacts: &[Contact]) -> String {
        let mut html = String::new();
        for c in contacts {
            let kind = match c.kind {
                ContactKind::Person => "person",
                ContactKind::Organization => "organization",
            };
            html.push_str(&format!("<div class=\"contact\" data-kind=\"{}\">", kind));
            html.push_str(&format!("<span class=\"name\">{}</span>", c.name));
            for (class, value) in [
                ("title", &c.title),
                ("org", &c.organization),
                ("superior", &c.superior),
                ("phone", &c.phone),
                ("ext", &c.extension),
                ("email", &c.email),
                ("location", &c.location),
            ] {
                if let Some(v) = value {
                    html.push_str(&format!("<span class=\"{}\">{}</span>", class, v));
                }
            }
            html.push_str("</div>\n");
        }
        html
    }

    /// Program catalogue page from `(name, href, category)` rows.
    pub fn program_page(rows: &[(&str, &str, &str)]) -> String {
        let mut html = String::from("<ul class=\"programs\">\n");
        for (name, href, category) in rows {
            html.push_str(&format!(
                "<li data-category=\"{}\"><a href=\"{}\">{}</a></li>\n",
                category, href, name
            ));
        }
        html.push_str("</ul>");
        html
    }
}
