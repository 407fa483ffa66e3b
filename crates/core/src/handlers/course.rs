//! Course search: UID lookup, course numbers, unified title/teacher search,
//! historical years and ranked smart search.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::semester::SemesterDetector;
use super::smart::{relevance_badge, SmartSearch};
use super::{
    extract_search_term, not_found, param, resolve_intent, two_tier, Handler, HandlerDeps,
    HandlerError, IntentSpec, KeywordMatcher, Params,
};
use crate::adapters::{AdapterError, CourseAdapter};
use crate::clock::normalize_year;
use crate::context::RequestContext;
use crate::postback::Postback;
use crate::reply::{bubble_reply, Action, Bubble, Message};
use crate::store::{
    is_course_no, parse_course_uid, Course, CourseNamespace, MatchMode, Semester,
    COURSE_LAUNCH_YEAR,
};

pub(crate) const MODULE: &str = "course";

/// Largest course list rendered in one reply.
pub const MAX_COURSE_RESULTS: usize = 40;

const SEARCH_FIELDS: &[&str] = &["title", "teachers"];

/// Semesters scraped on a cache miss.
const SCRAPE_SEMESTERS: usize = 2;

pub(crate) const INTENTS: &[IntentSpec] = &[
    IntentSpec {
        name: "search",
        description: "Search current courses by title or teacher name",
        required: &["keyword"],
        optional: &[],
    },
    IntentSpec {
        name: "uid",
        description: "Look up a course by full UID such as 1131U0001",
        required: &["uid"],
        optional: &[],
    },
    IntentSpec {
        name: "number",
        description: "Look up a course by course number such as U0001",
        required: &["no"],
        optional: &[],
    },
    IntentSpec {
        name: "historical",
        description: "Search courses of a past academic year",
        required: &["year", "keyword"],
        optional: &[],
    },
    IntentSpec {
        name: "teacher",
        description: "List courses taught by a teacher",
        required: &["name"],
        optional: &[],
    },
    IntentSpec {
        name: "smart",
        description: "Find courses by topic or description (ranked search)",
        required: &["query"],
        optional: &[],
    },
];

fn sort_recent_first(courses: &mut [Course]) {
    courses.sort_by(|a, b| b.semester().cmp(&a.semester()));
}

fn first_token(text: &str) -> &str {
    text.split_whitespace().next().unwrap_or("")
}

/// Parsed `<year> [term] <keyword>` remainder.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HistoricalQuery {
    year: i32,
    term: Option<u8>,
    keyword: String,
}

fn parse_historical(rest: &str) -> Option<HistoricalQuery> {
    let mut tokens = rest.split_whitespace();
    let year_token = tokens.next()?;
    if !(2..=4).contains(&year_token.len()) || !year_token.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year = normalize_year(year_token.parse().ok()?);
    let mut remaining: Vec<&str> = tokens.collect();
    let term = match remaining.first() {
        Some(&"1") => Some(1),
        Some(&"2") => Some(2),
        _ => None,
    };
    if term.is_some() {
        remaining.remove(0);
    }
    let keyword = remaining.join(" ");
    if keyword.is_empty() {
        return None;
    }
    Some(HistoricalQuery {
        year,
        term,
        keyword,
    })
}

pub struct CourseHandler {
    deps: HandlerDeps,
    adapter: CourseAdapter,
    semesters: Arc<SemesterDetector>,
    smart: Option<Arc<SmartSearch>>,
    keywords: KeywordMatcher,
    smart_keywords: KeywordMatcher,
}

impl CourseHandler {
    pub fn new(deps: HandlerDeps, semesters: Arc<SemesterDetector>) -> Self {
        Self {
            adapter: CourseAdapter::new(deps.fetch.clone()),
            deps,
            semesters,
            smart: None,
            keywords: KeywordMatcher::new(&["課程", "查課", "course", "class"]),
            smart_keywords: KeywordMatcher::new(&["找課"]),
        }
    }

    pub fn with_smart_search(mut self, smart: Arc<SmartSearch>) -> Self {
        self.smart = Some(smart);
        self
    }

    fn bubble(&self, course: &Course, badge: Option<&str>) -> Result<Bubble, HandlerError> {
        let max_bytes = self.deps.envelope.max_postback_bytes;
        let mut subtitle = format!("{} {}", course.semester(), course.no);
        if let Some(badge) = badge {
            subtitle = format!("【{}】{}", badge, subtitle);
        }
        let mut bubble = Bubble::new(&course.title)
            .subtitle(subtitle)
            .field("教師", Some(&course.teachers.join("、")))
            .field("時間", Some(&course.times.join("、")))
            .field("地點", Some(&course.locations.join("、")));

        let detail = Postback::new(MODULE, "detail").with_param(course.uid.clone());
        bubble = bubble.action(Action::postback("詳細資訊", &detail, max_bytes)?);
        if let Some(url) = &course.detail_url {
            bubble = bubble.action(Action::uri("課程大綱", url.clone()));
        }
        if let Some(teacher) = course.teachers.first() {
            let more = Postback::new(MODULE, "teacher").with_param(teacher.clone());
            bubble = bubble.action(Action::postback(
                &format!("{}的課", teacher),
                &more,
                max_bytes,
            )?);
        }
        Ok(bubble)
    }

    fn render(&self, courses: Vec<Course>) -> Result<Vec<Message>, HandlerError> {
        let total = courses.len();
        let bubbles = courses
            .iter()
            .take(MAX_COURSE_RESULTS)
            .map(|c| self.bubble(c, None))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bubble_reply("課程查詢結果", bubbles, total, &self.deps.envelope))
    }

    fn detail(&self, course: &Course) -> Result<Vec<Message>, HandlerError> {
        let mut lines = vec![
            course.title.clone(),
            format!("{}（{}）", course.semester(), course.uid),
        ];
        for (label, values) in [
            ("教師", &course.teachers),
            ("時間", &course.times),
            ("地點", &course.locations),
        ] {
            if !values.is_empty() {
                lines.push(format!("{}：{}", label, values.join("、")));
            }
        }
        if let Some(note) = &course.note {
            lines.push(format!("備註：{}", note));
        }

        let max_bytes = self.deps.envelope.max_postback_bytes;
        let mut actions = Vec::new();
        if let Some(url) = &course.detail_url {
            actions.push(Action::uri("課程大綱", url.clone()));
        }
        for (i, teacher) in course.teachers.iter().enumerate() {
            match course.teacher_urls.get(i) {
                Some(url) => actions.push(Action::uri(teacher, url.clone())),
                None => {
                    let more = Postback::new(MODULE, "teacher").with_param(teacher.clone());
                    actions.push(Action::postback(teacher, &more, max_bytes)?);
                }
            }
        }
        Ok(vec![Message::text(lines.join("\n")).with_quick_replies(actions)])
    }

    /// Scrape several semesters concurrently. Fails only if every
    /// semester failed.
    async fn scrape_semesters(
        &self,
        ctx: &RequestContext,
        semesters: &[Semester],
        keyword: &str,
    ) -> Result<Vec<Course>, HandlerError> {
        let results = join_all(
            semesters
                .iter()
                .map(|s| self.adapter.by_keyword(ctx, *s, keyword)),
        )
        .await;

        let mut courses = Vec::new();
        let mut first_error: Option<AdapterError> = None;
        let mut succeeded = 0;
        for (semester, result) in semesters.iter().zip(results) {
            match result {
                Ok(found) => {
                    succeeded += 1;
                    courses.extend(found);
                }
                Err(e) => {
                    warn!(semester = %semester, keyword, error = %e, "Course scrape failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if succeeded == 0 => Err(e.into()),
            _ => Ok(courses),
        }
    }

    fn cached_search(
        &self,
        ns: CourseNamespace,
        fields: &[&str],
        keyword: &str,
    ) -> Result<Vec<Course>, HandlerError> {
        let store = &self.deps.store;
        Ok(two_tier(
            MODULE,
            &self.deps.metrics,
            || store.search_courses(ns, MatchMode::Exact, fields, keyword),
            || store.search_courses(ns, MatchMode::Fuzzy, fields, keyword),
            |c: &Course| c.uid.clone(),
        )?)
    }

    /// Unified title + teacher search over the active namespace.
    async fn search(
        &self,
        ctx: &RequestContext,
        keyword: &str,
        fields: &[&str],
        year: Option<i32>,
    ) -> Result<Vec<Message>, HandlerError> {
        let in_year = |c: &Course| year.map_or(true, |y| c.year == y);

        let mut cached: Vec<Course> = self
            .cached_search(CourseNamespace::Active, fields, keyword)?
            .into_iter()
            .filter(in_year)
            .collect();
        self.deps.record_lookup(MODULE, !cached.is_empty());
        if !cached.is_empty() {
            sort_recent_first(&mut cached);
            return self.render(cached);
        }

        let window = self.semesters.semesters(ctx).await;
        let targets: Vec<Semester> = match year {
            Some(y) => window.into_iter().filter(|s| s.year == y).collect(),
            None => window.into_iter().take(SCRAPE_SEMESTERS).collect(),
        };
        let scraped = self.scrape_semesters(ctx, &targets, keyword).await?;
        if scraped.is_empty() {
            if let (Some(smart), None) = (&self.smart, year) {
                debug!(keyword, "Nothing scraped; falling back to ranked search");
                return self.ranked(ctx, smart, keyword).await;
            }
            return Ok(not_found("課程", keyword));
        }
        self.deps
            .store
            .save_courses(CourseNamespace::Active, &scraped)?;
        info!(keyword, count = scraped.len(), "Cached scraped courses");

        let mut courses: Vec<Course> = scraped.into_iter().filter(in_year).collect();
        sort_recent_first(&mut courses);
        self.render(courses)
    }

    async fn historical(
        &self,
        ctx: &RequestContext,
        query: &HistoricalQuery,
    ) -> Result<Vec<Message>, HandlerError> {
        let current = self.deps.clock.roc_year();
        if query.year < COURSE_LAUNCH_YEAR {
            return Ok(vec![Message::text(format!(
                "{} 學年太早了，課程資料從 {} 學年開始。",
                query.year, COURSE_LAUNCH_YEAR
            ))]);
        }
        if query.year > current {
            return Ok(vec![Message::text(format!(
                "{} 學年的課程還沒開出來喔。",
                query.year
            ))]);
        }

        let window = self.semesters.semesters(ctx).await;
        let oldest = window.last().map(|s| s.year).unwrap_or(current);
        if query.year >= oldest {
            debug!(year = query.year, "Year within recent window; using regular search");
            return self
                .search(ctx, &query.keyword, SEARCH_FIELDS, Some(query.year))
                .await;
        }

        let matches_term = |c: &Course| query.term.map_or(true, |t| c.term == t);
        let mut cached: Vec<Course> = self
            .cached_search(CourseNamespace::Historical, SEARCH_FIELDS, &query.keyword)?
            .into_iter()
            .filter(|c| c.year == query.year && matches_term(c))
            .collect();
        self.deps.record_lookup("historical_course", !cached.is_empty());
        if !cached.is_empty() {
            sort_recent_first(&mut cached);
            return self.render(cached);
        }

        let targets: Vec<Semester> = match query.term {
            Some(t) => vec![Semester::new(query.year, t)],
            None => vec![Semester::new(query.year, 2), Semester::new(query.year, 1)],
        };
        let mut scraped = self.scrape_semesters(ctx, &targets, &query.keyword).await?;
        if scraped.is_empty() {
            return Ok(not_found(
                "課程",
                &format!("{} 學年 {}", query.year, query.keyword),
            ));
        }
        self.deps
            .store
            .save_courses(CourseNamespace::Historical, &scraped)?;
        sort_recent_first(&mut scraped);
        self.render(scraped)
    }

    /// Find a course by UID in either namespace, scraping on a miss.
    async fn lookup(&self, ctx: &RequestContext, uid: &str) -> Result<Option<Course>, HandlerError> {
        let Some((year, term, no)) = parse_course_uid(uid) else {
            return Ok(None);
        };
        let uid = uid.to_ascii_uppercase();
        for ns in [CourseNamespace::Active, CourseNamespace::Historical] {
            if let Some(course) = self.deps.store.get_course(ns, &uid)? {
                self.deps.record_lookup(MODULE, true);
                return Ok(Some(course));
            }
        }
        self.deps.record_lookup(MODULE, false);

        let semester = Semester::new(year, term);
        let found = self.adapter.by_number(ctx, semester, &no).await?;
        let Some(course) = found.into_iter().next() else {
            return Ok(None);
        };
        let window = self.semesters.semesters(ctx).await;
        let ns = if window.contains(&semester) {
            CourseNamespace::Active
        } else {
            CourseNamespace::Historical
        };
        self.deps
            .store
            .save_courses(ns, std::slice::from_ref(&course))?;
        Ok(Some(course))
    }

    async fn by_uid(&self, ctx: &RequestContext, uid: &str) -> Result<Vec<Message>, HandlerError> {
        match self.lookup(ctx, uid).await? {
            Some(course) => self.detail(&course),
            None => Ok(not_found("課程", uid)),
        }
    }

    /// Expand a bare course number over the most recent semesters.
    async fn by_number(&self, ctx: &RequestContext, no: &str) -> Result<Vec<Message>, HandlerError> {
        let no = no.to_ascii_uppercase();
        let semesters = self.semesters.recent(ctx, SCRAPE_SEMESTERS).await;
        let uids: Vec<String> = semesters
            .iter()
            .map(|s| crate::store::course_uid(s.year, s.term, &no))
            .collect();

        for uid in &uids {
            if let Some(course) = self.deps.store.get_course(CourseNamespace::Active, uid)? {
                self.deps.record_lookup(MODULE, true);
                return self.detail(&course);
            }
        }
        self.deps.record_lookup(MODULE, false);

        for uid in &uids {
            if let Some(course) = self.lookup(ctx, uid).await? {
                return self.detail(&course);
            }
        }
        Ok(not_found("課程", &no))
    }

    async fn smart(&self, ctx: &RequestContext, query: &str) -> Result<Vec<Message>, HandlerError> {
        match &self.smart {
            Some(smart) => self.ranked(ctx, smart, query).await,
            None => self.search(ctx, query, SEARCH_FIELDS, None).await,
        }
    }

    async fn ranked(
        &self,
        ctx: &RequestContext,
        smart: &SmartSearch,
        query: &str,
    ) -> Result<Vec<Message>, HandlerError> {
        let results = smart.search(ctx, self.deps.store.as_ref(), query).await?;
        if results.is_empty() {
            return Ok(not_found("課程", query));
        }
        let total = results.len();
        let bubbles = results
            .iter()
            .enumerate()
            .map(|(rank, r)| self.bubble(&r.course, Some(relevance_badge(rank, total))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bubble_reply("智慧選課結果", bubbles, total, &self.deps.envelope))
    }

    fn help() -> Vec<Message> {
        vec![Message::text(
            "課程查詢：\n・課程 課名或老師\n・課程 U0001 或 1131U0001\n・課程 110 微積分（歷年課程）\n・找課 想學的主題",
        )]
    }

    async fn route(&self, ctx: &RequestContext, rest: &str) -> Result<Vec<Message>, HandlerError> {
        if rest.is_empty() {
            return Ok(Self::help());
        }
        let head = first_token(rest);
        if parse_course_uid(head).is_some() {
            return self.by_uid(ctx, head).await;
        }
        if is_course_no(head) {
            return self.by_number(ctx, head).await;
        }
        if let Some(query) = parse_historical(rest) {
            return self.historical(ctx, &query).await;
        }
        self.search(ctx, rest, SEARCH_FIELDS, None).await
    }
}

#[async_trait]
impl Handler for CourseHandler {
    fn module(&self) -> &'static str {
        MODULE
    }

    fn can_handle(&self, text: &str) -> bool {
        let head = first_token(text);
        self.keywords.matches(text)
            || self.smart_keywords.matches(text)
            || parse_course_uid(head).is_some()
            || is_course_no(head)
    }

    async fn handle_message(
        &self,
        ctx: &RequestContext,
        text: &str,
    ) -> Result<Vec<Message>, HandlerError> {
        let text = text.trim();
        if let Some((kw, rest)) = self.smart_keywords.strip(text) {
            if rest.is_empty() {
                return Ok(Self::help());
            }
            debug!(keyword = kw, "Smart course search");
            return self.smart(ctx, rest).await;
        }
        if let Some((kw, _)) = self.keywords.strip(text) {
            let rest = extract_search_term(text, kw);
            return self.route(ctx, &rest).await;
        }
        let head = first_token(text);
        if parse_course_uid(head).is_some() {
            return self.by_uid(ctx, head).await;
        }
        if is_course_no(head) {
            return self.by_number(ctx, head).await;
        }
        Ok(Vec::new())
    }

    async fn handle_postback(
        &self,
        ctx: &RequestContext,
        postback: &Postback,
    ) -> Result<Vec<Message>, HandlerError> {
        match postback.action.as_str() {
            "detail" => match postback.param(0) {
                Some(uid) => self.by_uid(ctx, uid).await,
                None => Err(HandlerError::MissingParameter("uid".to_string())),
            },
            "teacher" => match postback.param(0) {
                Some(name) => self.search(ctx, name, &["teachers"], None).await,
                None => Err(HandlerError::MissingParameter("name".to_string())),
            },
            other => {
                debug!(action = other, "Unknown course postback");
                Ok(Vec::new())
            }
        }
    }

    fn intents(&self) -> &'static [IntentSpec] {
        INTENTS
    }

    async fn dispatch_intent(
        &self,
        ctx: &RequestContext,
        intent: &str,
        params: &Params,
    ) -> Result<Vec<Message>, HandlerError> {
        let spec = resolve_intent(MODULE, INTENTS, intent, params)?;
        let get = |name: &str| param(params, name).unwrap_or_default();
        match spec.name {
            "search" => self.search(ctx, get("keyword"), SEARCH_FIELDS, None).await,
            "uid" => self.by_uid(ctx, get("uid")).await,
            "number" => self.by_number(ctx, get("no")).await,
            "teacher" => self.search(ctx, get("name"), &["teachers"], None).await,
            "smart" => self.smart(ctx, get("query")).await,
            _ => {
                let raw = get("year");
                let Ok(year) = raw.parse::<i32>() else {
                    return Err(HandlerError::InvalidParameter {
                        name: "year".to_string(),
                        reason: format!("'{}' is not a year", raw),
                    });
                };
                let query = HistoricalQuery {
                    year: normalize_year(year),
                    term: None,
                    keyword: get("keyword").to_string(),
                };
                self.historical(ctx, &query).await
            }
        }
    }
}
