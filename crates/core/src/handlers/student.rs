//! Student lookups: by id, by name, and by admission cohort.

use async_trait::async_trait;
use tracing::{debug, info};

use super::keyword::leading_digits;
use super::{
    not_found, param, resolve_intent, two_tier, Handler, HandlerDeps, HandlerError, IntentSpec,
    KeywordMatcher, Params,
};
use crate::adapters::StudentAdapter;
use crate::clock::{normalize_year, to_gregorian};
use crate::context::RequestContext;
use crate::postback::Postback;
use crate::reply::{text_reply, Action, Bubble, Message};
use crate::store::{
    is_student_id, MatchMode, Student, STUDENT_DATA_CUTOFF_YEAR, STUDENT_LAUNCH_YEAR,
};

pub(crate) const MODULE: &str = "student";

/// Largest student list rendered in one reply.
pub const MAX_STUDENT_RESULTS: usize = 500;

/// Department codes as they appear in student ids, grouped by college.
pub const DEPARTMENTS: &[(&str, &[(&str, &str)])] = &[
    (
        "人文學院",
        &[("81", "中文系"), ("82", "應外系"), ("83", "歷史系")],
    ),
    (
        "法律學院",
        &[("71", "法律系")],
    ),
    (
        "商學院",
        &[("79", "企管系"), ("84", "金融系"), ("86", "會計系"), ("87", "統計系"), ("88", "休運系")],
    ),
    (
        "公共事務學院",
        &[("72", "公行系"), ("73", "財政系"), ("74", "不動系")],
    ),
    (
        "社會科學學院",
        &[("75", "經濟系"), ("76", "社學系"), ("77", "社工系")],
    ),
    (
        "電機資訊學院",
        &[("85", "資工系"), ("89", "通訊系"), ("90", "電機系")],
    ),
];

pub(crate) const INTENTS: &[IntentSpec] = &[
    IntentSpec {
        name: "id",
        description: "Look up a student by 8 or 9 digit student id",
        required: &["student_id"],
        optional: &[],
    },
    IntentSpec {
        name: "search",
        description: "Search students by (partial) name",
        required: &["name"],
        optional: &[],
    },
    IntentSpec {
        name: "year",
        description: "Browse students admitted in an academic year, optionally one department",
        required: &["year"],
        optional: &["department"],
    },
];

fn all_departments() -> impl Iterator<Item = (&'static str, &'static str)> {
    DEPARTMENTS.iter().flat_map(|(_, depts)| depts.iter().copied())
}

/// Department name for a code.
pub fn department_name(code: &str) -> Option<&'static str> {
    all_departments()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| name)
}

/// Department code for a name (full or without the trailing 系).
pub fn department_code(name: &str) -> Option<&'static str> {
    let name = name.trim();
    let bare = name.trim_end_matches('系');
    all_departments()
        .find(|(_, n)| *n == name || n.trim_end_matches('系') == bare)
        .map(|(code, _)| code)
}

/// Outcome of validating a requested admission year.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YearCheck {
    Valid(i32),
    TooEarly,
    Future,
    NoData,
}

/// Validate a user-entered (ROC or Gregorian) year against the data window.
pub fn check_year(year: i32, current_roc_year: i32) -> YearCheck {
    let year = normalize_year(year);
    if year < STUDENT_LAUNCH_YEAR {
        YearCheck::TooEarly
    } else if year > current_roc_year {
        YearCheck::Future
    } else if year >= STUDENT_DATA_CUTOFF_YEAR {
        YearCheck::NoData
    } else {
        YearCheck::Valid(year)
    }
}

fn year_reply(check: YearCheck, year: i32) -> Option<Vec<Message>> {
    let text = match check {
        YearCheck::Valid(_) => return None,
        YearCheck::TooEarly => format!(
            "{} 學年太早了，學生資料從 {} 學年開始。",
            year, STUDENT_LAUNCH_YEAR
        ),
        YearCheck::Future => format!("{} 學年還沒到喔，是未來的學生嗎？", year),
        YearCheck::NoData => format!(
            "{} 學年起學校不再公開學生資料，查不到喔。",
            STUDENT_DATA_CUTOFF_YEAR
        ),
    };
    Some(vec![Message::text(text)])
}

pub struct StudentHandler {
    deps: HandlerDeps,
    adapter: StudentAdapter,
    keywords: KeywordMatcher,
    year_keywords: KeywordMatcher,
}

impl StudentHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self {
            adapter: StudentAdapter::new(deps.fetch.clone()),
            deps,
            keywords: KeywordMatcher::new(&["學生", "學號", "student"]),
            year_keywords: KeywordMatcher::new(&["學年"]),
        }
    }

    fn render(&self, students: Vec<Student>) -> Vec<Message> {
        let total = students.len();
        let lines: Vec<String> = students
            .iter()
            .take(MAX_STUDENT_RESULTS)
            .map(|s| format!("{}  {}  {}", s.id, s.name, s.department))
            .collect();
        text_reply(&lines, total, &self.deps.envelope)
    }

    async fn by_id(&self, ctx: &RequestContext, id: &str) -> Result<Vec<Message>, HandlerError> {
        if let Some(student) = self.deps.store.get_student(id)? {
            self.deps.record_lookup(MODULE, true);
            return Ok(self.render(vec![student]));
        }
        self.deps.record_lookup(MODULE, false);

        let scraped = self.adapter.by_id(ctx, id).await?;
        if scraped.is_empty() {
            return Ok(not_found("學生", id));
        }
        self.deps.store.save_students(&scraped)?;
        Ok(self.render(scraped))
    }

    async fn by_name(&self, ctx: &RequestContext, name: &str) -> Result<Vec<Message>, HandlerError> {
        let store = &self.deps.store;
        let cached = two_tier(
            MODULE,
            &self.deps.metrics,
            || store.search_students(MatchMode::Exact, &["name"], name),
            || store.search_students(MatchMode::Fuzzy, &["name"], name),
            |s: &Student| s.id.clone(),
        )?;
        self.deps.record_lookup(MODULE, !cached.is_empty());
        if !cached.is_empty() {
            return Ok(self.render(cached));
        }

        let scraped = self.adapter.by_name(ctx, name).await?;
        if scraped.is_empty() {
            return Ok(not_found("學生", name));
        }
        self.deps.store.save_students(&scraped)?;
        info!(name, count = scraped.len(), "Cached scraped students");
        Ok(self.render(scraped))
    }

    fn department_picker(&self, year: i32) -> Result<Vec<Message>, HandlerError> {
        let max_bytes = self.deps.envelope.max_postback_bytes;
        let mut bubbles = Vec::new();
        for (college, depts) in DEPARTMENTS {
            let mut bubble = Bubble::new(*college).subtitle(format!(
                "{} 學年（{} 年）",
                year,
                to_gregorian(year)
            ));
            for (code, name) in depts.iter() {
                let postback = Postback::new(MODULE, "dept")
                    .with_param(year.to_string())
                    .with_param(*code);
                bubble = bubble.action(Action::postback(name, &postback, max_bytes)?);
            }
            bubbles.push(bubble);
        }
        let total = bubbles.len();
        let mut messages = vec![Message::text(format!("要查 {} 學年哪個系？", year))];
        messages.extend(crate::reply::bubble_reply(
            "選擇系所",
            bubbles,
            total,
            &self.deps.envelope,
        ));
        Ok(messages)
    }

    async fn cohort(
        &self,
        ctx: &RequestContext,
        year: i32,
        code: &str,
    ) -> Result<Vec<Message>, HandlerError> {
        let Some(name) = department_name(code) else {
            return Err(HandlerError::InvalidParameter {
                name: "department".to_string(),
                reason: format!("unknown department code '{}'", code),
            });
        };
        if let Some(reply) = year_reply(check_year(year, self.deps.clock.roc_year()), year) {
            return Ok(reply);
        }

        let cached = self.deps.store.students_by_year_department(year, name)?;
        self.deps.record_lookup(MODULE, !cached.is_empty());
        if !cached.is_empty() {
            return Ok(self.render(cached));
        }

        let scraped = self.adapter.by_year_department(ctx, year, code).await?;
        if scraped.is_empty() {
            return Ok(not_found("學生", &format!("{} 學年 {}", year, name)));
        }
        self.deps.store.save_students(&scraped)?;
        Ok(self.render(scraped))
    }

    fn year(&self, raw: &str) -> Result<Vec<Message>, HandlerError> {
        let Ok(year) = raw.trim().parse::<i32>() else {
            return Ok(vec![Message::text("請輸入學年，例如「學年 112」")]);
        };
        let check = check_year(year, self.deps.clock.roc_year());
        match year_reply(check, normalize_year(year)) {
            Some(reply) => Ok(reply),
            None => self.department_picker(normalize_year(year)),
        }
    }

    fn help() -> Vec<Message> {
        vec![Message::text(
            "學生查詢：\n・直接輸入學號（8 或 9 碼）\n・學生 姓名\n・學年 112",
        )]
    }
}

#[async_trait]
impl Handler for StudentHandler {
    fn module(&self) -> &'static str {
        MODULE
    }

    fn can_handle(&self, text: &str) -> bool {
        let (digits, rest) = leading_digits(text.trim());
        let bare_id = is_student_id(digits) && rest.chars().next().map_or(true, char::is_whitespace);
        bare_id || self.keywords.matches(text) || self.year_keywords.matches(text)
    }

    async fn handle_message(
        &self,
        ctx: &RequestContext,
        text: &str,
    ) -> Result<Vec<Message>, HandlerError> {
        let text = text.trim();
        let (digits, _) = leading_digits(text);
        if is_student_id(digits) {
            return self.by_id(ctx, digits).await;
        }
        if let Some((_, rest)) = self.year_keywords.strip(text) {
            return self.year(rest);
        }
        let term = match self.keywords.strip(text) {
            Some((_, rest)) => rest,
            None => return Ok(Vec::new()),
        };
        if term.is_empty() {
            return Ok(Self::help());
        }
        if is_student_id(term) {
            return self.by_id(ctx, term).await;
        }
        self.by_name(ctx, term).await
    }

    async fn handle_postback(
        &self,
        ctx: &RequestContext,
        postback: &Postback,
    ) -> Result<Vec<Message>, HandlerError> {
        match postback.action.as_str() {
            "dept" => {
                let year = postback
                    .param(0)
                    .and_then(|y| y.parse::<i32>().ok())
                    .ok_or_else(|| HandlerError::MissingParameter("year".to_string()))?;
                let code = postback
                    .param(1)
                    .ok_or_else(|| HandlerError::MissingParameter("department".to_string()))?;
                self.cohort(ctx, year, code).await
            }
            "id" => match postback.param(0) {
                Some(id) if is_student_id(id) => self.by_id(ctx, id).await,
                _ => Err(HandlerError::MissingParameter("student_id".to_string())),
            },
            other => {
                debug!(action = other, "Unknown student postback");
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
        match spec.name {
            "id" => {
                let id = param(params, "student_id").unwrap_or_default();
                if !is_student_id(id) {
                    return Err(HandlerError::InvalidParameter {
                        name: "student_id".to_string(),
                        reason: "expected 8 or 9 digits".to_string(),
                    });
                }
                self.by_id(ctx, id).await
            }
            "search" => self.by_name(ctx, param(params, "name").unwrap_or_default()).await,
            _ => {
                let raw = param(params, "year").unwrap_or_default();
                let Ok(year) = raw.parse::<i32>() else {
                    return Err(HandlerError::InvalidParameter {
                        name: "year".to_string(),
                        reason: format!("'{}' is not a year", raw),
                    });
                };
                match param(params, "department").and_then(department_code) {
                    Some(code) => self.cohort(ctx, normalize_year(year), code).await,
                    None => self.year(raw),
                }
            }
        }
    }
}
