//! Academic programs (學程) from the static catalogue.

use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    not_found, param, resolve_intent, two_tier, Handler, HandlerDeps, HandlerError, IntentSpec,
    KeywordMatcher, Params,
};
use crate::adapters::ProgramAdapter;
use crate::context::RequestContext;
use crate::postback::Postback;
use crate::reply::{bubble_reply, Action, Bubble, Message};
use crate::store::{MatchMode, Program};

pub(crate) const MODULE: &str = "program";

const EXACT_FIELDS: &[&str] = &["name"];
const FUZZY_FIELDS: &[&str] = &["name", "category"];

pub(crate) const INTENTS: &[IntentSpec] = &[
    IntentSpec {
        name: "search",
        description: "Search academic programs by name or category",
        required: &["query"],
        optional: &[],
    },
    IntentSpec {
        name: "list",
        description: "List every academic program",
        required: &[],
        optional: &[],
    },
];

pub struct ProgramHandler {
    deps: HandlerDeps,
    adapter: ProgramAdapter,
    keywords: KeywordMatcher,
}

impl ProgramHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self {
            adapter: ProgramAdapter::new(deps.fetch.clone()),
            deps,
            keywords: KeywordMatcher::new(&["學程", "program"]),
        }
    }

    /// Make sure the catalogue is cached. Returns the cached programs.
    async fn ensure_catalogue(&self, ctx: &RequestContext) -> Result<Vec<Program>, HandlerError> {
        let cached = self.deps.store.all_programs()?;
        self.deps.record_lookup(MODULE, !cached.is_empty());
        if !cached.is_empty() {
            return Ok(cached);
        }
        let scraped = self.adapter.catalogue(ctx).await?;
        if !scraped.is_empty() {
            self.deps.store.save_programs(&scraped)?;
            info!(count = scraped.len(), "Cached program catalogue");
        }
        Ok(scraped)
    }

    fn render(&self, programs: Vec<Program>) -> Result<Vec<Message>, HandlerError> {
        let total = programs.len();
        let max_bytes = self.deps.envelope.max_postback_bytes;
        let bubbles = programs
            .iter()
            .map(|p| -> Result<Bubble, HandlerError> {
                let mut bubble = Bubble::new(&p.name)
                    .action(Action::uri("學程介紹", p.detail_url.clone()));
                if let Some(category) = &p.category {
                    let more = Postback::new(MODULE, "category").with_param(category.clone());
                    bubble = bubble
                        .subtitle(category.clone())
                        .action(Action::postback(&format!("更多{}", category), &more, max_bytes)?);
                }
                Ok(bubble)
            })
            .collect::<Result<Vec<_>, HandlerError>>()?;
        Ok(bubble_reply("學程資訊", bubbles, total, &self.deps.envelope))
    }

    async fn list(&self, ctx: &RequestContext) -> Result<Vec<Message>, HandlerError> {
        let programs = self.ensure_catalogue(ctx).await?;
        if programs.is_empty() {
            return Ok(vec![Message::text("目前查不到學程資料，請稍後再試。")]);
        }
        self.render(programs)
    }

    async fn search(&self, ctx: &RequestContext, query: &str) -> Result<Vec<Message>, HandlerError> {
        if self.ensure_catalogue(ctx).await?.is_empty() {
            return Ok(not_found("學程", query));
        }
        let store = &self.deps.store;
        let found = two_tier(
            MODULE,
            &self.deps.metrics,
            || store.search_programs(MatchMode::Exact, EXACT_FIELDS, query),
            || store.search_programs(MatchMode::Fuzzy, FUZZY_FIELDS, query),
            |p: &Program| p.name.clone(),
        )?;
        if found.is_empty() {
            return Ok(not_found("學程", query));
        }
        self.render(found)
    }

    async fn category(&self, ctx: &RequestContext, category: &str) -> Result<Vec<Message>, HandlerError> {
        let programs: Vec<Program> = self
            .ensure_catalogue(ctx)
            .await?
            .into_iter()
            .filter(|p| p.category.as_deref() == Some(category))
            .collect();
        if programs.is_empty() {
            return Ok(not_found("學程", category));
        }
        self.render(programs)
    }
}

#[async_trait]
impl Handler for ProgramHandler {
    fn module(&self) -> &'static str {
        MODULE
    }

    fn can_handle(&self, text: &str) -> bool {
        self.keywords.matches(text)
    }

    async fn handle_message(
        &self,
        ctx: &RequestContext,
        text: &str,
    ) -> Result<Vec<Message>, HandlerError> {
        match self.keywords.strip(text) {
            Some((_, "")) => self.list(ctx).await,
            Some((_, query)) => self.search(ctx, query).await,
            None => Ok(Vec::new()),
        }
    }

    async fn handle_postback(
        &self,
        ctx: &RequestContext,
        postback: &Postback,
    ) -> Result<Vec<Message>, HandlerError> {
        match postback.action.as_str() {
            "list" => self.list(ctx).await,
            "category" => match postback.param(0) {
                Some(c) => self.category(ctx, c).await,
                None => Err(HandlerError::MissingParameter("category".to_string())),
            },
            other => {
                debug!(action = other, "Unknown program postback");
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
            "list" => self.list(ctx).await,
            _ => self.search(ctx, param(params, "query").unwrap_or_default()).await,
        }
    }
}
