//! Query handlers, one per domain module.
//!
//! A handler claims messages by leading keyword, answers postbacks routed
//! to its module, and optionally exposes an intent catalogue for NLU
//! dispatch. Every handler answers from the store first and scrapes only
//! on a miss.

mod contact;
mod course;
mod keyword;
mod program;
mod search;
mod semester;
mod smart;
mod student;

pub use contact::{ContactHandler, EMERGENCY_NUMBERS};
pub use course::{CourseHandler, MAX_COURSE_RESULTS};
pub use keyword::{extract_search_term, KeywordMatcher};
pub use program::ProgramHandler;
pub use search::{two_tier, union_by_key};
pub use semester::{calendar_semesters, SemesterDetector};
pub use smart::{relevance_badge, tokenize, Bm25Index, ScoredCourse, SmartSearch};
pub use student::{check_year, department_code, department_name, StudentHandler, YearCheck, DEPARTMENTS};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::adapters::AdapterError;
use crate::clock::Clock;
use crate::config::EnvelopeConfig;
use crate::context::{ContextError, RequestContext};
use crate::fetcher::{Fetch, FetchError};
use crate::metrics::Metrics;
use crate::nlu::IntentSignature;
use crate::postback::{Postback, PostbackError};
use crate::reply::Message;
use crate::store::{Store, StoreError};

/// Intent parameters as produced by the NLU adapter.
pub type Params = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("upstream error: {0}")]
    Upstream(#[from] AdapterError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("unknown intent '{intent}' for module '{module}'")]
    UnknownIntent { module: String, intent: String },

    #[error("missing parameter '{0}'")]
    MissingParameter(String),

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("cannot build reply: {0}")]
    Postback(#[from] PostbackError),
}

impl HandlerError {
    /// Stable label for metrics and reply selection.
    pub fn classification(&self) -> &'static str {
        match self {
            HandlerError::Store(_) => "store",
            HandlerError::Upstream(AdapterError::Fetch(FetchError::Canceled))
            | HandlerError::Context(ContextError::Canceled) => "canceled",
            HandlerError::Upstream(AdapterError::Fetch(FetchError::Timeout))
            | HandlerError::Context(ContextError::DeadlineExceeded) => "timeout",
            HandlerError::Upstream(_) => "upstream",
            HandlerError::UnknownIntent { .. } => "unknown_intent",
            HandlerError::MissingParameter(_) => "missing_parameter",
            HandlerError::InvalidParameter { .. } => "invalid_parameter",
            HandlerError::Postback(_) => "postback",
        }
    }
}

/// One operation a handler exposes to NLU dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntentSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

impl IntentSpec {
    /// Reject absent or blank required parameters.
    pub fn validate(&self, params: &Params) -> Result<(), HandlerError> {
        for name in self.required {
            let present = params.get(*name).is_some_and(|v| !v.trim().is_empty());
            if !present {
                return Err(HandlerError::MissingParameter(name.to_string()));
            }
        }
        Ok(())
    }
}

/// Look up `intent` in a catalogue and validate its parameters.
pub fn resolve_intent<'a>(
    module: &str,
    catalogue: &'a [IntentSpec],
    intent: &str,
    params: &Params,
) -> Result<&'a IntentSpec, HandlerError> {
    let spec = catalogue
        .iter()
        .find(|s| s.name == intent)
        .ok_or_else(|| HandlerError::UnknownIntent {
            module: module.to_string(),
            intent: intent.to_string(),
        })?;
    spec.validate(params)?;
    Ok(spec)
}

/// Trimmed parameter value, if present and non-empty.
pub fn param<'a>(params: &'a Params, name: &str) -> Option<&'a str> {
    params
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

/// Capabilities of a domain handler.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Module name used for postback routing and NLU dispatch.
    fn module(&self) -> &'static str;

    /// Whether this handler claims a (sanitized) message.
    fn can_handle(&self, text: &str) -> bool;

    async fn handle_message(
        &self,
        ctx: &RequestContext,
        text: &str,
    ) -> Result<Vec<Message>, HandlerError>;

    async fn handle_postback(
        &self,
        ctx: &RequestContext,
        postback: &Postback,
    ) -> Result<Vec<Message>, HandlerError>;

    /// Intents this handler accepts from the NLU adapter.
    fn intents(&self) -> &'static [IntentSpec] {
        &[]
    }

    async fn dispatch_intent(
        &self,
        _ctx: &RequestContext,
        intent: &str,
        _params: &Params,
    ) -> Result<Vec<Message>, HandlerError> {
        Err(HandlerError::UnknownIntent {
            module: self.module().to_string(),
            intent: intent.to_string(),
        })
    }
}

/// Shared collaborators of every handler.
#[derive(Clone)]
pub struct HandlerDeps {
    pub store: Arc<dyn Store>,
    pub fetch: Arc<dyn Fetch>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<Metrics>,
    pub envelope: EnvelopeConfig,
}

impl HandlerDeps {
    /// Count a cache lookup.
    pub(crate) fn record_lookup(&self, kind: &str, hit: bool) {
        self.metrics
            .cache_lookups
            .with_label_values(&[kind, if hit { "hit" } else { "miss" }])
            .inc();
    }
}

/// Every handler intent, in registration order. Fed to the NLU adapter
/// as its closed function set.
pub fn intent_catalogue() -> Vec<IntentSignature> {
    [
        (student::MODULE, student::INTENTS),
        (contact::MODULE, contact::INTENTS),
        (course::MODULE, course::INTENTS),
        (program::MODULE, program::INTENTS),
    ]
    .into_iter()
    .flat_map(|(module, intents)| intents.iter().map(move |spec| IntentSignature::new(module, spec)))
    .collect()
}

/// Reply for a completed lookup with nothing found.
pub(crate) fn not_found(what: &str, term: &str) -> Vec<Message> {
    vec![Message::text(format!(
        "找不到與「{}」相關的{}，請換個關鍵字再試一次。",
        term, what
    ))]
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOGUE: &[IntentSpec] = &[IntentSpec {
        name: "search",
        description: "search",
        required: &["keyword"],
        optional: &[],
    }];

    #[test]
    fn test_resolve_intent() {
        let mut params = Params::new();
        params.insert("keyword".into(), "微積分".into());
        assert!(resolve_intent("course", CATALOGUE, "search", &params).is_ok());

        let err = resolve_intent("course", CATALOGUE, "fly", &params).unwrap_err();
        assert!(matches!(err, HandlerError::UnknownIntent { .. }));
        assert_eq!(err.classification(), "unknown_intent");
    }

    #[test]
    fn test_blank_required_parameter_is_missing() {
        let mut params = Params::new();
        params.insert("keyword".into(), "  ".into());
        match resolve_intent("course", CATALOGUE, "search", &params) {
            Err(HandlerError::MissingParameter(name)) => assert_eq!(name, "keyword"),
            other => panic!("expected MissingParameter, got {:?}", other),
        }
    }

    #[test]
    fn test_upstream_classification() {
        let timeout = HandlerError::Upstream(AdapterError::Fetch(FetchError::Timeout));
        assert_eq!(timeout.classification(), "timeout");
        let down = HandlerError::Upstream(AdapterError::Fetch(FetchError::AllMirrorsFailed(
            "lms".into(),
        )));
        assert_eq!(down.classification(), "upstream");
    }

    #[test]
    fn test_intent_catalogue_has_unique_pairs() {
        let catalogue = intent_catalogue();
        let pairs: std::collections::HashSet<(&str, &str)> =
            catalogue.iter().map(|s| (s.module, s.spec.name)).collect();
        assert_eq!(pairs.len(), catalogue.len());
        assert!(pairs.contains(&("course", "historical")));
        assert!(pairs.contains(&("contact", "emergency")));
    }
}
