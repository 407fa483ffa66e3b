//! Intent parsing on top of an [`LlmClient`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::llm::{LlmClient, ToolCall, ToolRequest, ToolSpec};
use super::{IntentParser, NluError, NluOutcome, ParsedIntent};
use crate::context::RequestContext;
use crate::handlers::{IntentSpec, Params};
use crate::metrics::Metrics;

/// Pseudo-module whose `message` is shown to the user as is.
pub const DIRECT_REPLY: &str = "direct_reply";

const EXPAND_QUERY: &str = "expand_query";
const MAX_EXPANSIONS: usize = 5;
const TOOL_SEPARATOR: &str = "__";

const INTENT_PROMPT: &str = "You route messages sent to a university campus assistant on a chat \
platform. Users write in Traditional Chinese or English. Call exactly one function. Use the \
search functions when the user looks for students, staff contacts, courses or academic programs. \
Use direct_reply for greetings, thanks, clarifying questions or anything the functions cannot \
answer; reply in the user's language and keep it short.";

const EXPAND_PROMPT: &str = "You help search a university course catalogue. Given a user's \
description of what they want to learn, call expand_query with up to five short search phrases \
(course-title style, Traditional Chinese preferred) that are likely to appear in matching course \
titles.";

/// One `(module, intent)` pair offered to the model.
#[derive(Debug, Clone, Copy)]
pub struct IntentSignature {
    pub module: &'static str,
    pub spec: &'static IntentSpec,
}

impl IntentSignature {
    pub fn new(module: &'static str, spec: &'static IntentSpec) -> Self {
        Self { module, spec }
    }

    fn tool_name(&self) -> String {
        format!("{}{}{}", self.module, TOOL_SEPARATOR, self.spec.name)
    }

    fn tool(&self) -> ToolSpec {
        ToolSpec::new(
            self.tool_name(),
            self.spec.description,
            ToolSpec::string_params(self.spec.required, self.spec.optional),
        )
    }
}

fn direct_reply_tool() -> ToolSpec {
    ToolSpec::new(
        DIRECT_REPLY,
        "Answer the user directly without looking anything up",
        ToolSpec::string_params(&["message"], &[]),
    )
}

fn expand_tool() -> ToolSpec {
    ToolSpec::new(
        EXPAND_QUERY,
        "Search phrases for the course catalogue",
        json!({
            "type": "object",
            "properties": {
                "queries": {
                    "type": "array",
                    "items": { "type": "string" },
                    "maxItems": MAX_EXPANSIONS,
                }
            },
            "required": ["queries"],
        }),
    )
}

/// Flatten a JSON arguments object into string parameters. Nulls are
/// dropped; non-string scalars are rendered as JSON.
fn to_params(arguments: &Value) -> Result<Params, NluError> {
    let object = arguments
        .as_object()
        .ok_or_else(|| NluError::InvalidOutput(format!("arguments are not an object: {}", arguments)))?;
    let mut params = Params::new();
    for (key, value) in object {
        let value = match value {
            Value::Null => continue,
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        params.insert(key.clone(), value);
    }
    Ok(params)
}

/// Parser backed by one LLM provider with a forced tool call.
pub struct LlmIntentParser {
    client: Arc<dyn LlmClient>,
    catalogue: Vec<IntentSignature>,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl LlmIntentParser {
    pub fn new(
        client: Arc<dyn LlmClient>,
        catalogue: Vec<IntentSignature>,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            catalogue,
            timeout,
            metrics,
        }
    }

    fn record(&self, outcome: &str) {
        self.metrics
            .nlu_calls
            .with_label_values(&[self.client.provider(), outcome])
            .inc();
    }

    async fn call(&self, ctx: &RequestContext, request: ToolRequest) -> Result<ToolCall, NluError> {
        let timeout = ctx
            .remaining()
            .map_or(self.timeout, |left| left.min(self.timeout));
        let result = ctx
            .guard(self.client.call_tool(request.with_timeout(timeout)))
            .await;
        match result {
            Ok(Ok(call)) => Ok(call),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(e.into()),
        }
    }

    fn interpret(&self, call: ToolCall) -> Result<NluOutcome, NluError> {
        if call.name == DIRECT_REPLY {
            let message = call
                .arguments
                .get("message")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .ok_or_else(|| NluError::InvalidOutput("direct_reply without message".to_string()))?;
            return Ok(NluOutcome::DirectReply(message.to_string()));
        }

        let signature = self
            .catalogue
            .iter()
            .find(|s| s.tool_name() == call.name)
            .ok_or_else(|| NluError::UnknownFunction(call.name.clone()))?;
        Ok(NluOutcome::Intent(ParsedIntent {
            module: signature.module.to_string(),
            intent: signature.spec.name.to_string(),
            params: to_params(&call.arguments)?,
        }))
    }
}

#[async_trait]
impl IntentParser for LlmIntentParser {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn parse(&self, ctx: &RequestContext, text: &str) -> Result<NluOutcome, NluError> {
        let mut tools: Vec<ToolSpec> = self.catalogue.iter().map(IntentSignature::tool).collect();
        tools.push(direct_reply_tool());
        let request = ToolRequest::new(INTENT_PROMPT, text, tools);

        let outcome = match self.call(ctx, request).await {
            Ok(call) => self.interpret(call),
            Err(e) => Err(e),
        };
        match &outcome {
            Ok(NluOutcome::Intent(intent)) => {
                debug!(provider = self.client.provider(), module = %intent.module, intent = %intent.intent, "Parsed intent");
                self.record("intent");
            }
            Ok(NluOutcome::DirectReply(_)) => self.record("direct_reply"),
            Err(e) => {
                warn!(provider = self.client.provider(), error = %e, "Intent parsing failed");
                self.record(e.classification());
            }
        }
        outcome
    }

    async fn expand_query(
        &self,
        ctx: &RequestContext,
        query: &str,
    ) -> Result<Vec<String>, NluError> {
        let request = ToolRequest::new(EXPAND_PROMPT, query, vec![expand_tool()]);
        let call = match self.call(ctx, request).await {
            Ok(call) => call,
            Err(e) => {
                self.record(e.classification());
                return Err(e);
            }
        };
        let Some(items) = call.arguments.get("queries").and_then(Value::as_array) else {
            self.record("invalid_output");
            return Err(NluError::InvalidOutput(format!(
                "expand_query without queries: {}",
                call.arguments
            )));
        };
        self.record("expanded");
        Ok(items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .take(MAX_EXPANSIONS)
            .map(str::to_string)
            .collect())
    }
}

/// Tries each provider in order and returns the first success.
pub struct FallbackParser {
    parsers: Vec<Arc<dyn IntentParser>>,
}

impl FallbackParser {
    pub fn new(parsers: Vec<Arc<dyn IntentParser>>) -> Self {
        Self { parsers }
    }
}

#[async_trait]
impl IntentParser for FallbackParser {
    fn is_enabled(&self) -> bool {
        self.parsers.iter().any(|p| p.is_enabled())
    }

    async fn parse(&self, ctx: &RequestContext, text: &str) -> Result<NluOutcome, NluError> {
        let mut last = NluError::Disabled;
        for parser in self.parsers.iter().filter(|p| p.is_enabled()) {
            match parser.parse(ctx, text).await {
                Ok(outcome) => return Ok(outcome),
                // The request itself is out of time; other providers cannot help.
                Err(e @ NluError::Context(_)) => return Err(e),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    async fn expand_query(
        &self,
        ctx: &RequestContext,
        query: &str,
    ) -> Result<Vec<String>, NluError> {
        let mut last = NluError::Disabled;
        for parser in self.parsers.iter().filter(|p| p.is_enabled()) {
            match parser.expand_query(ctx, query).await {
                Ok(queries) => return Ok(queries),
                Err(e @ NluError::Context(_)) => return Err(e),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nlu::LlmError;
    use std::sync::Mutex;

    static SEARCH_SPEC: IntentSpec = IntentSpec {
        name: "search",
        description: "Search courses",
        required: &["keyword"],
        optional: &["year"],
    };

    /// Replays canned tool calls and records the offered tools.
    struct ScriptedClient {
        replies: Mutex<Vec<Result<ToolCall, LlmError>>>,
        offered: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Result<ToolCall, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                offered: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        fn provider(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "test"
        }

        async fn call_tool(&self, request: ToolRequest) -> Result<ToolCall, LlmError> {
            *self.offered.lock().unwrap() = request.tools.iter().map(|t| t.name.clone()).collect();
            self.replies.lock().unwrap().remove(0)
        }
    }

    fn parser(client: Arc<ScriptedClient>) -> LlmIntentParser {
        LlmIntentParser::new(
            client,
            vec![IntentSignature::new("course", &SEARCH_SPEC)],
            Duration::from_secs(5),
            Arc::new(Metrics::new().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_parse_intent_with_params() {
        let client = ScriptedClient::new(vec![Ok(ToolCall {
            name: "course__search".to_string(),
            arguments: json!({"keyword": "微積分", "year": 112, "note": null}),
        })]);
        let parser = parser(Arc::clone(&client));

        let outcome = parser
            .parse(&RequestContext::background(), "我想找微積分")
            .await
            .unwrap();
        let NluOutcome::Intent(intent) = outcome else {
            panic!("expected intent");
        };
        assert_eq!(intent.module, "course");
        assert_eq!(intent.intent, "search");
        assert_eq!(intent.params.get("keyword").map(String::as_str), Some("微積分"));
        assert_eq!(intent.params.get("year").map(String::as_str), Some("112"));
        assert!(!intent.params.contains_key("note"));
        assert_eq!(
            *client.offered.lock().unwrap(),
            vec!["course__search".to_string(), DIRECT_REPLY.to_string()]
        );
    }

    #[tokio::test]
    async fn test_direct_reply_and_unknown_function() {
        let client = ScriptedClient::new(vec![
            Ok(ToolCall {
                name: DIRECT_REPLY.to_string(),
                arguments: json!({"message": "你好！"}),
            }),
            Ok(ToolCall {
                name: "weather__today".to_string(),
                arguments: json!({}),
            }),
        ]);
        let parser = parser(client);
        let ctx = RequestContext::background();

        assert_eq!(
            parser.parse(&ctx, "hi").await.unwrap(),
            NluOutcome::DirectReply("你好！".to_string())
        );
        assert!(matches!(
            parser.parse(&ctx, "天氣").await,
            Err(NluError::UnknownFunction(name)) if name == "weather__today"
        ));
    }

    #[tokio::test]
    async fn test_expand_query_caps_results() {
        let client = ScriptedClient::new(vec![Ok(ToolCall {
            name: EXPAND_QUERY.to_string(),
            arguments: json!({"queries": ["機器學習", " ", "深度學習", "人工智慧", "資料探勘", "統計", "神經網路"]}),
        })]);
        let queries = parser(client)
            .expand_query(&RequestContext::background(), "AI")
            .await
            .unwrap();
        assert_eq!(queries.len(), MAX_EXPANSIONS);
        assert_eq!(queries[0], "機器學習");
        assert_eq!(queries[1], "深度學習");
    }

    #[tokio::test]
    async fn test_fallback_uses_next_provider() {
        let failing = ScriptedClient::new(vec![Err(LlmError::Http("down".into()))]);
        let working = ScriptedClient::new(vec![Ok(ToolCall {
            name: DIRECT_REPLY.to_string(),
            arguments: json!({"message": "hello"}),
        })]);
        let fallback = FallbackParser::new(vec![
            Arc::new(parser(failing)) as Arc<dyn IntentParser>,
            Arc::new(parser(working)),
        ]);
        assert!(fallback.is_enabled());
        assert_eq!(
            fallback.parse(&RequestContext::background(), "hi").await.unwrap(),
            NluOutcome::DirectReply("hello".to_string())
        );
    }
}
