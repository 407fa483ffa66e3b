//! Natural-language fallback: turn free text into a handler intent.
//!
//! The processor only consults this when no handler claimed a message by
//! keyword. Parsers are optional; a [`DisabledParser`] stands in when no
//! provider is configured.

mod llm;
mod parser;

pub use llm::{AnthropicClient, LlmClient, LlmError, OpenAiClient, ToolCall, ToolRequest, ToolSpec};
pub use parser::{FallbackParser, IntentSignature, LlmIntentParser, DIRECT_REPLY};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::config::{LlmProvider, NluConfig};
use crate::context::{ContextError, RequestContext};
use crate::handlers::Params;
use crate::metrics::Metrics;

#[derive(Debug, Error)]
pub enum NluError {
    #[error("natural-language parsing is disabled")]
    Disabled,

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("model chose unknown function '{0}'")]
    UnknownFunction(String),

    #[error("invalid model output: {0}")]
    InvalidOutput(String),
}

impl NluError {
    /// Short label for metrics and logs.
    pub fn classification(&self) -> &'static str {
        match self {
            NluError::Disabled => "disabled",
            NluError::Llm(LlmError::Timeout(_)) | NluError::Context(_) => "timeout",
            NluError::Llm(_) => "unreachable",
            NluError::UnknownFunction(_) => "unknown_function",
            NluError::InvalidOutput(_) => "invalid_output",
        }
    }
}

/// A handler intent chosen by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedIntent {
    pub module: String,
    pub intent: String,
    pub params: Params,
}

/// What the parser made of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NluOutcome {
    Intent(ParsedIntent),
    /// Greeting, clarification or off-topic answer to show verbatim.
    DirectReply(String),
}

#[async_trait]
pub trait IntentParser: Send + Sync {
    fn is_enabled(&self) -> bool;

    async fn parse(&self, ctx: &RequestContext, text: &str) -> Result<NluOutcome, NluError>;

    /// Related search phrasings for ranked retrieval.
    async fn expand_query(&self, ctx: &RequestContext, query: &str)
        -> Result<Vec<String>, NluError>;
}

/// Parser used when no provider is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledParser;

#[async_trait]
impl IntentParser for DisabledParser {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn parse(&self, _ctx: &RequestContext, _text: &str) -> Result<NluOutcome, NluError> {
        Err(NluError::Disabled)
    }

    async fn expand_query(
        &self,
        _ctx: &RequestContext,
        _query: &str,
    ) -> Result<Vec<String>, NluError> {
        Err(NluError::Disabled)
    }
}

/// Build the configured parser chain. Providers missing a required key
/// are skipped with a warning.
pub fn create_parser(
    config: Option<&NluConfig>,
    catalogue: Vec<IntentSignature>,
    metrics: Arc<Metrics>,
) -> Arc<dyn IntentParser> {
    let Some(config) = config else {
        return Arc::new(DisabledParser);
    };
    let timeout = std::time::Duration::from_secs(config.timeout_secs);

    let mut parsers: Vec<Arc<dyn IntentParser>> = Vec::new();
    for provider in &config.providers {
        let client: Arc<dyn LlmClient> = match provider.provider {
            LlmProvider::Anthropic => {
                let Some(key) = &provider.api_key else {
                    warn!(model = %provider.model, "Anthropic provider has no api_key; skipping");
                    continue;
                };
                let mut client = AnthropicClient::new(key.clone(), provider.model.clone());
                if let Some(base) = &provider.api_base {
                    client = client.with_api_base(base.clone());
                }
                Arc::new(client)
            }
            LlmProvider::OpenAi => {
                let mut client = OpenAiClient::new(provider.model.clone());
                if let Some(key) = &provider.api_key {
                    client = client.with_api_key(key.clone());
                }
                if let Some(base) = &provider.api_base {
                    client = client.with_api_base(base.clone());
                }
                Arc::new(client)
            }
        };
        parsers.push(Arc::new(LlmIntentParser::new(
            client,
            catalogue.clone(),
            timeout,
            Arc::clone(&metrics),
        )));
    }

    match parsers.len() {
        0 => Arc::new(DisabledParser),
        1 => parsers.remove(0),
        _ => Arc::new(FallbackParser::new(parsers)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmProviderConfig;

    #[tokio::test]
    async fn test_disabled_parser() {
        let parser = DisabledParser;
        assert!(!parser.is_enabled());
        let err = parser
            .parse(&RequestContext::background(), "hello")
            .await
            .unwrap_err();
        assert_eq!(err.classification(), "disabled");
    }

    #[test]
    fn test_create_parser_skips_keyless_anthropic() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let config = NluConfig {
            providers: vec![LlmProviderConfig {
                provider: LlmProvider::Anthropic,
                api_key: None,
                model: "claude-3-5-haiku-latest".to_string(),
                api_base: None,
            }],
            timeout_secs: 5,
        };
        assert!(!create_parser(Some(&config), Vec::new(), Arc::clone(&metrics)).is_enabled());
        assert!(!create_parser(None, Vec::new(), metrics).is_enabled());
    }

    #[test]
    fn test_create_parser_openai_needs_no_key() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let config = NluConfig {
            providers: vec![LlmProviderConfig {
                provider: LlmProvider::OpenAi,
                api_key: None,
                model: "llama3".to_string(),
                api_base: Some("http://localhost:11434/v1".to_string()),
            }],
            timeout_secs: 5,
        };
        assert!(create_parser(Some(&config), Vec::new(), metrics).is_enabled());
    }
}
