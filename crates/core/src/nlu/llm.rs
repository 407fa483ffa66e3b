//! LLM client abstraction with forced tool calls.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Error type for LLM operations.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("model did not call a tool")]
    NoToolCall,

    #[error("Not configured")]
    NotConfigured,
}

/// A callable function offered to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Schema with string properties, `required` listing the mandatory ones.
    pub fn string_params(required: &[&str], optional: &[&str]) -> Value {
        let mut properties = serde_json::Map::new();
        for name in required.iter().chain(optional) {
            properties.insert((*name).to_string(), json!({ "type": "string" }));
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Request for a forced tool call.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub system: String,
    pub prompt: String,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl ToolRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>, tools: Vec<ToolSpec>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            tools,
            max_tokens: 512,
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// The tool the model chose and its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// Trait for LLM clients.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider name (e.g., "anthropic", "openai")
    fn provider(&self) -> &str;

    fn model(&self) -> &str;

    /// Ask the model to answer by calling exactly one of `request.tools`.
    async fn call_tool(&self, request: ToolRequest) -> Result<ToolCall, LlmError>;
}

fn http_error(e: reqwest::Error, timeout: Duration) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(timeout)
    } else {
        LlmError::Http(e.to_string())
    }
}

// ============================================================================
// Anthropic Implementation
// ============================================================================

/// Anthropic Messages API client.
pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_base: String,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            api_base: "https://api.anthropic.com".to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<AnthropicMessage>,
    tools: Vec<AnthropicTool>,
    tool_choice: Value,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContent {
    ToolUse { name: String, input: Value },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn provider(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call_tool(&self, request: ToolRequest) -> Result<ToolCall, LlmError> {
        let body = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens,
            system: request.system,
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: request.prompt,
            }],
            tools: request
                .tools
                .into_iter()
                .map(|t| AnthropicTool {
                    name: t.name,
                    description: t.description,
                    input_schema: t.parameters,
                })
                .collect(),
            tool_choice: json!({ "type": "any" }),
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| http_error(e, request.timeout))?;

        let status = response.status().as_u16();
        if status != 200 {
            let error_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<AnthropicError>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);
            return Err(LlmError::Api { status, message });
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Json(e.to_string()))?;

        parsed
            .content
            .into_iter()
            .find_map(|c| match c {
                AnthropicContent::ToolUse { name, input } => Some(ToolCall {
                    name,
                    arguments: input,
                }),
                AnthropicContent::Other => None,
            })
            .ok_or(LlmError::NoToolCall)
    }
}

// ============================================================================
// OpenAI-compatible Implementation
// ============================================================================

/// Chat-completions client for OpenAI and compatible servers (Ollama,
/// hosted gateways). The API key is optional for local servers.
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    api_base: String,
}

impl OpenAiClient {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: None,
            model: model.into(),
            api_base: "https://api.openai.com/v1".to_string(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Base URL including the version segment, e.g. `http://localhost:11434/v1`.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
    tools: Vec<ChatTool>,
    tool_choice: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ChatFunction,
}

#[derive(Debug, Serialize)]
struct ChatFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    tool_calls: Vec<ChatToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChatToolCall {
    function: ChatFunctionCall,
}

#[derive(Debug, Deserialize)]
struct ChatFunctionCall {
    name: String,
    /// JSON-encoded arguments object.
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatError {
    error: ChatErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ChatErrorDetail {
    message: String,
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn provider(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call_tool(&self, request: ToolRequest) -> Result<ToolCall, LlmError> {
        let body = ChatRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: request.system,
                },
                ChatMessage {
                    role: "user",
                    content: request.prompt,
                },
            ],
            tools: request
                .tools
                .into_iter()
                .map(|t| ChatTool {
                    kind: "function",
                    function: ChatFunction {
                        name: t.name,
                        description: t.description,
                        parameters: t.parameters,
                    },
                })
                .collect(),
            tool_choice: "required",
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .header("content-type", "application/json")
            .timeout(request.timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| http_error(e, request.timeout))?;

        let status = response.status().as_u16();
        if status != 200 {
            let error_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ChatError>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);
            return Err(LlmError::Api { status, message });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Json(e.to_string()))?;

        let call = parsed
            .choices
            .into_iter()
            .flat_map(|c| c.message.tool_calls)
            .next()
            .ok_or(LlmError::NoToolCall)?;
        let arguments = serde_json::from_str(&call.function.arguments)
            .map_err(|e| LlmError::Json(format!("{}: {}", e, call.function.arguments)))?;
        Ok(ToolCall {
            name: call.function.name,
            arguments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_params_schema() {
        let schema = ToolSpec::string_params(&["keyword"], &["year"]);
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["keyword"]["type"], "string");
        assert_eq!(schema["properties"]["year"]["type"], "string");
        assert_eq!(schema["required"], json!(["keyword"]));
    }

    #[test]
    fn test_anthropic_tool_use_deserialization() {
        let body = r#"{
            "content": [
                {"type": "text", "text": "thinking"},
                {"type": "tool_use", "id": "t1", "name": "course__search", "input": {"keyword": "微積分"}}
            ]
        }"#;
        let parsed: AnthropicResponse = serde_json::from_str(body).unwrap();
        assert!(matches!(
            &parsed.content[1],
            AnthropicContent::ToolUse { name, .. } if name == "course__search"
        ));
    }

    #[test]
    fn test_chat_request_serialization() {
        let body = ChatRequest {
            model: "llama3".to_string(),
            max_tokens: 100,
            messages: vec![ChatMessage {
                role: "user",
                content: "hi".to_string(),
            }],
            tools: vec![ChatTool {
                kind: "function",
                function: ChatFunction {
                    name: "direct_reply".to_string(),
                    description: "reply".to_string(),
                    parameters: ToolSpec::string_params(&["message"], &[]),
                },
            }],
            tool_choice: "required",
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"type\":\"function\""));
        assert!(json.contains("\"tool_choice\":\"required\""));
    }

    #[test]
    fn test_openai_client_custom_base() {
        let client = OpenAiClient::new("llama3").with_api_base("http://localhost:11434/v1/");
        assert_eq!(client.api_base, "http://localhost:11434/v1");
        assert_eq!(client.provider(), "openai");
    }
}
