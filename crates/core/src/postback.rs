//! Postback payload codec.
//!
//! A postback is a tagged record `(module, action, params)` serialized as
//! compact JSON: `{"m":"course","a":"detail","p":["1131U0001"]}`. The
//! encoded form must fit the platform's payload limit, which is checked at
//! encode time. Delimiter-joined strings (`course$detail$...`) are not
//! accepted.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PostbackError {
    #[error("postback payload is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },

    #[error("legacy delimiter-based postback payloads are not supported")]
    Legacy,

    #[error("malformed postback payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Postback {
    #[serde(rename = "m")]
    pub module: String,
    #[serde(rename = "a")]
    pub action: String,
    #[serde(rename = "p", default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
}

impl Postback {
    pub fn new(module: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            action: action.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(|p| p.as_str())
    }

    /// Serialize, refusing payloads over `max_bytes`.
    pub fn encode(&self, max_bytes: usize) -> Result<String, PostbackError> {
        let encoded =
            serde_json::to_string(self).map_err(|e| PostbackError::Malformed(e.to_string()))?;
        if encoded.len() > max_bytes {
            return Err(PostbackError::TooLong {
                len: encoded.len(),
                max: max_bytes,
            });
        }
        Ok(encoded)
    }

    pub fn decode(data: &str) -> Result<Self, PostbackError> {
        let data = data.trim();
        if !data.starts_with('{') {
            return Err(if data.contains('$') {
                PostbackError::Legacy
            } else {
                PostbackError::Malformed("expected a JSON object".to_string())
            });
        }
        let postback: Postback =
            serde_json::from_str(data).map_err(|e| PostbackError::Malformed(e.to_string()))?;
        if postback.module.is_empty() {
            return Err(PostbackError::Malformed("empty module".to_string()));
        }
        Ok(postback)
    }
}
