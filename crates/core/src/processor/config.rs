//! Configuration for the request pipeline.

use std::time::Duration;

use crate::config::{Config, EnvelopeConfig};

/// Texts answered with the help reply before dispatch.
pub const HELP_KEYWORDS: &[&str] = &["help", "幫助", "說明", "使用說明", "功能", "指令", "?"];

/// Settings the processor reads on every event.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Processing-scope deadline for one event.
    pub webhook_timeout: Duration,

    /// Longest accepted text input, in codepoints.
    pub max_input_chars: usize,

    /// Reply limits.
    pub envelope: EnvelopeConfig,

    /// Display name of the bot, used in help texts.
    pub bot_name: String,
}

impl ProcessorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            webhook_timeout: Duration::from_secs(config.server.webhook_timeout_secs),
            max_input_chars: config.server.max_input_chars,
            envelope: config.envelope,
            bot_name: config
                .line
                .as_ref()
                .and_then(|l| l.bot_name.clone())
                .unwrap_or_else(default_bot_name),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

fn default_bot_name() -> String {
    "校園小幫手".to_string()
}

/// Exact (case-insensitive) match against [`HELP_KEYWORDS`].
pub fn is_help_keyword(text: &str) -> bool {
    HELP_KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(text))
}
