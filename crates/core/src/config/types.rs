use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Messaging platform credentials (required by `server`, not by `warmup`)
    #[serde(default)]
    pub line: Option<LineConfig>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub warmup: WarmupConfig,
    #[serde(default)]
    pub nlu: Option<NluConfig>,
    #[serde(default)]
    pub smart_search: SmartSearchConfig,
    #[serde(default)]
    pub envelope: EnvelopeConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            line: None,
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            scraper: ScraperConfig::default(),
            limits: LimitsConfig::default(),
            warmup: WarmupConfig::default(),
            nlu: None,
            smart_search: SmartSearchConfig::default(),
            envelope: EnvelopeConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Processing deadline for one webhook event. Keep it a few seconds
    /// below the platform's reply-token validity window.
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_secs: u64,
    /// Upper bound on graceful shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Maximum accepted text length (codepoints).
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            webhook_timeout_secs: default_webhook_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    10000
}

fn default_webhook_timeout() -> u64 {
    25
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_max_input_chars() -> usize {
    200
}

/// Messaging platform credentials
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LineConfig {
    pub channel_secret: String,
    pub channel_access_token: String,
    #[serde(default = "default_line_api_base")]
    pub api_base: String,
    /// Display name used when detecting `@` mentions of the bot.
    #[serde(default)]
    pub bot_name: Option<String>,
}

fn default_line_api_base() -> String {
    "https://api.line.me".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("unibot.db")
}

/// Per-entity-class freshness windows
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_entity_ttl_hours")]
    pub student_ttl_hours: u64,
    #[serde(default = "default_entity_ttl_hours")]
    pub contact_ttl_hours: u64,
    #[serde(default = "default_entity_ttl_hours")]
    pub course_ttl_hours: u64,
    #[serde(default = "default_historical_ttl_hours")]
    pub historical_course_ttl_hours: u64,
    /// Interval of the background stale-row sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            student_ttl_hours: default_entity_ttl_hours(),
            contact_ttl_hours: default_entity_ttl_hours(),
            course_ttl_hours: default_entity_ttl_hours(),
            historical_course_ttl_hours: default_historical_ttl_hours(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_entity_ttl_hours() -> u64 {
    168 // 7 days
}

fn default_historical_ttl_hours() -> u64 {
    24
}

fn default_sweep_interval() -> u64 {
    3600
}

/// Upstream scraping policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScraperConfig {
    /// Aggregate upstream request rate (tokens per second).
    #[serde(default = "default_scraper_rate")]
    pub requests_per_second: f64,
    /// Burst size of the upstream token bucket.
    #[serde(default = "default_scraper_burst")]
    pub burst: u32,
    /// How long a caller may wait for an upstream token.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Hard ceiling on the whole retry loop.
    #[serde(default = "default_retry_budget")]
    pub retry_budget_secs: u64,
    /// Timeout of one HTTP attempt.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Concurrent adapter requests during warm-up.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// User agents to rotate through (built-in pool when empty).
    #[serde(default)]
    pub user_agents: Vec<String>,
    /// Logical endpoint name -> ordered mirror base URLs.
    #[serde(default = "default_endpoints")]
    pub endpoints: BTreeMap<String, Vec<String>>,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_scraper_rate(),
            burst: default_scraper_burst(),
            acquire_timeout_ms: default_acquire_timeout(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff(),
            max_backoff_ms: default_max_backoff(),
            retry_budget_secs: default_retry_budget(),
            request_timeout_secs: default_request_timeout(),
            parallelism: default_parallelism(),
            user_agents: Vec::new(),
            endpoints: default_endpoints(),
        }
    }
}

fn default_scraper_rate() -> f64 {
    2.0
}

fn default_scraper_burst() -> u32 {
    5
}

fn default_acquire_timeout() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    8000
}

fn default_retry_budget() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    15
}

fn default_parallelism() -> usize {
    4
}

fn default_endpoints() -> BTreeMap<String, Vec<String>> {
    let mut endpoints = BTreeMap::new();
    endpoints.insert(
        "lms".to_string(),
        vec![
            "https://lms.example.edu.tw".to_string(),
            "http://lms.example.edu.tw".to_string(),
        ],
    );
    endpoints.insert(
        "sea".to_string(),
        vec![
            "https://sea.example.edu.tw".to_string(),
            "http://sea.example.edu.tw".to_string(),
        ],
    );
    endpoints.insert(
        "course".to_string(),
        vec![
            "https://sea.example.edu.tw".to_string(),
            "http://sea.example.edu.tw".to_string(),
        ],
    );
    endpoints.insert(
        "program".to_string(),
        vec!["https://www.example.edu.tw".to_string()],
    );
    endpoints
}

/// Admission limiter parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default = "default_chat_burst")]
    pub chat_burst: u32,
    /// Seconds to refill one per-chat token.
    #[serde(default = "default_chat_refill")]
    pub chat_refill_secs: f64,
    #[serde(default = "default_llm_burst")]
    pub llm_burst: u32,
    #[serde(default = "default_llm_refill")]
    pub llm_refill_secs: f64,
    /// Maximum LLM calls per chat in a sliding 24h window.
    #[serde(default = "default_llm_daily")]
    pub llm_daily: u32,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            chat_burst: default_chat_burst(),
            chat_refill_secs: default_chat_refill(),
            llm_burst: default_llm_burst(),
            llm_refill_secs: default_llm_refill(),
            llm_daily: default_llm_daily(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_chat_burst() -> u32 {
    6
}

fn default_chat_refill() -> f64 {
    5.0
}

fn default_llm_burst() -> u32 {
    3
}

fn default_llm_refill() -> f64 {
    20.0
}

fn default_llm_daily() -> u32 {
    50
}

fn default_cleanup_interval() -> u64 {
    300
}

/// Bulk ingestion settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WarmupConfig {
    #[serde(default = "default_warmup_modules")]
    pub modules: Vec<String>,
    #[serde(default = "default_warmup_timeout")]
    pub timeout_secs: u64,
    /// Run warm-up in the background when the server starts.
    #[serde(default = "default_true")]
    pub on_startup: bool,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            modules: default_warmup_modules(),
            timeout_secs: default_warmup_timeout(),
            on_startup: true,
        }
    }
}

fn default_warmup_modules() -> Vec<String> {
    ["semester", "contact", "course", "program"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_warmup_timeout() -> u64 {
    1200
}

fn default_true() -> bool {
    true
}

/// NLU providers, tried in order.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NluConfig {
    pub providers: Vec<LlmProviderConfig>,
    #[serde(default = "default_nlu_timeout")]
    pub timeout_secs: u64,
}

fn default_nlu_timeout() -> u64 {
    15
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmProviderConfig {
    pub provider: LlmProvider,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    Anthropic,
    /// Any OpenAI-compatible chat-completions API (OpenAI, Ollama, Groq, ...).
    OpenAi,
}

/// Ranked course search
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmartSearchConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Detached deadline for query expansion + retrieval.
    #[serde(default = "default_smart_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_smart_top_k")]
    pub top_k: usize,
}

impl Default for SmartSearchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: default_smart_timeout(),
            top_k: default_smart_top_k(),
        }
    }
}

fn default_smart_timeout() -> u64 {
    60
}

fn default_smart_top_k() -> usize {
    10
}

/// Platform-imposed reply limits
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct EnvelopeConfig {
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_max_bubbles")]
    pub max_bubbles: usize,
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
    #[serde(default = "default_max_postback_bytes")]
    pub max_postback_bytes: usize,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            max_bubbles: default_max_bubbles(),
            max_text_chars: default_max_text_chars(),
            max_postback_bytes: default_max_postback_bytes(),
        }
    }
}

fn default_max_messages() -> usize {
    5
}

fn default_max_bubbles() -> usize {
    10
}

fn default_max_text_chars() -> usize {
    5000
}

fn default_max_postback_bytes() -> usize {
    300
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info,tower_http=debug".to_string()
}

/// Sanitized config for logging (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<SanitizedLineConfig>,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub scraper: ScraperConfig,
    pub limits: LimitsConfig,
    pub warmup: WarmupConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nlu: Option<Vec<SanitizedLlmProviderConfig>>,
    pub smart_search: SmartSearchConfig,
    pub envelope: EnvelopeConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedLineConfig {
    pub api_base: String,
    pub channel_secret_configured: bool,
    pub channel_access_token_configured: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedLlmProviderConfig {
    pub provider: LlmProvider,
    pub model: String,
    pub api_key_configured: bool,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            line: config.line.as_ref().map(|l| SanitizedLineConfig {
                api_base: l.api_base.clone(),
                channel_secret_configured: !l.channel_secret.is_empty(),
                channel_access_token_configured: !l.channel_access_token.is_empty(),
            }),
            database: config.database.clone(),
            cache: config.cache.clone(),
            scraper: config.scraper.clone(),
            limits: config.limits.clone(),
            warmup: config.warmup.clone(),
            nlu: config.nlu.as_ref().map(|n| {
                n.providers
                    .iter()
                    .map(|p| SanitizedLlmProviderConfig {
                        provider: p.provider,
                        model: p.model.clone(),
                        api_key_configured: p.api_key.as_deref().is_some_and(|k| !k.is_empty()),
                    })
                    .collect()
            }),
            smart_search: config.smart_search.clone(),
            envelope: config.envelope,
        }
    }
}
