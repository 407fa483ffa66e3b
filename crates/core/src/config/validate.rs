use super::{types::Config, ConfigError};
use crate::warmup::WarmupModule;

/// Which entry point the configuration is validated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigMode {
    Server,
    Warmup,
}

/// Validate configuration for the given entry point.
pub fn validate_config(config: &Config, mode: ConfigMode) -> Result<(), ConfigError> {
    if mode == ConfigMode::Server {
        if config.server.port == 0 {
            return Err(invalid("server.port cannot be 0"));
        }
        match &config.line {
            None => return Err(invalid("[line] credentials are required in server mode")),
            Some(line) if line.channel_secret.is_empty() => {
                return Err(invalid("line.channel_secret cannot be empty"))
            }
            Some(line) if line.channel_access_token.is_empty() => {
                return Err(invalid("line.channel_access_token cannot be empty"))
            }
            Some(_) => {}
        }
    }

    if config.server.webhook_timeout_secs == 0 {
        return Err(invalid("server.webhook_timeout_secs cannot be 0"));
    }

    let limits = &config.limits;
    if limits.chat_burst == 0 || limits.llm_burst == 0 {
        return Err(invalid("limiter burst cannot be 0"));
    }
    if limits.chat_refill_secs <= 0.0 || limits.llm_refill_secs <= 0.0 {
        return Err(invalid("limiter refill interval must be positive"));
    }
    if limits.llm_daily == 0 {
        return Err(invalid("limits.llm_daily cannot be 0"));
    }

    let scraper = &config.scraper;
    if scraper.requests_per_second <= 0.0 || scraper.burst == 0 {
        return Err(invalid("scraper rate and burst must be positive"));
    }
    if scraper.max_retries > 10 {
        return Err(invalid("scraper.max_retries cannot exceed 10"));
    }
    for (name, mirrors) in &scraper.endpoints {
        if mirrors.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "scraper endpoint '{}' has no mirrors",
                name
            )));
        }
    }

    for module in &config.warmup.modules {
        if module.parse::<WarmupModule>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "unknown warmup module '{}'",
                module
            )));
        }
    }

    if let Some(nlu) = &config.nlu {
        if nlu.providers.is_empty() {
            return Err(invalid("[nlu] requires at least one provider"));
        }
    }

    Ok(())
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::ValidationError(msg.to_string())
}
