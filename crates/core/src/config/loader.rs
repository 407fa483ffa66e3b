use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::Path;

use super::{types::Config, ConfigError};

/// Unprefixed variables set by hosting platforms, and the key each one
/// fills in. `UNIBOT_*` variables still win over these.
pub const PLATFORM_ENV: &[(&str, &str)] = &[
    ("PORT", "server.port"),
    ("LINE_CHANNEL_SECRET", "line.channel_secret"),
    ("LINE_CHANNEL_ACCESS_TOKEN", "line.channel_access_token"),
    ("LOG_LEVEL", "log.level"),
];

fn platform_env() -> Env {
    Env::raw().filter_map(|key| {
        PLATFORM_ENV
            .iter()
            .find(|(name, _)| key == *name)
            .map(|(_, path)| (*path).into())
    })
}

/// Layer order: file, platform variables, then `UNIBOT_SECTION__KEY`.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }

    Figment::new()
        .merge(Toml::file(path))
        .merge(platform_env())
        .merge(Env::prefixed("UNIBOT_").split("__").ignore(&["config"]))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Parse a TOML document without consulting the environment.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}
