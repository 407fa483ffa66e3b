//! Configuration: TOML file, environment overrides and validation.

mod loader;
mod types;
mod validate;

use std::path::PathBuf;

pub use loader::{load_config, load_config_from_str, PLATFORM_ENV};
pub use types::*;
pub use validate::{validate_config, ConfigMode};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {0:?} does not exist")]
    FileNotFound(PathBuf),

    #[error("invalid configuration: {0}")]
    ParseError(String),

    #[error("{0}")]
    ValidationError(String),
}
