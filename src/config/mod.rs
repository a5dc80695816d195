//! Configuration module
//!
//! Handles loading and validating the driver configuration

mod settings;

pub use settings::{
    CommandsConfig, ConfigError, LoggingConfig, Mode, PollingConfig, ReconnectConfig, ScaleConfig,
    SerialSettings, TestingConfig, ValidationConfig,
};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "scalelink", "Scalelink").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Default location of `config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

/// Load the configuration from `path`, falling back to the default location.
///
/// When no path is given and no file exists at the default location the
/// built-in defaults are used.
pub fn load(path: Option<PathBuf>) -> Result<ScaleConfig, ConfigError> {
    match path {
        Some(path) => ScaleConfig::load(path),
        None => match default_config_path() {
            Some(path) if path.exists() => ScaleConfig::load(path),
            _ => {
                let config = ScaleConfig::default();
                config.validate()?;
                Ok(config)
            }
        },
    }
}
