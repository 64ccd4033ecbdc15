//! Daemon configuration, loaded from one TOML file.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    pub account: AccountConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: LogLevel,
}

#[derive(Debug, Deserialize)]
pub struct AccountConfig {
    /// Vendor account username (an email address).
    pub username: String,

    /// Override the account API endpoint. Mostly for testing.
    pub base_url: Option<String>,

    /// Where the opaque session blob is cached between runs.
    #[serde(default = "default_session_file")]
    pub session_file: PathBuf,
}

fn default_session_file() -> PathBuf {
    PathBuf::from("session.json")
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1".to_string(),
            port: 8565,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the persisted options store.
    pub options_file: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            options_file: PathBuf::from("options.json"),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [account]
            username = "user@example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.account.username, "user@example.com");
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.api.port, 8565);
        assert_eq!(config.store.options_file, PathBuf::from("options.json"));
        assert_eq!(config.account.session_file, PathBuf::from("session.json"));
    }

    #[test]
    fn explicit_values_win() {
        let config: Config = toml::from_str(
            r#"
            [logging]
            level = "debug"

            [account]
            username = "user@example.com"
            base_url = "https://account.test"

            [api]
            listen = "0.0.0.0"
            port = 9000
            "#,
        )
        .unwrap();

        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.api.listen, "0.0.0.0");
        assert_eq!(config.api.port, 9000);
        assert_eq!(
            config.account.base_url.as_deref(),
            Some("https://account.test")
        );
    }
}
