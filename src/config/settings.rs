//! Driver configuration
//!
//! The configuration is loaded once from TOML, validated, and then shared
//! read-only (`Arc<ScaleConfig>`) by every component.

use crate::core::logger::LogFormat;
use crate::core::protocol::commands::{default_command_map, validate_code, ScaleCommand};
use crate::core::protocol::CommandTable;
use crate::core::transport::{ConnectionOptions, ReconnectPolicy, SerialConfig, SerialParity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const BAUD_RATES: &[u32] = &[300, 1200, 2400, 4800, 9600, 19200, 38400];

/// Configuration errors. All of them are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File does not exist
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    /// File could not be read
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        /// Path that failed
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("Invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    /// One or more rules violated
    #[error("Configuration validation failed: {}", .0.join(", "))]
    Validation(Vec<String>),
}

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Synthetic scale, no hardware
    #[default]
    Testing,
    /// Real scale over a serial adapter
    Scale,
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScaleConfig {
    /// Operating mode
    pub mode: Mode,
    /// Serial line settings
    pub serial: SerialSettings,
    /// Command name -> wire code ("SGW\r")
    pub commands: CommandsConfig,
    /// Polling and write settings
    pub polling: PollingConfig,
    /// Timeouts and acceptance thresholds
    pub validation: ValidationConfig,
    /// Reconnect backoff
    pub reconnect: ReconnectConfig,
    /// Logging settings
    pub logging: LoggingConfig,
    /// Synthetic scale settings
    pub testing: TestingConfig,
}

/// Command table as configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandsConfig(pub BTreeMap<String, String>);

impl Default for CommandsConfig {
    fn default() -> Self {
        Self(default_command_map())
    }
}

/// Serial line settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Port read/write timeout (ms)
    pub timeout_ms: u64,
    /// Fixed port path; auto-detected when absent
    pub path: Option<String>,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            timeout_ms: 5000,
            path: None,
        }
    }
}

/// Polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollingConfig {
    /// Delay between the end of one poll and the start of the next (ms)
    pub interval_ms: u64,
    /// Per-write timeout (ms)
    pub timeout_ms: u64,
    /// Retries after the first attempt
    pub retries: u32,
    /// Lower bound for `interval_ms`
    pub min_interval_ms: u64,
    /// Upper bound for `interval_ms`
    pub max_interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            timeout_ms: 5000,
            retries: 3,
            min_interval_ms: 500,
            max_interval_ms: 10000,
        }
    }
}

/// Timeouts and acceptance thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationConfig {
    /// Port open timeout (ms)
    pub connection_timeout_ms: u64,
    /// Command response timeout (ms)
    pub response_timeout_ms: u64,
    /// Highest acceptable packet loss (0.0 - 1.0)
    pub max_packet_loss: f64,
    /// Readings a polling session must collect to pass
    pub min_readings: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 5000,
            response_timeout_ms: 2000,
            max_packet_loss: 0.01,
            min_readings: 100,
        }
    }
}

/// Reconnect backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    /// Attempts before giving up
    pub max_attempts: u32,
    /// First delay (ms)
    pub base_delay_ms: u64,
    /// Delay ceiling (ms)
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default level filter (overridden by `RUST_LOG`)
    pub level: String,
    /// Console output format
    pub format: LogFormat,
    /// Log raw TX/RX bytes
    pub include_raw: bool,
    /// Directory for the JSON data log, if any
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_raw: false,
            directory: None,
        }
    }
}

/// Synthetic scale settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TestingConfig {
    /// Fixed raw replies by command name, overriding the simulated state
    pub mock_responses: BTreeMap<String, String>,
    /// Error replies to inject (raw line -> description)
    pub error_responses: BTreeMap<String, String>,
    /// Enable error injection
    pub simulate_errors: bool,
    /// Probability of injecting an error (0.0 - 1.0)
    pub error_rate: f64,
    /// Simulated response latency (ms)
    pub response_delay_ms: u64,
}

impl Default for TestingConfig {
    fn default() -> Self {
        let error_responses = [
            ("Err.80", "Serial command data error"),
            ("Err.81", "Unknown serial command"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            mock_responses: BTreeMap::new(),
            error_responses,
            simulate_errors: false,
            error_rate: 0.0,
            response_delay_ms: 50,
        }
    }
}

fn check_range<T: PartialOrd + std::fmt::Display>(
    problems: &mut Vec<String>,
    name: &str,
    value: T,
    min: T,
    max: T,
) {
    if value < min || value > max {
        problems.push(format!("{} must be between {} and {} (got {})", name, min, max, value));
    }
}

impl ScaleConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field and cross-field rule, reporting all problems at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let serial = &self.serial;
        if !BAUD_RATES.contains(&serial.baud_rate) {
            problems.push(format!(
                "serial.baud_rate must be one of {:?} (got {})",
                BAUD_RATES, serial.baud_rate
            ));
        }
        if !matches!(serial.data_bits, 7 | 8) {
            problems.push(format!("serial.data_bits must be 7 or 8 (got {})", serial.data_bits));
        }
        if !matches!(serial.stop_bits, 1 | 2) {
            problems.push(format!("serial.stop_bits must be 1 or 2 (got {})", serial.stop_bits));
        }
        check_range(&mut problems, "serial.timeout_ms", serial.timeout_ms, 1000, 30000);

        let polling = &self.polling;
        check_range(&mut problems, "polling.interval_ms", polling.interval_ms, 500, 10000);
        check_range(&mut problems, "polling.timeout_ms", polling.timeout_ms, 1000, 30000);
        check_range(&mut problems, "polling.retries", polling.retries, 1, 10);
        if polling.min_interval_ms < 100 {
            problems.push("polling.min_interval_ms must be at least 100".to_string());
        }
        if polling.max_interval_ms < 1000 {
            problems.push("polling.max_interval_ms must be at least 1000".to_string());
        }
        if polling.interval_ms < polling.min_interval_ms || polling.interval_ms > polling.max_interval_ms {
            problems.push(format!(
                "Polling interval must be between {} and {} ms",
                polling.min_interval_ms, polling.max_interval_ms
            ));
        }

        let validation = &self.validation;
        check_range(
            &mut problems,
            "validation.connection_timeout_ms",
            validation.connection_timeout_ms,
            1000,
            60000,
        );
        check_range(
            &mut problems,
            "validation.response_timeout_ms",
            validation.response_timeout_ms,
            500,
            10000,
        );
        check_range(&mut problems, "validation.max_packet_loss", validation.max_packet_loss, 0.0, 1.0);
        check_range(&mut problems, "validation.min_readings", validation.min_readings, 1, 10000);
        if validation.response_timeout_ms >= polling.timeout_ms {
            problems.push("Response timeout must be less than polling timeout".to_string());
        }

        let reconnect = &self.reconnect;
        if reconnect.base_delay_ms == 0 {
            problems.push("reconnect.base_delay_ms must be greater than 0".to_string());
        }
        if reconnect.max_delay_ms < reconnect.base_delay_ms {
            problems.push("reconnect.max_delay_ms must not be less than reconnect.base_delay_ms".to_string());
        }

        if self.logging.level.parse::<tracing::Level>().is_err() {
            problems.push(format!("logging.level '{}' is not a valid level", self.logging.level));
        }

        let testing = &self.testing;
        check_range(&mut problems, "testing.error_rate", testing.error_rate, 0.0, 1.0);
        check_range(&mut problems, "testing.response_delay_ms", testing.response_delay_ms, 0, 5000);
        if testing.simulate_errors && testing.error_responses.is_empty() {
            problems.push("testing.error_responses must not be empty when simulate_errors is set".to_string());
        }

        for cmd in ScaleCommand::all() {
            if !self.commands.0.contains_key(cmd.name()) {
                problems.push(format!("commands.{} is required", cmd.name()));
            }
        }
        for (name, code) in &self.commands.0 {
            if let Err(problem) = validate_code(name, code) {
                problems.push(problem);
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(problems))
        }
    }

    /// Wire command table
    pub fn command_table(&self) -> Result<CommandTable, ConfigError> {
        CommandTable::from_map(&self.commands.0).map_err(ConfigError::Validation)
    }

    /// Serial parameters for opening `path`
    pub fn serial_config(&self, path: &str) -> SerialConfig {
        SerialConfig::new(path, self.serial.baud_rate)
            .data_bits(self.serial.data_bits)
            .stop_bits(self.serial.stop_bits)
            .parity(self.serial.parity)
            .timeout(Duration::from_millis(self.serial.timeout_ms))
    }

    /// Reconnect backoff policy
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect.max_attempts,
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
        }
    }

    /// Transport timing and backoff
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            serial: self.serial_config(""),
            connect_timeout: self.connection_timeout(),
            write_timeout: self.write_timeout(),
            idle_limit: self.response_timeout() * 3,
            reconnect: self.reconnect_policy(),
        }
    }

    /// Port open timeout
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.validation.connection_timeout_ms)
    }

    /// Command response timeout
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.validation.response_timeout_ms)
    }

    /// Per-write timeout
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.polling.timeout_ms)
    }

    /// Polling interval
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling.interval_ms)
    }

    /// Simulated response latency
    pub fn response_delay(&self) -> Duration {
        Duration::from_millis(self.testing.response_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problems(config: &ScaleConfig) -> Vec<String> {
        match config.validate() {
            Err(ConfigError::Validation(p)) => p,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_default_is_valid() {
        ScaleConfig::default().validate().unwrap();
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = ScaleConfig::from_toml_str(
            r#"
            mode = "scale"

            [serial]
            baud_rate = 2400
            parity = "even"
            path = "/dev/ttyUSB0"

            [polling]
            interval_ms = 2000

            [commands]
            grossWeight = "SGW\r"
            netWeight = "SNW\r"
            count = "SCO\r"
            pieceWeight = "SPW\r"
            zero = "ZRO\r"
            tare = "ATW\r"
            print = "PRT\r"
            version = "SVN\r"
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, Mode::Scale);
        assert_eq!(config.serial.baud_rate, 2400);
        assert_eq!(config.serial.parity, SerialParity::Even);
        assert_eq!(config.polling_interval(), Duration::from_secs(2));
        assert_eq!(config.command_table().unwrap().get("tare"), Some(b"ATW\r"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ScaleConfig::from_toml_str("[serial]\nbaud = 9600\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_interval_outside_bounds() {
        let mut config = ScaleConfig::default();
        config.polling.min_interval_ms = 1500;
        let p = problems(&config);
        assert!(p.iter().any(|m| m.starts_with("Polling interval must be between 1500")));
    }

    #[test]
    fn test_response_timeout_must_be_below_polling_timeout() {
        let mut config = ScaleConfig::default();
        config.validation.response_timeout_ms = 5000;
        config.polling.timeout_ms = 5000;
        let p = problems(&config);
        assert!(p.contains(&"Response timeout must be less than polling timeout".to_string()));
    }

    #[test]
    fn test_bad_command_codes() {
        let mut config = ScaleConfig::default();
        config.commands.0.insert("zero".to_string(), "ZRO".to_string());
        config.commands.0.remove("version");
        let p = problems(&config);
        assert!(p.iter().any(|m| m.contains("'zero' must end with carriage return")));
        assert!(p.iter().any(|m| m == "commands.version is required"));
    }

    #[test]
    fn test_reports_every_problem() {
        let mut config = ScaleConfig::default();
        config.serial.baud_rate = 115200;
        config.serial.data_bits = 5;
        config.testing.error_rate = 1.5;
        assert_eq!(problems(&config).len(), 3);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ScaleConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[validation]\nmax_packet_loss = 0.05\n").unwrap();

        let config = ScaleConfig::load(&path).unwrap();
        assert_eq!(config.validation.max_packet_loss, 0.05);
        assert_eq!(config.reconnect_policy().max_attempts, 10);
    }
}
