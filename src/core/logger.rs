//! Logging setup and scale data events
//!
//! Diagnostics go through ordinary `tracing` events. Scale data (readings,
//! connection changes, stats, session boundaries, raw bytes) is emitted on
//! the [`SCALE_DATA_TARGET`] target as one JSON document per event, so it
//! can be routed to its own file.

use crate::config::LoggingConfig;
use crate::core::driver::{ScaleResponse, StatsSnapshot};
use crate::core::session::{PerformanceMetrics, SessionSummary, TestResult};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{filter_fn, EnvFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, Layer};
use uuid::Uuid;

/// Target carrying structured scale data
pub const SCALE_DATA_TARGET: &str = "scale_data";

/// File the data log is written to inside the logging directory
pub const DATA_LOG_FILE: &str = "scale-data.log";

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON lines
    Json,
    /// Human-readable
    #[default]
    Pretty,
}

/// Logging setup errors
#[derive(Error, Debug)]
pub enum LoggerError {
    /// Log directory could not be created
    #[error("Failed to create log directory {path}: {source}")]
    Directory {
        /// Directory path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// A global subscriber is already installed
    #[error("Failed to install tracing subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured level. When a directory is
/// configured, `scale_data` events are also appended to
/// [`DATA_LOG_FILE`] there; keep the returned guard alive until exit so
/// buffered lines are flushed.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>, LoggerError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console = match config.format {
        LogFormat::Json => fmt::layer().json().with_target(true).boxed(),
        LogFormat::Pretty => fmt::layer().with_target(false).boxed(),
    };

    let (data_file, guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LoggerError::Directory {
                path: dir.clone(),
                source,
            })?;
            let appender = tracing_appender::rolling::never(dir, DATA_LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(filter_fn(|meta| meta.target() == SCALE_DATA_TARGET));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console.with_filter(env_filter))
        .with(data_file)
        .try_init()?;

    Ok(guard)
}

/// Data direction for raw logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Host to scale
    Sent,
    /// Scale to host
    Received,
}

/// Emits structured scale data events
#[derive(Debug, Clone)]
pub struct DataLogger {
    session_id: Uuid,
    include_raw: bool,
}

impl Default for DataLogger {
    fn default() -> Self {
        Self::new(false)
    }
}

impl DataLogger {
    /// Create a logger with a fresh session id
    pub fn new(include_raw: bool) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            include_raw,
        }
    }

    /// Create a logger from the logging settings
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self::new(config.include_raw)
    }

    /// Id stamped on every entry
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn entry(&self, kind: &str, data: Value) -> Value {
        json!({
            "type": kind,
            "sessionId": self.session_id.to_string(),
            "timestamp": Local::now().to_rfc3339(),
            "data": data,
        })
    }

    fn emit(&self, entry: &Value) {
        let kind = entry["type"].as_str().unwrap_or("unknown");
        info!(target: SCALE_DATA_TARGET, kind, entry = %entry);
    }

    /// Entry for a successful command reply
    pub fn reading_entry(&self, response: &ScaleResponse) -> Value {
        let parsed = serde_json::to_value(&response.parsed).unwrap_or(Value::Null);
        self.entry(
            "scale_reading",
            json!({
                "command": response.command,
                "raw": response.raw,
                "parsed": parsed,
                "responseTimeMs": response.response_time.as_millis() as u64,
            }),
        )
    }

    /// Log a successful command reply
    pub fn log_reading(&self, response: &ScaleResponse) {
        self.emit(&self.reading_entry(response));
    }

    /// Log a connection lifecycle event
    pub fn log_connection(&self, event: &str, details: Value) {
        self.emit(&self.entry(
            "connection",
            json!({ "event": event, "details": details }),
        ));
    }

    /// Entry for a failure, with its source chain
    pub fn error_entry(&self, context: &str, err: &dyn std::error::Error) -> Value {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        self.entry(
            "error",
            json!({ "context": context, "message": err.to_string(), "causes": causes }),
        )
    }

    /// Log an error with its context
    pub fn log_error(&self, context: &str, err: &dyn std::error::Error) {
        error!(context, "{}", err);
        self.emit(&self.error_entry(context, err));
    }

    /// Log a stats snapshot
    pub fn log_stats(&self, stats: &StatsSnapshot) {
        let data = serde_json::to_value(stats).unwrap_or(Value::Null);
        self.emit(&self.entry("statistics", data));
    }

    /// Log the start of a session
    pub fn start_session(&self, mode: &str, details: Value) {
        info!("Session {} started ({} mode)", self.session_id, mode);
        self.emit(&self.entry(
            "session_start",
            json!({ "mode": mode, "details": details }),
        ));
    }

    /// Log the end of a session with its summary
    pub fn end_session(&self, summary: &SessionSummary) {
        info!("Session {} ended", self.session_id);
        let data = serde_json::to_value(summary).unwrap_or(Value::Null);
        self.emit(&self.entry("session_end", data));
    }

    /// Entry for raw bytes, if raw logging is enabled
    pub fn raw_entry(&self, direction: Direction, data: &[u8]) -> Option<Value> {
        if !self.include_raw {
            return None;
        }
        Some(self.entry(
            "raw_data",
            json!({
                "direction": direction,
                "hex": hex::encode(data),
                "text": String::from_utf8_lossy(data),
                "length": data.len(),
            }),
        ))
    }

    /// Log raw bytes when raw logging is enabled
    pub fn log_raw(&self, direction: Direction, data: &[u8]) {
        if let Some(entry) = self.raw_entry(direction, data) {
            self.emit(&entry);
        }
    }

    /// Log a diagnostics check
    pub fn log_test_result(&self, result: &TestResult) {
        let data = serde_json::to_value(result).unwrap_or(Value::Null);
        self.emit(&self.entry("test_result", data));
    }

    /// Log response time metrics
    pub fn log_performance(&self, metrics: &PerformanceMetrics) {
        let data = serde_json::to_value(metrics).unwrap_or(Value::Null);
        self.emit(&self.entry("performance", data));
    }
}
