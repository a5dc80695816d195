//! Diagnostics and polling sessions
//!
//! A diagnostics run checks endpoint detection, connection time and a few
//! commands. A polling session collects readings for a fixed duration and
//! evaluates them against the configured success criteria.

use crate::config::{ScaleConfig, ValidationConfig};
use crate::core::driver::{DriverEvent, ScaleDriver, ScaleResponse, StatsSnapshot};
use crate::core::logger::DataLogger;
use crate::core::protocol::ScaleCommand;
use crate::utils::autodetect;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{info, warn};

/// Commands exercised by a diagnostics run
pub const DIAGNOSTIC_COMMANDS: [ScaleCommand; 4] = [
    ScaleCommand::Version,
    ScaleCommand::GrossWeight,
    ScaleCommand::NetWeight,
    ScaleCommand::Count,
];

/// How often a running polling session reports progress
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Check passed
    Pass,
    /// Passed with a caveat
    Warning,
    /// Check failed
    Fail,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Pass => "PASS",
            Self::Warning => "WARN",
            Self::Fail => "FAIL",
        })
    }
}

/// A named check and its outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestResult {
    /// Check name
    pub name: String,
    /// Outcome
    pub outcome: Outcome,
    /// Human-readable detail
    pub details: String,
}

impl TestResult {
    fn new(name: impl Into<String>, outcome: Outcome, details: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome,
            details: details.into(),
        }
    }
}

/// True when no check failed
pub fn all_passed(results: &[TestResult]) -> bool {
    results.iter().all(|r| r.outcome != Outcome::Fail)
}

/// Check endpoints, connect, then try the diagnostic commands.
///
/// Stops after the connection check if it fails. The driver is left
/// connected otherwise.
pub async fn run_diagnostics(
    driver: &dyn ScaleDriver,
    config: &ScaleConfig,
    path: Option<&str>,
) -> Vec<TestResult> {
    let mut results = Vec::new();

    info!("Listing serial ports");
    results.push(match driver.list_endpoints().await {
        Ok(endpoints) if endpoints.is_empty() => {
            TestResult::new("Port Detection", Outcome::Fail, "No serial ports found")
        }
        Ok(endpoints) => {
            let ftdi = endpoints.iter().filter(|e| autodetect::is_ftdi(e)).count();
            if ftdi > 0 {
                TestResult::new(
                    "Port Detection",
                    Outcome::Pass,
                    format!("Found {} FTDI port(s)", ftdi),
                )
            } else {
                TestResult::new(
                    "Port Detection",
                    Outcome::Warning,
                    "FTDI ports not found, but other ports available",
                )
            }
        }
        Err(e) => TestResult::new("Port Detection", Outcome::Fail, e.to_string()),
    });

    info!("Testing scale connection");
    let started = Instant::now();
    match driver.connect(path).await {
        Ok(()) => {
            let elapsed = started.elapsed();
            let outcome = if elapsed <= config.connection_timeout() {
                Outcome::Pass
            } else {
                Outcome::Warning
            };
            results.push(TestResult::new(
                "Connection",
                outcome,
                format!("Connected in {}ms", elapsed.as_millis()),
            ));
        }
        Err(e) => {
            results.push(TestResult::new("Connection", Outcome::Fail, e.to_string()));
            return results;
        }
    }

    info!("Testing scale commands");
    for command in DIAGNOSTIC_COMMANDS {
        let name = format!("Command {}", command.name());
        results.push(match driver.send_command(command.name()).await {
            Ok(response) if response.parsed.status.is_ok() => {
                let value = response
                    .parsed
                    .value
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                let unit = response.parsed.unit.as_deref().unwrap_or("");
                TestResult::new(name, Outcome::Pass, format!("{} {}", value, unit).trim())
            }
            Ok(response) => TestResult::new(
                name,
                Outcome::Warning,
                response
                    .parsed
                    .error
                    .unwrap_or_else(|| response.parsed.status.to_string()),
            ),
            Err(e) => TestResult::new(name, Outcome::Fail, e.to_string()),
        });
    }

    results
}

/// Response time figures across a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    /// Mean response time (ms)
    pub avg_response_time_ms: f64,
    /// Fastest response (ms)
    pub min_response_time_ms: f64,
    /// Slowest response (ms)
    pub max_response_time_ms: f64,
    /// Readings the figures are based on
    pub total_readings: usize,
}

/// Pass/fail against the validation thresholds
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Criteria {
    /// Packet loss within `max_packet_loss`
    pub packet_loss_ok: bool,
    /// At least `min_readings` readings
    pub readings_ok: bool,
    /// Both criteria met
    pub passed: bool,
}

/// End-of-session figures
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Polled command
    pub command: String,
    /// Session length (ms)
    pub runtime_ms: u64,
    /// Attempts written
    pub commands_sent: u64,
    /// Attempts answered
    pub responses_received: u64,
    /// Failed commands and transport errors
    pub errors: u64,
    /// Attempts that timed out
    pub timeouts: u64,
    /// `responses_received / commands_sent`
    pub success_rate: f64,
    /// Loss ratio
    pub packet_loss: f64,
    /// Readings collected
    pub total_readings: usize,
    /// Response time figures, when any reading was collected
    pub performance: Option<PerformanceMetrics>,
    /// Threshold evaluation
    pub criteria: Criteria,
}

/// Readings collected while polling
#[derive(Debug, Clone, Default)]
pub struct PollingSession {
    command: String,
    readings: Vec<ScaleResponse>,
}

impl PollingSession {
    /// Empty session for `command`
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            readings: Vec::new(),
        }
    }

    /// Add a reading
    pub fn record(&mut self, response: ScaleResponse) {
        self.readings.push(response);
    }

    /// Readings so far
    pub fn readings(&self) -> &[ScaleResponse] {
        &self.readings
    }

    /// Response time figures, `None` before the first reading
    pub fn performance(&self) -> Option<PerformanceMetrics> {
        let times: Vec<f64> = self
            .readings
            .iter()
            .map(|r| r.response_time.as_secs_f64() * 1000.0)
            .collect();
        if times.is_empty() {
            return None;
        }

        let total: f64 = times.iter().sum();
        Some(PerformanceMetrics {
            avg_response_time_ms: total / times.len() as f64,
            min_response_time_ms: times.iter().copied().fold(f64::INFINITY, f64::min),
            max_response_time_ms: times.iter().copied().fold(0.0, f64::max),
            total_readings: times.len(),
        })
    }

    /// Summarize against the driver's stats and the validation thresholds
    pub fn summary(&self, stats: &StatsSnapshot, validation: &ValidationConfig) -> SessionSummary {
        let counters = &stats.stats;
        let success_rate = if counters.commands_sent > 0 {
            counters.responses_received as f64 / counters.commands_sent as f64
        } else {
            0.0
        };

        let packet_loss_ok = stats.packet_loss <= validation.max_packet_loss;
        let readings_ok = self.readings.len() as u64 >= validation.min_readings;

        SessionSummary {
            command: self.command.clone(),
            runtime_ms: stats.runtime.as_millis() as u64,
            commands_sent: counters.commands_sent,
            responses_received: counters.responses_received,
            errors: counters.errors,
            timeouts: counters.timeouts,
            success_rate,
            packet_loss: stats.packet_loss,
            total_readings: self.readings.len(),
            performance: self.performance(),
            criteria: Criteria {
                packet_loss_ok,
                readings_ok,
                passed: packet_loss_ok && readings_ok,
            },
        }
    }
}

/// Poll `command` for `duration` and summarize the result.
///
/// The driver must already be connected. Polling is stopped before
/// returning.
pub async fn run_polling_session(
    driver: &dyn ScaleDriver,
    command: &str,
    duration: Duration,
    config: &ScaleConfig,
    logger: &DataLogger,
) -> SessionSummary {
    let mut session = PollingSession::new(command);
    let mut events = driver.subscribe();

    let interval = config.polling_interval();
    let target = duration.as_millis() / interval.as_millis().max(1);
    info!(
        "Polling {} for {}s, target {} readings at {}ms",
        command,
        duration.as_secs(),
        target,
        interval.as_millis()
    );

    driver.start_polling(command);

    let deadline = Instant::now() + duration;
    let mut progress = tokio::time::interval_at(Instant::now() + PROGRESS_INTERVAL, PROGRESS_INTERVAL);

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            _ = progress.tick() => {
                let stats = driver.stats();
                info!(
                    "{}s | readings: {} | errors: {} | packet loss: {:.1}%",
                    stats.runtime.as_secs(),
                    session.readings().len(),
                    stats.stats.errors,
                    stats.packet_loss * 100.0
                );
            }
            event = events.recv() => match event {
                Ok(DriverEvent::Reading(response)) => session.record(response),
                Ok(DriverEvent::PollingError { message, .. }) => warn!("Poll failed: {}", message),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} driver events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    }

    driver.stop_polling();

    let stats = driver.stats();
    let summary = session.summary(&stats, &config.validation);
    if let Some(metrics) = &summary.performance {
        logger.log_performance(metrics);
    }
    logger.log_stats(&stats);

    summary
}
