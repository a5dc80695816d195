//! Scale driver contract
//!
//! [`ScaleDriver`] is implemented by the hardware [`ScaleController`] and by
//! the synthetic [`MockScaleController`]. Callers pick one at runtime and
//! observe it through [`DriverEvent`] broadcasts.

mod controller;
mod mock;
mod stats;

pub use controller::ScaleController;
pub use mock::MockScaleController;
pub use stats::{packet_loss, ScaleStats, StatsSnapshot};

use crate::core::protocol::{ParsedResponse, ScaleCommand};
use crate::core::transport::{DisconnectReason, EndpointInfo, TransportError};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Driver error types
#[derive(Error, Debug)]
pub enum DriverError {
    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Name not in the command table
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// No reply within the response timeout
    #[error("Command timeout: {command} (attempt {attempt})")]
    CommandTimeout {
        /// Command name
        command: String,
        /// 1-based attempt number
        attempt: u32,
    },

    /// Every attempt failed
    #[error("Command {command} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Command name
        command: String,
        /// Attempts made
        attempts: u32,
        /// Error from the last attempt
        source: Box<DriverError>,
    },
}

impl DriverError {
    /// Whether a fresh attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UnknownCommand(_) | Self::RetriesExhausted { .. } => false,
            Self::CommandTimeout { .. } => true,
            Self::Transport(e) => !matches!(
                e,
                TransportError::NotConnected | TransportError::ReconnectExhausted { .. }
            ),
        }
    }

    /// Innermost error, looking through retry wrapping
    pub fn root(&self) -> &DriverError {
        match self {
            Self::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }
}

/// A resolved command
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleResponse {
    /// Line as received
    pub raw: String,
    /// Parsed form of `raw`
    pub parsed: ParsedResponse,
    /// Command name that was sent
    pub command: String,
    /// When the reply arrived
    pub timestamp: DateTime<Local>,
    /// Write-to-reply time of the successful attempt
    pub response_time: Duration,
}

/// Notifications published by a driver
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// Port opened
    Connected {
        /// Port path
        path: String,
        /// Time the open took
        connection_time: Duration,
    },
    /// Port closed
    Disconnected(DisconnectReason),
    /// Reconnect attempt starting
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
        /// Configured limit
        max_attempts: u32,
        /// Delay that preceded the attempt
        delay: Duration,
    },
    /// Reconnect attempts used up
    ReconnectExhausted {
        /// Attempts made
        attempts: u32,
    },
    /// Any received line, solicited or not
    Response {
        /// Parsed line
        parsed: ParsedResponse,
        /// Command it resolved, if any
        command: Option<String>,
    },
    /// Successful polling cycle
    Reading(ScaleResponse),
    /// Failed polling cycle
    PollingError {
        /// Polled command
        command: String,
        /// Failure text
        message: String,
    },
    /// Transport-level failure
    Error(String),
}

/// Common contract for hardware and synthetic scales
#[async_trait]
pub trait ScaleDriver: Send + Sync {
    /// Enumerate candidate endpoints
    async fn list_endpoints(&self) -> Result<Vec<EndpointInfo>, DriverError>;

    /// Connect to `path`, or auto-detect when `None`
    async fn connect(&self, path: Option<&str>) -> Result<(), DriverError>;

    /// Disconnect and suppress automatic reconnection
    async fn disconnect(&self);

    /// Whether the port is open
    fn is_connected(&self) -> bool;

    /// Send `name` with an explicit retry count (`None` uses the configured one)
    async fn send_command_with_retries(
        &self,
        name: &str,
        retries: Option<u32>,
    ) -> Result<ScaleResponse, DriverError>;

    /// Send `name` with the configured retry count
    async fn send_command(&self, name: &str) -> Result<ScaleResponse, DriverError> {
        self.send_command_with_retries(name, None).await
    }

    /// Begin issuing `command` on the polling interval
    fn start_polling(&self, command: &str);

    /// Stop polling
    fn stop_polling(&self);

    /// Whether polling is running
    fn is_polling(&self) -> bool;

    /// Counters and derived figures
    fn stats(&self) -> StatsSnapshot;

    /// Connected, recently active and within the loss threshold
    fn is_healthy(&self) -> bool;

    /// Subscribe to driver notifications
    fn subscribe(&self) -> broadcast::Receiver<DriverEvent>;

    /// Read gross weight
    async fn gross_weight(&self) -> Result<ScaleResponse, DriverError> {
        self.send_command(ScaleCommand::GrossWeight.name()).await
    }

    /// Read net weight
    async fn net_weight(&self) -> Result<ScaleResponse, DriverError> {
        self.send_command(ScaleCommand::NetWeight.name()).await
    }

    /// Read piece count
    async fn count(&self) -> Result<ScaleResponse, DriverError> {
        self.send_command(ScaleCommand::Count.name()).await
    }

    /// Read piece weight
    async fn piece_weight(&self) -> Result<ScaleResponse, DriverError> {
        self.send_command(ScaleCommand::PieceWeight.name()).await
    }

    /// Zero the scale
    async fn zero(&self) -> Result<ScaleResponse, DriverError> {
        self.send_command(ScaleCommand::Zero.name()).await
    }

    /// Acquire tare
    async fn tare(&self) -> Result<ScaleResponse, DriverError> {
        self.send_command(ScaleCommand::Tare.name()).await
    }

    /// Read firmware version
    async fn version(&self) -> Result<ScaleResponse, DriverError> {
        self.send_command(ScaleCommand::Version.name()).await
    }

    /// Trigger a print
    async fn print(&self) -> Result<ScaleResponse, DriverError> {
        self.send_command(ScaleCommand::Print.name()).await
    }
}
