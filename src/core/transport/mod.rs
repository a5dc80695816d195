//! Transport layer for the scale's serial link
//!
//! - Endpoint enumeration and opening behind small traits
//! - A reconnecting connection handle with exponential backoff
//! - Lifecycle and data events over a broadcast channel

mod serial;

pub use serial::{SerialConfig, SerialConnection, SerialParity, SystemPorts};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Port did not open in time
    #[error("Connection timeout after {}ms", .0.as_millis())]
    ConnectionTimeout(Duration),

    /// Another connect is already running
    #[error("Connection already in progress")]
    ConnectionInProgress,

    /// Auto-detection found no adapter
    #[error("No FTDI device found")]
    NoDeviceFound,

    /// No open port
    #[error("Not connected")]
    NotConnected,

    /// Link dropped while an operation was running
    #[error("Disconnected")]
    Disconnected,

    /// A connect was abandoned because of a manual disconnect
    #[error("Connection attempt aborted")]
    Aborted,

    /// Reconnect attempts used up
    #[error("Reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted {
        /// Attempts made
        attempts: u32,
    },

    /// Write or drain did not finish in time
    #[error("Write timeout after {}ms", .0.as_millis())]
    WriteTimeout(Duration),

    /// Port could not be opened
    #[error("Failed to open {path}: {message}")]
    Open {
        /// Port path
        path: String,
        /// Underlying error text
        message: String,
    },

    /// Endpoint enumeration failed
    #[error("Failed to list serial ports: {0}")]
    Enumeration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Byte stream a port opener hands back
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {
    /// Discard bytes queued in the OS input and output buffers
    fn discard_buffers(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialPortIO for tokio::io::DuplexStream {}

/// Boxed port stream
pub type DynSerial = Box<dyn SerialPortIO>;

/// A serial endpoint reported by the OS
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointInfo {
    /// Device path (e.g. /dev/ttyUSB0, COM3)
    pub path: String,
    /// USB manufacturer string
    pub manufacturer: Option<String>,
    /// USB vendor id
    pub vendor_id: Option<u16>,
    /// USB product id
    pub product_id: Option<u16>,
    /// USB serial number
    pub serial_number: Option<String>,
}

impl EndpointInfo {
    /// Endpoint with only a path
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Lists the endpoints present on the host
#[cfg_attr(test, mockall::automock)]
pub trait PortEnumerator: Send + Sync {
    /// Enumerate serial endpoints
    fn list_ports(&self) -> Result<Vec<EndpointInfo>, TransportError>;
}

/// Opens an endpoint as an async byte stream
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open the port described by `config`
    async fn open(&self, config: &SerialConfig) -> Result<DynSerial, TransportError>;
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum ConnectionState {
    /// No port open
    #[default]
    Disconnected,
    /// Open in progress
    Connecting,
    /// Port open
    Connected,
    /// Waiting to retry after an unexpected close
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
        /// Delay before the attempt
        next_delay: Duration,
    },
    /// Reconnect attempts used up
    Exhausted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting { attempt, .. } => write!(f, "Reconnecting (attempt {})", attempt),
            Self::Exhausted => write!(f, "Reconnect exhausted"),
        }
    }
}

/// Why a link went down
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisconnectReason {
    /// Closed by `disconnect`
    User,
    /// Port reported end of stream
    RemoteClosed,
    /// Read or write failed
    IoError(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "closed by user"),
            Self::RemoteClosed => write!(f, "port closed"),
            Self::IoError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

/// Events published by a connection
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Port opened
    Connected {
        /// Port path
        path: String,
        /// Time the open took
        connection_time: Duration,
    },
    /// Bytes received
    Data(Bytes),
    /// Port closed
    Disconnected(DisconnectReason),
    /// Transport-level failure
    Error(String),
    /// A reconnect attempt is starting
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
        /// Configured attempt limit
        max_attempts: u32,
        /// Delay that preceded this attempt
        delay: Duration,
    },
    /// No attempts left
    ReconnectExhausted {
        /// Attempts made
        attempts: u32,
    },
}

/// Reconnect backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub base_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the 1-based `attempt`: `min(base * 2^(attempt-1), max)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `made` attempts
    pub fn should_attempt(&self, made: u32) -> bool {
        made < self.max_attempts
    }
}

/// Timing and backoff settings for a [`SerialConnection`]
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Serial parameters; the port path is filled in per connect
    pub serial: SerialConfig,
    /// Limit on opening the port
    pub connect_timeout: Duration,
    /// Limit on each write or drain
    pub write_timeout: Duration,
    /// Longest silence before the link counts as unhealthy
    pub idle_limit: Duration,
    /// Reconnect backoff
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            idle_limit: Duration::from_secs(6),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Snapshot of the connection for status displays
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Current lifecycle state
    pub state: ConnectionState,
    /// Port open
    pub is_connected: bool,
    /// Open in progress
    pub is_connecting: bool,
    /// Path of the current or last port
    pub path: Option<String>,
    /// Reconnect attempts made since the last successful open
    pub reconnect_attempts: u32,
    /// Configured attempt limit
    pub max_reconnect_attempts: u32,
    /// When the current connection was started
    pub connection_start: Option<DateTime<Local>>,
    /// Time since the last read or write
    pub idle_for: Option<Duration>,
}
