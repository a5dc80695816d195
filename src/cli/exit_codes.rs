//! CLI Exit Codes
//!
//! Stable exit codes so scripts can tell failure kinds apart.

use crate::config::ConfigError;
use crate::core::driver::DriverError;
use crate::core::transport::TransportError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Port could not be opened
    pub const CONNECTION_FAILED: u8 = 3;

    /// Connection or command timeout
    pub const TIMEOUT: u8 = 4;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// No FTDI adapter found
    pub const DEVICE_NOT_FOUND: u8 = 12;

    /// Another connect already running
    pub const DEVICE_BUSY: u8 = 13;

    /// Link lost and not recovered
    pub const DISCONNECTED: u8 = 14;

    /// Diagnostics or session criteria not met
    pub const VALIDATION_FAILED: u8 = 17;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success carrying a message
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Failure with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Criteria not met
    pub fn validation_failed(msg: impl Into<String>) -> Self {
        Self::Error(ExitCodes::VALIDATION_FAILED, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

fn transport_code(err: &TransportError) -> u8 {
    match err {
        TransportError::ConnectionTimeout(_) | TransportError::WriteTimeout(_) => ExitCodes::TIMEOUT,
        TransportError::ConnectionInProgress => ExitCodes::DEVICE_BUSY,
        TransportError::NoDeviceFound => ExitCodes::DEVICE_NOT_FOUND,
        TransportError::Open { .. } | TransportError::Enumeration(_) | TransportError::Io(_) => {
            ExitCodes::CONNECTION_FAILED
        }
        TransportError::NotConnected
        | TransportError::Disconnected
        | TransportError::ReconnectExhausted { .. } => ExitCodes::DISCONNECTED,
        TransportError::Aborted => ExitCodes::ERROR,
    }
}

impl From<&DriverError> for CliResult {
    fn from(err: &DriverError) -> Self {
        let code = match err.root() {
            DriverError::Transport(e) => transport_code(e),
            DriverError::UnknownCommand(_) => ExitCodes::INVALID_ARGS,
            DriverError::CommandTimeout { .. } => ExitCodes::TIMEOUT,
            DriverError::RetriesExhausted { .. } => ExitCodes::INTERNAL_ERROR,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<&ConfigError> for CliResult {
    fn from(err: &ConfigError) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, err.to_string())
    }
}

impl From<&anyhow::Error> for CliResult {
    fn from(err: &anyhow::Error) -> Self {
        if let Some(e) = err.downcast_ref::<DriverError>() {
            return e.into();
        }
        if let Some(e) = err.downcast_ref::<ConfigError>() {
            return e.into();
        }
        if let Some(e) = err.downcast_ref::<TransportError>() {
            return Self::Error(transport_code(e), e.to_string());
        }
        Self::Error(ExitCodes::ERROR, format!("{:#}", err))
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "Timeout",
        8 => "Configuration error",
        12 => "Device not found",
        13 => "Device busy",
        14 => "Disconnected",
        17 => "Validation failed",
        127 => "Internal error",
        _ => "Unknown error",
    }
}
