//! # Scalelink Core Library
//!
//! A resilient driver for the text-line serial protocol spoken by
//! Sterling 7600 class digital scales over FTDI USB-serial adapters:
//! - Automatic FTDI port detection
//! - Reconnection with exponential backoff
//! - Command/response correlation with per-command retry
//! - Continuous polling with packet loss and health accounting
//! - A synthetic scale for running without hardware
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use scalelink_core::{ScaleConfig, ScaleController, ScaleDriver};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(ScaleConfig::default());
//!     let scale = ScaleController::new(config)?;
//!
//!     scale.connect(None).await?;
//!     let reading = scale.gross_weight().await?;
//!     println!("{} -> {:?}", reading.raw, reading.parsed.value);
//!
//!     scale.disconnect().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;
pub mod utils;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::{ConfigError, Mode, ScaleConfig};
pub use crate::core::driver::{
    DriverError, DriverEvent, MockScaleController, ScaleController, ScaleDriver, ScaleResponse,
    StatsSnapshot,
};
pub use crate::core::logger::{DataLogger, LogFormat};
pub use crate::core::protocol::{parse_response, ParsedResponse, ResponseKind, ResponseStatus, ScaleCommand};
pub use crate::core::session::{run_diagnostics, run_polling_session, SessionSummary, TestResult};
pub use crate::core::transport::{
    ConnectionState, EndpointInfo, SerialConfig, SerialConnection, TransportError,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
