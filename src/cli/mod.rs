//! CLI Module
//!
//! Exit codes for automation, mapped from driver and configuration errors.

pub mod exit_codes;

pub use exit_codes::{exit_code_description, CliResult, ExitCodes};
