//! Core module containing the scale driver
//!
//! This module provides:
//! - Serial transport with reconnection and backoff
//! - Wire protocol: command table, line framing, response parsing
//! - Hardware and synthetic scale drivers
//! - Cancellable scheduled tasks for polling and backoff
//! - Structured data logging
//! - Diagnostics and polling sessions

pub mod driver;
pub mod logger;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod transport;
