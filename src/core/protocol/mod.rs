//! Scale wire protocol
//!
//! - Command table (3 letters + CR)
//! - Line framing of inbound bytes
//! - Response parsing

pub mod commands;
pub mod framing;
pub mod parser;

pub use commands::{default_command_map, CommandTable, ScaleCommand, COMMAND_LEN};
pub use framing::LineFramer;
pub use parser::{parse_at, parse_response, ParsedResponse, ResponseKind, ResponseStatus, ResponseValue};
