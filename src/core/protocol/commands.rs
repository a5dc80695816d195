//! Scale command vocabulary and the wire command table

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Length of every wire command: three ASCII letters plus CR
pub const COMMAND_LEN: usize = 4;

/// Command terminator
pub const COMMAND_TERMINATOR: u8 = b'\r';

/// Standard scale commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScaleCommand {
    /// Request gross weight
    GrossWeight,
    /// Request net weight
    NetWeight,
    /// Request piece count
    Count,
    /// Request piece weight
    PieceWeight,
    /// Zero the scale
    Zero,
    /// Acquire tare
    Tare,
    /// Print the current reading
    Print,
    /// Request firmware version
    Version,
}

impl ScaleCommand {
    /// All standard commands
    pub fn all() -> &'static [ScaleCommand] {
        &[
            ScaleCommand::GrossWeight,
            ScaleCommand::NetWeight,
            ScaleCommand::Count,
            ScaleCommand::PieceWeight,
            ScaleCommand::Zero,
            ScaleCommand::Tare,
            ScaleCommand::Print,
            ScaleCommand::Version,
        ]
    }

    /// Semantic name used in the command table
    pub fn name(&self) -> &'static str {
        match self {
            ScaleCommand::GrossWeight => "grossWeight",
            ScaleCommand::NetWeight => "netWeight",
            ScaleCommand::Count => "count",
            ScaleCommand::PieceWeight => "pieceWeight",
            ScaleCommand::Zero => "zero",
            ScaleCommand::Tare => "tare",
            ScaleCommand::Print => "print",
            ScaleCommand::Version => "version",
        }
    }

    /// Factory default wire code
    pub fn default_code(&self) -> &'static str {
        match self {
            ScaleCommand::GrossWeight => "SGW\r",
            ScaleCommand::NetWeight => "SNW\r",
            ScaleCommand::Count => "SCO\r",
            ScaleCommand::PieceWeight => "SPW\r",
            ScaleCommand::Zero => "ZRO\r",
            ScaleCommand::Tare => "ATW\r",
            ScaleCommand::Print => "PRT\r",
            ScaleCommand::Version => "SVN\r",
        }
    }

    /// Look up a standard command by its semantic name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|c| c.name() == name)
    }
}

impl fmt::Display for ScaleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Check that a wire code is exactly three characters followed by CR
pub fn validate_code(name: &str, code: &str) -> Result<(), String> {
    if !code.as_bytes().ends_with(&[COMMAND_TERMINATOR]) {
        return Err(format!("Command '{}' must end with carriage return (\\r)", name));
    }
    if code.len() != COMMAND_LEN || !code.as_bytes()[..3].iter().all(u8::is_ascii_alphabetic) {
        return Err(format!(
            "Command '{}' must be exactly 3 letters followed by \\r",
            name
        ));
    }
    Ok(())
}

/// Mapping from command name to its 4-byte wire code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTable {
    codes: BTreeMap<String, [u8; COMMAND_LEN]>,
}

impl CommandTable {
    /// Build a table from name/code pairs, rejecting malformed codes
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, Vec<String>> {
        let mut codes = BTreeMap::new();
        let mut problems = Vec::new();

        for (name, code) in map {
            match validate_code(name, code) {
                Ok(()) => {
                    let mut bytes = [0u8; COMMAND_LEN];
                    bytes.copy_from_slice(code.as_bytes());
                    codes.insert(name.clone(), bytes);
                }
                Err(problem) => problems.push(problem),
            }
        }

        if problems.is_empty() {
            Ok(Self { codes })
        } else {
            Err(problems)
        }
    }

    /// Wire bytes for a command name
    pub fn get(&self, name: &str) -> Option<&[u8; COMMAND_LEN]> {
        self.codes.get(name)
    }

    /// Whether the table knows `name`
    pub fn contains(&self, name: &str) -> bool {
        self.codes.contains_key(name)
    }

    /// Command names in the table
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.codes.keys().map(String::as_str)
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        let codes = ScaleCommand::all()
            .iter()
            .map(|c| {
                let mut bytes = [0u8; COMMAND_LEN];
                bytes.copy_from_slice(c.default_code().as_bytes());
                (c.name().to_string(), bytes)
            })
            .collect();
        Self { codes }
    }
}

/// Default command map, as it appears in configuration
pub fn default_command_map() -> BTreeMap<String, String> {
    ScaleCommand::all()
        .iter()
        .map(|c| (c.name().to_string(), c.default_code().to_string()))
        .collect()
}
