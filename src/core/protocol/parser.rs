//! Response line parser
//!
//! Turns one framed line into a [`ParsedResponse`]. Parsing never fails:
//! anything that matches no known shape comes back as a `raw` response.

use chrono::{DateTime, Local};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// What a response line describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseKind {
    /// `Err.xx` reply
    Error,
    /// Condition or completion notice
    Status,
    /// Gross weight reading
    GrossWeight,
    /// Net weight reading
    NetWeight,
    /// Piece count
    Count,
    /// Piece weight reading
    PieceWeight,
    /// Firmware version
    Version,
    /// Unrecognized line
    Raw,
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "error",
            Self::Status => "status",
            Self::GrossWeight => "grossWeight",
            Self::NetWeight => "netWeight",
            Self::Count => "count",
            Self::PieceWeight => "pieceWeight",
            Self::Version => "version",
            Self::Raw => "raw",
        };
        f.write_str(name)
    }
}

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// Normal reply
    #[default]
    Ok,
    /// Scale reported an error
    Error,
    /// Under-load
    Underload,
    /// Over-load
    Overload,
    /// A/D acquisition still running
    Acquiring,
    /// Zero/tare finished
    Complete,
    /// Could not be determined
    Unknown,
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Underload => "underload",
            Self::Overload => "overload",
            Self::Acquiring => "acquiring",
            Self::Complete => "complete",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl ResponseStatus {
    /// Whether the reply carries a usable reading
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok | Self::Complete)
    }
}

/// Value carried by a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseValue {
    /// Decimal reading
    Number(f64),
    /// Whole number (piece count)
    Integer(u64),
    /// Text (version, status line, raw line)
    Text(String),
}

impl ResponseValue {
    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Integer(n) => Some(*n as f64),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for ResponseValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Integer(n) => write!(f, "{}", n),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// A parsed response line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedResponse {
    /// Line shape
    pub kind: ResponseKind,
    /// Reading, count or version text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<ResponseValue>,
    /// Lowercased unit ("lb", "kg", "pieces")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Reported condition
    pub status: ResponseStatus,
    /// Error description for `Err.xx` lines
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Trimmed line
    pub raw: String,
    /// When the line was parsed
    pub timestamp: DateTime<Local>,
}

impl ParsedResponse {
    fn new(kind: ResponseKind, raw: &str, timestamp: DateTime<Local>) -> Self {
        Self {
            kind,
            value: None,
            unit: None,
            status: ResponseStatus::Ok,
            error: None,
            raw: raw.to_string(),
            timestamp,
        }
    }

    fn condition(raw: &str, status: ResponseStatus, error: &str, timestamp: DateTime<Local>) -> Self {
        Self {
            status,
            error: Some(error.to_string()),
            ..Self::new(ResponseKind::Status, raw, timestamp)
        }
    }

    fn reading(
        kind: ResponseKind,
        raw: &str,
        value: Option<ResponseValue>,
        unit: &str,
        timestamp: DateTime<Local>,
    ) -> Self {
        Self {
            value,
            unit: Some(unit.to_string()),
            ..Self::new(kind, raw, timestamp)
        }
    }

    fn text(kind: ResponseKind, raw: &str, value: &str, timestamp: DateTime<Local>) -> Self {
        Self {
            value: Some(ResponseValue::Text(value.to_string())),
            ..Self::new(kind, raw, timestamp)
        }
    }
}

fn weight_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(Gross|Net)\s+([\d.-]+)\s+(\w+)\.?$").unwrap())
}

fn count_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^Count\s+(\d+)\s+Pieces$").unwrap())
}

fn piece_weight_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^Piece Weight\s+([\d.-]+)\s+(\w+)\.?$").unwrap())
}

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^V\s+([\d.]+)$").unwrap())
}

fn number(text: &str) -> Option<ResponseValue> {
    text.parse::<f64>().ok().map(ResponseValue::Number)
}

/// Human-readable meaning of an `Err.xx` reply
pub fn describe_error(line: &str) -> String {
    match line {
        "Err.80" => "Serial command data error".to_string(),
        "Err.81" => "Unknown serial command".to_string(),
        other => format!("Scale error: {}", other),
    }
}

/// Parse a line received now
pub fn parse_response(line: &str) -> ParsedResponse {
    parse_at(line, Local::now())
}

/// Parse a line, stamping the result with `timestamp`
pub fn parse_at(line: &str, timestamp: DateTime<Local>) -> ParsedResponse {
    if line.starts_with("Err.") {
        return ParsedResponse {
            status: ResponseStatus::Error,
            error: Some(describe_error(line)),
            ..ParsedResponse::new(ResponseKind::Error, line, timestamp)
        };
    }

    match line {
        "ULULUL" => {
            return ParsedResponse::condition(line, ResponseStatus::Underload, "Under-load condition", timestamp)
        }
        "OLOLOL" => {
            return ParsedResponse::condition(line, ResponseStatus::Overload, "Over-load condition", timestamp)
        }
        "-------" => {
            return ParsedResponse::condition(
                line,
                ResponseStatus::Acquiring,
                "A/D acquisition in progress",
                timestamp,
            )
        }
        _ => {}
    }

    if let Some(caps) = weight_re().captures(line) {
        let kind = if caps[1].eq_ignore_ascii_case("gross") {
            ResponseKind::GrossWeight
        } else {
            ResponseKind::NetWeight
        };
        return ParsedResponse::reading(kind, line, number(&caps[2]), &caps[3], timestamp);
    }

    if let Some(caps) = count_re().captures(line) {
        let value = caps[1].parse::<u64>().ok().map(ResponseValue::Integer);
        return ParsedResponse::reading(ResponseKind::Count, line, value, "pieces", timestamp);
    }

    if let Some(caps) = piece_weight_re().captures(line) {
        return ParsedResponse::reading(ResponseKind::PieceWeight, line, number(&caps[1]), &caps[2], timestamp);
    }

    if let Some(caps) = version_re().captures(line) {
        return ParsedResponse::text(ResponseKind::Version, line, &caps[1], timestamp);
    }

    if line.contains("Complete") || line.contains("Acquired") {
        return ParsedResponse {
            status: ResponseStatus::Complete,
            ..ParsedResponse::text(ResponseKind::Status, line, line, timestamp)
        };
    }

    ParsedResponse::text(ResponseKind::Raw, line, line, timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> ParsedResponse {
        parse_response(line)
    }

    #[test]
    fn test_gross_weight() {
        let r = parse("Gross 100.55 lb.");
        assert_eq!(r.kind, ResponseKind::GrossWeight);
        assert_eq!(r.value, Some(ResponseValue::Number(100.55)));
        assert_eq!(r.unit.as_deref(), Some("lb"));
        assert_eq!(r.status, ResponseStatus::Ok);
        assert_eq!(r.error, None);
    }

    #[test]
    fn test_net_weight_case_insensitive() {
        let r = parse("NET -2.5 kg");
        assert_eq!(r.kind, ResponseKind::NetWeight);
        assert_eq!(r.value, Some(ResponseValue::Number(-2.5)));
        assert_eq!(r.unit.as_deref(), Some("kg"));
    }

    #[test]
    fn test_malformed_number_has_no_value() {
        let r = parse("Gross 1.2.3 lb.");
        assert_eq!(r.kind, ResponseKind::GrossWeight);
        assert_eq!(r.value, None);
    }

    #[test]
    fn test_count() {
        let r = parse("Count 157 Pieces");
        assert_eq!(r.kind, ResponseKind::Count);
        assert_eq!(r.value, Some(ResponseValue::Integer(157)));
        assert_eq!(r.unit.as_deref(), Some("pieces"));
    }

    #[test]
    fn test_piece_weight() {
        let r = parse("Piece Weight 0.635 lb.");
        assert_eq!(r.kind, ResponseKind::PieceWeight);
        assert_eq!(r.value, Some(ResponseValue::Number(0.635)));
        assert_eq!(r.unit.as_deref(), Some("lb"));
    }

    #[test]
    fn test_version() {
        let r = parse("V 2.01");
        assert_eq!(r.kind, ResponseKind::Version);
        assert_eq!(r.value, Some(ResponseValue::Text("2.01".to_string())));
    }

    #[test]
    fn test_errors() {
        let r = parse("Err.80");
        assert_eq!(r.kind, ResponseKind::Error);
        assert_eq!(r.status, ResponseStatus::Error);
        assert_eq!(r.error.as_deref(), Some("Serial command data error"));

        assert_eq!(parse("Err.81").error.as_deref(), Some("Unknown serial command"));
        assert_eq!(parse("Err.99").error.as_deref(), Some("Scale error: Err.99"));
    }

    #[test]
    fn test_conditions() {
        let r = parse("ULULUL");
        assert_eq!(r.kind, ResponseKind::Status);
        assert_eq!(r.status, ResponseStatus::Underload);
        assert_eq!(r.error.as_deref(), Some("Under-load condition"));

        assert_eq!(parse("OLOLOL").status, ResponseStatus::Overload);
        assert_eq!(parse("-------").status, ResponseStatus::Acquiring);
    }

    #[test]
    fn test_completion() {
        let r = parse("Tare Acquired");
        assert_eq!(r.kind, ResponseKind::Status);
        assert_eq!(r.status, ResponseStatus::Complete);
        assert_eq!(r.value, Some(ResponseValue::Text("Tare Acquired".to_string())));
        assert_eq!(parse("Zero Complete").status, ResponseStatus::Complete);
    }

    #[test]
    fn test_unrecognized_is_raw() {
        let r = parse("XYZZY");
        assert_eq!(r.kind, ResponseKind::Raw);
        assert_eq!(r.value, Some(ResponseValue::Text("XYZZY".to_string())));
        assert_eq!(r.status, ResponseStatus::Ok);
        assert_eq!(r.raw, "XYZZY");
    }

    #[test]
    fn test_error_prefix_wins_over_completion() {
        let r = parse("Err.Complete");
        assert_eq!(r.kind, ResponseKind::Error);
    }

    #[test]
    fn test_deterministic() {
        let ts = Local::now();
        for line in ["Gross 100.55 lb.", "Err.80", "ULULUL", "XYZZY", "V 2.01", "Count 3 Pieces"] {
            assert_eq!(parse_at(line, ts), parse_at(line, ts));
        }
    }

    #[test]
    fn test_serializes_camel_case_kind() {
        let json = serde_json::to_value(parse("Gross 1 lb")).unwrap();
        assert_eq!(json["kind"], "grossWeight");
        assert_eq!(json["status"], "ok");
        assert_eq!(json["value"], 1.0);
    }
}
