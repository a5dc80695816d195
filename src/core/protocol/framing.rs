//! Line framing for scale replies
//!
//! The scale terminates lines with CR, LF or both, in either order. The
//! framer accepts any of them, drops empty lines and keeps an incomplete
//! trailing segment until more bytes arrive.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::warn;

/// Default limit on a retained partial line
pub const DEFAULT_MAX_LINE: usize = 4096;

fn is_terminator(b: u8) -> bool {
    b == b'\r' || b == b'\n'
}

/// Incremental line splitter
#[derive(Debug, Clone)]
pub struct LineFramer {
    buffer: BytesMut,
    max_line: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    /// Create a framer with the default line limit
    pub fn new() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE)
    }

    /// Create a framer that discards partial lines longer than `max_line`
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(256),
            max_line,
        }
    }

    /// Append received bytes and return every line completed by them
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut src = std::mem::take(&mut self.buffer);
        src.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Ok(Some(line)) = self.decode(&mut src) {
            lines.push(line);
        }

        if src.len() > self.max_line {
            warn!(
                discarded = src.len(),
                limit = self.max_line,
                "Partial line exceeded limit, discarding"
            );
            src.clear();
        }

        self.buffer = src;
        lines
    }

    /// Bytes held back waiting for a terminator
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Drop any retained partial line
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Decoder for LineFramer {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, std::io::Error> {
        loop {
            let Some(pos) = src.iter().position(|&b| is_terminator(b)) else {
                return Ok(None);
            };

            let raw = src.split_to(pos);
            src.advance(1);

            let text = String::from_utf8_lossy(&raw);
            let line = text.trim();
            if !line.is_empty() {
                return Ok(Some(line.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_delivery_reassembles() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"Gross 100").is_empty());
        assert_eq!(framer.pending(), b"Gross 100");

        let lines = framer.push(b".55 lb.\r\n");
        assert_eq!(lines, vec!["Gross 100.55 lb.".to_string()]);
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn test_mixed_terminators() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"V 2.01\n\rULULUL\rCount 157 Pieces\r\nNet 9");
        assert_eq!(lines, vec!["V 2.01", "ULULUL", "Count 157 Pieces"]);
        assert_eq!(framer.pending(), b"Net 9");
    }

    #[test]
    fn test_blank_lines_skipped_and_trimmed() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"\r\n\r\n   \r\n  Zero Complete  \r\n");
        assert_eq!(lines, vec!["Zero Complete"]);
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let mut framer = LineFramer::new();
        let lines = framer.push(&[0xFF, b'A', b'\r']);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with('A'));
    }

    #[test]
    fn test_overlong_partial_discarded() {
        let mut framer = LineFramer::with_max_line(8);
        assert!(framer.push(b"0123456789").is_empty());
        assert!(framer.pending().is_empty());
        assert_eq!(framer.push(b"OLOLOL\r"), vec!["OLOLOL"]);
    }
}
