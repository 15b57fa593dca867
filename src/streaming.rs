//! Buffered decoder for newline-delimited JSON streams.
//!
//! Network chunks split lines, and sometimes multi-byte characters,
//! at arbitrary positions. The decoder buffers raw bytes and only decodes
//! complete lines.

use serde_json::Value;

/// Line buffer turning raw NDJSON chunks into values.
///
/// # Example
///
/// ```
/// use lm_functions::streaming::NdjsonDecoder;
///
/// let mut decoder = NdjsonDecoder::new();
/// assert!(decoder.decode(b"{\"response\":\"to").is_empty());
///
/// let values = decoder.decode(b"ken\"}\n{\"done\":");
/// assert_eq!(values[0]["response"], "token");
/// assert_eq!(decoder.flush(), None);
/// ```
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw chunk and return the values of every line it completes.
    ///
    /// Lines that are not valid JSON are skipped.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);

        let mut values = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(value) = parse_line(&line) {
                values.push(value);
            }
        }
        values
    }

    /// Decode whatever trails the last newline once the stream has ended.
    pub fn flush(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }
}

fn parse_line(line: &[u8]) -> Option<Value> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(error = %err, line = %text, "skipping malformed NDJSON line");
            None
        }
    }
}
