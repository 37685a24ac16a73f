//! Line framing for the completion event stream.
//!
//! Bytes arrive in arbitrary chunks. [`Utf8Decoder`] turns them into text
//! without splitting multi-byte characters, [`LineSplitter`] yields complete
//! lines and keeps the unterminated tail, and [`parse_line`] classifies each
//! line as a frame.

use crate::protocol::{CompletionChunk, DATA_PREFIX, DONE_SENTINEL};

const REPLACEMENT: char = '\u{FFFD}';

/// Incremental UTF-8 decoder that carries incomplete sequences across chunks.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decodes as much of `pending + chunk` as forms complete characters.
    /// Invalid sequences become U+FFFD; a truncated sequence at the end is
    /// held back for the next call.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut out = String::with_capacity(self.pending.len());
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(text) => {
                    out.push_str(text);
                    start = self.pending.len();
                    break;
                }
                Err(err) => {
                    let valid = start + err.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[start..valid]).unwrap_or_default());
                    match err.error_len() {
                        Some(len) => {
                            out.push(REPLACEMENT);
                            start = valid + len;
                        }
                        None => {
                            start = valid;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..start);
        out
    }

    /// Ends the stream. Bytes of a truncated trailing character are dropped
    /// and their count returned.
    pub fn finish(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

/// Splits decoded text into lines, keeping a partial line until its newline
/// arrives.
#[derive(Debug, Default)]
pub struct LineSplitter {
    decoder: Utf8Decoder,
    buffer: String,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let text = self.decoder.decode(chunk);
        self.buffer.push_str(&text);
    }

    /// Takes the next complete line, without its `\n` or trailing `\r`.
    pub fn next_line(&mut self) -> Option<String> {
        let idx = self.buffer.find('\n')?;
        let mut line: String = self.buffer.drain(..=idx).collect();
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }

    /// Drains every complete line currently buffered.
    pub fn lines(&mut self) -> Lines<'_> {
        Lines { splitter: self }
    }

    /// Ends the stream and discards whatever never got a newline.
    pub fn finish(&mut self) {
        let dropped_bytes = self.decoder.finish();
        if dropped_bytes > 0 || !self.buffer.is_empty() {
            tracing::debug!(
                dropped_bytes,
                partial_line = self.buffer.len(),
                "discarding unterminated stream tail"
            );
        }
        self.buffer.clear();
    }
}

pub struct Lines<'a> {
    splitter: &'a mut LineSplitter,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.splitter.next_line()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Blank line, comment, or a field this client does not read.
    Ignored,
    Data(&'a str),
    Done,
}

pub fn parse_line(line: &str) -> Frame<'_> {
    if line.trim().is_empty() || line.starts_with(':') {
        return Frame::Ignored;
    }

    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return Frame::Ignored;
    };

    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        Frame::Done
    } else {
        Frame::Data(payload)
    }
}

/// Extracts the text delta from a data payload. Payloads that do not parse
/// are skipped.
pub fn payload_delta(payload: &str) -> Option<String> {
    match serde_json::from_str::<CompletionChunk>(payload) {
        Ok(chunk) => chunk.into_delta(),
        Err(err) => {
            tracing::debug!(error = %err, "skipping malformed stream frame");
            None
        }
    }
}
