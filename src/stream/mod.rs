//! Incremental readers for bot answer streams.
//!
//! Two wire shapes come back from the bot backend:
//!
//! - `/web_stream`: line-oriented text where a delimiter line separates
//!   blocks ([`delimited`]).
//! - `/stream_audio/{roomId}`: back-to-back JSON objects with no framing
//!   ([`json_objects`]).
//!
//! Both readers are push-based state machines with an async driver on top,
//! so they can be fed from any byte stream and tested without a network.

pub mod delimited;
pub mod html;
pub mod json_objects;

pub use delimited::{read_delimited_blocks, DelimitedBlockParser};
pub use html::{html_to_styled, linkify, LinkSpan, StyledText};
pub use json_objects::{read_json_objects, JsonObjectSplitter};

/// One block of a delimited answer stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextBlock {
    /// Passed through untouched (the first block of a stream).
    Raw(String),
    /// HTML rendered to plain text with link spans.
    Styled(StyledText),
}

impl TextBlock {
    /// Visible text regardless of variant.
    pub fn text(&self) -> &str {
        match self {
            Self::Raw(text) => text,
            Self::Styled(styled) => &styled.text,
        }
    }

    pub fn links(&self) -> &[LinkSpan] {
        match self {
            Self::Raw(_) => &[],
            Self::Styled(styled) => &styled.links,
        }
    }
}

/// Splits a byte stream into text lines.
///
/// Bytes are buffered until a `\n` arrives, so a multi-byte UTF-8 sequence
/// split across reads decodes correctly. A trailing `\r` is dropped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a read, returning every line it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Unterminated last line, if any bytes remain.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.pending);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}
