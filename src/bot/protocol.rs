//! Bot backend wire schema.
//!
//! ## Endpoints
//!
//! ```text
//! POST /web_stream              WebStreamRequest   ─▸ delimited text/HTML blocks
//! POST /stream_audio/{roomId}   AudioStreamRequest ─▸ {"type":…,"data":…}{…}…
//! WS   /ws/audio                binary PCM16 frames in both directions
//! ```

use crate::error::{BotError, BotResult};
use crate::stream::{StyledText, TextBlock};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Answer text shown when a web search request cannot be built.
pub const REQUEST_ERROR_TEXT: &str = "Error sending request";

// ── Requests ──────────────────────────────────────────────────────

/// Body of `POST /web_stream`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebStreamRequest {
    #[serde(rename = "roomId")]
    pub room_id: String,
    /// Timeline event that carried the question; also the dedup key.
    #[serde(rename = "firstMessageEventId")]
    pub first_message_event_id: String,
    pub question: String,
    /// Identifier of the question itself.
    #[serde(rename = "eventId")]
    pub event_id: String,
}

/// Web search parameters as they arrive from a timeline event, any of
/// which may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WebSearchQuery {
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default, rename = "questionId")]
    pub question_id: Option<String>,
    #[serde(default)]
    pub raw_question: Option<String>,
}

impl WebSearchQuery {
    /// Build the request, or `None` if any parameter is missing.
    pub fn to_request(&self) -> Option<WebStreamRequest> {
        Some(WebStreamRequest {
            room_id: self.room_id.clone()?,
            first_message_event_id: self.event_id.clone()?,
            question: self.raw_question.clone()?,
            event_id: self.question_id.clone()?,
        })
    }
}

/// Body of `POST /stream_audio/{roomId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioStreamRequest {
    pub query: String,
    /// Timeline event id of the posted question; also the dedup key.
    #[serde(rename = "eventId")]
    pub event_id: String,
    pub user_id: String,
}

// ── Responses ─────────────────────────────────────────────────────

/// One decoded record of the `stream_audio` object stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotMessage {
    /// Decoded audio bytes.
    Audio(Vec<u8>),
    Text(String),
}

#[derive(Deserialize)]
struct RawBotMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: String,
}

impl BotMessage {
    /// Decode a `{type, data}` record. Unknown types yield `Ok(None)`.
    pub fn from_value(value: Value) -> BotResult<Option<Self>> {
        let raw: RawBotMessage = serde_json::from_value(value)?;
        match raw.kind.as_str() {
            "audio" => {
                let bytes = base64::engine::general_purpose::STANDARD.decode(raw.data.trim())?;
                Ok(Some(Self::Audio(bytes)))
            }
            "text" => Ok(Some(Self::Text(raw.data))),
            other => {
                tracing::debug!(kind = other, "Ignoring bot message of unknown type");
                Ok(None)
            }
        }
    }
}

// ── Web search result ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SourceLinks {
    #[serde(default)]
    source_links: Vec<Value>,
}

/// Accumulated state of one web search answer stream.
///
/// The first block carries a JSON object with `source_links`; every later
/// block replaces the displayed answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebSearchResult {
    pub links: Vec<String>,
    pub answer: StyledText,
    blocks_seen: usize,
}

impl WebSearchResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Result for a request that could not be sent.
    pub fn request_error() -> Self {
        Self {
            links: Vec::new(),
            answer: StyledText::plain(REQUEST_ERROR_TEXT),
            blocks_seen: 0,
        }
    }

    /// Fold in the next block of the stream.
    pub fn apply(&mut self, block: TextBlock) {
        self.blocks_seen += 1;
        if self.blocks_seen == 1 {
            self.links = extract_source_links(block.text());
            return;
        }
        self.answer = match block {
            TextBlock::Raw(text) => StyledText::plain(text),
            TextBlock::Styled(styled) => styled,
        };
    }

    pub fn blocks_seen(&self) -> usize {
        self.blocks_seen
    }
}

/// Parse `source_links` out of the JSON object embedded in `text`. Any
/// failure yields no links.
pub fn extract_source_links(text: &str) -> Vec<String> {
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Vec::new();
    };
    if end < start {
        return Vec::new();
    }

    match serde_json::from_str::<SourceLinks>(&text[start..=end]) {
        Ok(parsed) => parsed
            .source_links
            .into_iter()
            .map(|link| match link {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        Err(e) => {
            tracing::debug!(error = %e, "First block carried no source links");
            Vec::new()
        }
    }
}
