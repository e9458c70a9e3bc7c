//! Bot backend: HTTP client, WebSocket transport, timeline seam and the
//! session orchestrator that drives them.

pub mod client;
pub mod dedup;
pub mod orchestrator;
pub mod protocol;
pub mod timeline;
pub mod ws;

pub use client::{BotClient, BotMessageStream, TextBlockStream};
pub use dedup::ProcessedIds;
pub use orchestrator::{BotSessionOrchestrator, Notification, SessionEvent, SessionState};
pub use protocol::{
    AudioStreamRequest, BotMessage, WebSearchQuery, WebSearchResult, WebStreamRequest,
};
pub use timeline::{post_question, RoomTimeline};
pub use ws::{AudioTransport, TransportEvent};
