//! Room timeline seam and the voice question flow.
//!
//! A recognized utterance is posted to the room as formatted HTML, then the
//! timeline is polled until the event id of that post shows up. The id keys
//! the `stream_audio` request for the answer.

use super::protocol::AudioStreamRequest;
use crate::error::BotResult;
use async_trait::async_trait;
use std::time::Duration;

/// Plain body sent alongside the formatted question.
pub const QUESTION_PLAIN_BODY: &str = "Init from homepage...";

const EVENT_ID_POLL: Duration = Duration::from_millis(500);
const EVENT_ID_TIMEOUT: Duration = Duration::from_secs(5);

/// The chat room the bot answers in.
#[async_trait]
pub trait RoomTimeline: Send + Sync {
    fn room_id(&self) -> &str;

    fn user_id(&self) -> &str;

    /// Post a message with a plain and an HTML body.
    async fn send_message(&self, body: &str, html_body: &str) -> BotResult<()>;

    /// Event id of the most recent message whose HTML body equals
    /// `html_body`, once the timeline has it.
    async fn event_id_for_formatted_body(&self, html_body: &str) -> Option<String>;
}

/// HTML body used when posting a spoken question.
pub fn formatted_question(text: &str) -> String {
    format!("<p>{text}</p>")
}

/// Poll the timeline for the event id of `html_body` every `poll` until
/// `limit` elapses.
pub async fn wait_for_event_id(
    timeline: &dyn RoomTimeline,
    html_body: &str,
    poll: Duration,
    limit: Duration,
) -> Option<String> {
    let search = async {
        loop {
            if let Some(id) = timeline.event_id_for_formatted_body(html_body).await {
                return id;
            }
            tokio::time::sleep(poll).await;
        }
    };
    tokio::time::timeout(limit, search).await.ok()
}

/// Post `text` to the room and build the `stream_audio` request for it.
///
/// `Ok(None)` when the posted event never appeared on the timeline.
pub async fn post_question(
    timeline: &dyn RoomTimeline,
    text: &str,
) -> BotResult<Option<AudioStreamRequest>> {
    let html_body = formatted_question(text);
    timeline.send_message(QUESTION_PLAIN_BODY, &html_body).await?;

    let Some(event_id) =
        wait_for_event_id(timeline, &html_body, EVENT_ID_POLL, EVENT_ID_TIMEOUT).await
    else {
        tracing::warn!(
            room_id = timeline.room_id(),
            "Posted question never appeared on the timeline"
        );
        return Ok(None);
    };

    tracing::debug!(room_id = timeline.room_id(), event_id = %event_id, "Question posted");
    Ok(Some(AudioStreamRequest {
        query: text.to_string(),
        event_id,
        user_id: timeline.user_id().to_string(),
    }))
}
