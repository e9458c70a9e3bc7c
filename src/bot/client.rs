//! HTTP client for the bot backend.
//!
//! Two reqwest clients, both HTTP/1.1 only:
//! - `text_http` for the web search stream (60 s connect and read timeouts)
//! - `stream_http` for the audio object stream (10 s connect, no read timeout)
//!
//! Every request id goes through the shared [`ProcessedIds`] table first;
//! a repeat id fails fast with [`BotError::AlreadyInProgress`] and no
//! network activity.

use super::dedup::ProcessedIds;
use super::protocol::{AudioStreamRequest, BotMessage, WebSearchQuery, WebSearchResult, WebStreamRequest};
use crate::config::BotConfig;
use crate::error::{BotError, BotResult};
use crate::stream::{read_delimited_blocks, read_json_objects, TextBlock};
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const MESSAGE_CHANNEL_CAPACITY: usize = 64;

pub type TextBlockStream = ReceiverStream<TextBlock>;
pub type BotMessageStream = ReceiverStream<BotMessage>;

#[derive(Clone)]
pub struct BotClient {
    config: BotConfig,
    text_http: reqwest::Client,
    stream_http: reqwest::Client,
    processed: Arc<ProcessedIds>,
}

impl BotClient {
    pub fn new(config: BotConfig, processed: Arc<ProcessedIds>) -> BotResult<Self> {
        let text_http = reqwest::Client::builder()
            .http1_only()
            .connect_timeout(config.request_timeout())
            .read_timeout(config.request_timeout())
            .build()?;
        let stream_http = reqwest::Client::builder()
            .http1_only()
            .connect_timeout(config.connect_timeout())
            .build()?;

        Ok(Self {
            config,
            text_http,
            stream_http,
            processed,
        })
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn processed_ids(&self) -> &Arc<ProcessedIds> {
        &self.processed
    }

    // ── Web search ────────────────────────────────────────────────

    /// Stream the answer blocks for a web search question.
    ///
    /// Only a duplicate id is an error. Transport failures arrive as a
    /// single raw block carrying the error message, which ends the stream.
    pub fn web_stream(&self, request: &WebStreamRequest) -> BotResult<TextBlockStream> {
        self.claim(&request.first_message_event_id)?;

        let url = self.config.web_stream_url();
        let http = self.text_http.clone();
        let delimiter = self.config.delimiter.clone();
        let request = request.clone();
        let (tx, rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            tracing::info!(
                event_id = %request.first_message_event_id,
                url = %url,
                "Sending web search request"
            );
            let response = match post_json(&http, &url, &request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(error = %e, "Web search request failed");
                    let _ = tx.send(TextBlock::Raw(e.to_string())).await;
                    return;
                }
            };

            let mut blocks = read_delimited_blocks(response.bytes_stream(), delimiter);
            while let Some(block) = blocks.next().await {
                if tx.send(block).await.is_err() {
                    break;
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Run a web search to completion, calling `on_update` after every
    /// block with the accumulated result.
    ///
    /// A query with missing parameters yields the request error result and
    /// makes no network call.
    pub async fn web_search(
        &self,
        query: &WebSearchQuery,
        mut on_update: impl FnMut(&WebSearchResult),
    ) -> BotResult<WebSearchResult> {
        let Some(request) = query.to_request() else {
            tracing::warn!(?query, "Web search query is incomplete");
            let result = WebSearchResult::request_error();
            on_update(&result);
            return Ok(result);
        };

        let mut blocks = self.web_stream(&request)?;
        let mut result = WebSearchResult::new();
        while let Some(block) = blocks.next().await {
            result.apply(block);
            on_update(&result);
        }
        tracing::info!(
            links = result.links.len(),
            blocks = result.blocks_seen(),
            "Web search finished"
        );
        Ok(result)
    }

    // ── Audio answers ─────────────────────────────────────────────

    /// Start a `stream_audio` exchange and decode its record stream.
    ///
    /// Connection failures and non-2xx responses are returned as errors.
    /// Once streaming, malformed records are logged and skipped and a
    /// broken connection ends the stream.
    pub async fn stream_audio(
        &self,
        room_id: &str,
        request: &AudioStreamRequest,
    ) -> BotResult<BotMessageStream> {
        self.claim(&request.event_id)?;

        let url = self.config.stream_audio_url(room_id);
        tracing::info!(event_id = %request.event_id, url = %url, "Starting audio answer stream");
        let response = post_json(&self.stream_http, &url, request).await?;

        let mut values = read_json_objects(response.bytes_stream());
        let (tx, rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut decoded = 0usize;
            while let Some(value) = values.next().await {
                match BotMessage::from_value(value) {
                    Ok(Some(message)) => {
                        decoded += 1;
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "Skipping undecodable bot message"),
                }
            }
            tracing::debug!(messages = decoded, "Audio answer stream ended");
        });

        Ok(ReceiverStream::new(rx))
    }

    fn claim(&self, id: &str) -> BotResult<()> {
        self.processed.claim(id).map_err(|age| {
            tracing::debug!(id, claimed_ms_ago = age.as_millis() as u64, "Duplicate request id");
            BotError::AlreadyInProgress(id.to_string())
        })
    }
}

async fn post_json<T: Serialize + ?Sized>(
    http: &reqwest::Client,
    url: &str,
    body: &T,
) -> BotResult<reqwest::Response> {
    let response = http
        .post(url)
        .header("content-type", "application/json")
        .header("Origin", "null")
        .json(body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), url, body = %text, "Bot backend rejected request");
        return Err(BotError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }
    Ok(response)
}
