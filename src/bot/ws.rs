//! WebSocket audio transport.
//!
//! Raw PCM16 frames go out as binary messages; the server answers with raw
//! audio bytes, also binary. Text frames are logged and ignored.
//!
//! The socket is split into two tasks: the outbound loop drains a frame
//! channel into the sink, the inbound loop turns binary messages into
//! [`TransportEvent::Audio`]. Both stop when the cancellation token fires;
//! the outbound loop sends a Close frame on the way out.

use crate::error::{BotError, BotResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 256;

/// What the inbound side observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Audio(Vec<u8>),
    /// The connection is gone. `reason` is set when it failed rather than
    /// being closed normally.
    Closed { reason: Option<String> },
}

pub struct AudioTransport {
    outbound_tx: mpsc::Sender<Vec<u8>>,
    events: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
    session_id: String,
}

impl AudioTransport {
    /// Connect and spawn the outbound and inbound loops.
    pub async fn connect(
        url: &str,
        session_id: String,
        cancel: CancellationToken,
    ) -> BotResult<Self> {
        tracing::info!(session_id = %session_id, url, "Connecting audio WebSocket");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (ws_sender, ws_receiver) = ws_stream.split();

        let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_CAPACITY);
        let (event_tx, events) = mpsc::channel::<TransportEvent>(INBOUND_CAPACITY);

        let cancel_out = cancel.clone();
        let sid_out = session_id.clone();
        tokio::spawn(async move {
            Self::outbound_loop(outbound_rx, ws_sender, cancel_out, sid_out).await;
        });

        let cancel_in = cancel.clone();
        let sid_in = session_id.clone();
        tokio::spawn(async move {
            Self::inbound_loop(ws_receiver, event_tx, cancel_in, sid_in).await;
        });

        tracing::info!(session_id = %session_id, "Audio WebSocket connected");
        Ok(Self {
            outbound_tx,
            events,
            cancel,
            session_id,
        })
    }

    /// Sender for outbound frames, usable from blocking threads via
    /// `blocking_send`.
    pub fn frame_sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.outbound_tx.clone()
    }

    pub async fn send_audio(&self, pcm: &[u8]) -> BotResult<()> {
        if pcm.is_empty() {
            return Ok(());
        }
        self.outbound_tx
            .send(pcm.to_vec())
            .await
            .map_err(|_| BotError::Closed)
    }

    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Split into the frame sender and the event receiver.
    pub fn into_parts(self) -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<TransportEvent>) {
        (self.outbound_tx, self.events)
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    // ── Internal loops ────────────────────────────────────────────

    async fn outbound_loop(
        mut rx: mpsc::Receiver<Vec<u8>>,
        mut ws_sender: SplitSink<WsStream, WsMessage>,
        cancel: CancellationToken,
        session_id: String,
    ) {
        let mut frame_count: u64 = 0;

        loop {
            let frame = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    break;
                }
                frame = rx.recv() => frame,
            };
            let Some(frame) = frame else {
                let _ = ws_sender.send(WsMessage::Close(None)).await;
                break;
            };

            frame_count += 1;
            if frame_count == 1 || frame_count % 50 == 0 {
                tracing::debug!(
                    session_id = %session_id,
                    frame = frame_count,
                    bytes = frame.len(),
                    "Sending audio frame"
                );
            }
            if let Err(e) = ws_sender.send(WsMessage::Binary(frame.into())).await {
                tracing::warn!(
                    session_id = %session_id,
                    error = %e,
                    "WebSocket send failed, closing outbound loop"
                );
                break;
            }
        }

        tracing::debug!(session_id = %session_id, frames = frame_count, "Outbound loop terminated");
    }

    async fn inbound_loop(
        mut ws_receiver: SplitStream<WsStream>,
        event_tx: mpsc::Sender<TransportEvent>,
        cancel: CancellationToken,
        session_id: String,
    ) {
        let mut frame_count: u64 = 0;

        let reason = loop {
            let msg = tokio::select! {
                biased;
                () = cancel.cancelled() => break None,
                msg = ws_receiver.next() => msg,
            };

            match msg {
                Some(Ok(WsMessage::Binary(data))) => {
                    frame_count += 1;
                    if frame_count == 1 || frame_count % 50 == 0 {
                        tracing::debug!(
                            session_id = %session_id,
                            frame = frame_count,
                            bytes = data.len(),
                            "Received audio frame"
                        );
                    }
                    if event_tx.send(TransportEvent::Audio(data.to_vec())).await.is_err() {
                        break None;
                    }
                }
                Some(Ok(WsMessage::Text(text))) => {
                    tracing::debug!(session_id = %session_id, text = %text.as_str(), "Ignoring text frame");
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::info!(session_id = %session_id, ?frame, "Server closed audio WebSocket");
                    break None;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!(session_id = %session_id, error = %e, "Audio WebSocket failed");
                    break Some(e.to_string());
                }
                None => break None,
            }
        };

        let _ = event_tx.send(TransportEvent::Closed { reason }).await;
        tracing::debug!(session_id = %session_id, frames = frame_count, "Inbound loop terminated");
    }
}
