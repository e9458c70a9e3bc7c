//! Bot session orchestrator.
//!
//! Drives one bot session at a time and reports everything the UI needs
//! through a [`Notification`] channel.
//!
//! ```text
//!            Connect                 transport up
//!   Idle ───────────────▸ Connecting ────────────▸ Active
//!    ▲ │                                              │
//!    │ └──────────── Start (single exchange) ────────▸│
//!    │                                                │ Disconnect / Exit /
//!    └──────────────────── Closing ◂──────────────────┘ failure / drained
//! ```
//!
//! There is no automatic reconnection. A transport failure produces one
//! toast and the session returns to idle.

use super::client::{BotClient, BotMessageStream};
use super::dedup::ProcessedIds;
use super::protocol::{AudioStreamRequest, BotMessage, WebSearchQuery, WebSearchResult};
use super::timeline::{post_question, RoomTimeline};
use super::ws::{AudioTransport, TransportEvent};
use crate::analytics::ErrorSink;
use crate::audio::{AudioBackend, AudioChunkPlayer, DuplexAudioSession, PlaybackEvent};
use crate::config::Config;
use crate::error::{AudioError, BotError, BotResult};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ── Public types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
        }
    }
}

/// Lifecycle requests from the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Open the duplex voice session.
    Connect,
    /// Run a single `stream_audio` exchange without capture.
    Start {
        room_id: String,
        request: AudioStreamRequest,
    },
    /// Halt capture only.
    Stop,
    Disconnect,
    Exit,
}

/// Everything the UI is told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    StateChanged(SessionState),
    /// Transient message; the UI hides it after `dismiss_after`.
    Toast {
        message: String,
        dismiss_after: Duration,
    },
    BotText(String),
    PlaybackStarted,
    PlaybackFinished,
    /// Capture needs a permission the user has not granted.
    PermissionRequired,
    WebSearch(WebSearchResult),
    Exited,
}

// ── Internal state ────────────────────────────────────────────────

enum SessionKind {
    Duplex(Arc<DuplexAudioSession>),
    Exchange(Arc<AudioChunkPlayer>),
}

struct ActiveSession {
    id: String,
    cancel: CancellationToken,
    /// `None` while still connecting.
    kind: Option<SessionKind>,
}

struct Inner {
    state: SessionState,
    session: Option<ActiveSession>,
}

struct Shared {
    inner: Mutex<Inner>,
    notifications: mpsc::UnboundedSender<Notification>,
    toast_duration: Duration,
}

impl Shared {
    fn notify(&self, notification: Notification) {
        if self.notifications.send(notification).is_err() {
            tracing::debug!("Notification receiver dropped");
        }
    }

    fn toast(&self, message: impl Into<String>) {
        self.notify(Notification::Toast {
            message: message.into(),
            dismiss_after: self.toast_duration,
        });
    }

    fn set_state(&self, inner: &mut Inner, state: SessionState) {
        if inner.state != state {
            tracing::info!(from = inner.state.as_str(), to = state.as_str(), "Session state");
            inner.state = state;
            self.notify(Notification::StateChanged(state));
        }
    }

    /// Claim the idle slot for a new session.
    fn begin(&self, id: &str, state: SessionState) -> Option<CancellationToken> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Idle {
            tracing::debug!(state = inner.state.as_str(), "Session busy, ignoring request");
            return None;
        }
        let cancel = CancellationToken::new();
        inner.session = Some(ActiveSession {
            id: id.to_string(),
            cancel: cancel.clone(),
            kind: None,
        });
        self.set_state(&mut inner, state);
        Some(cancel)
    }

    /// Attach the running parts to session `id`. The parts come back as
    /// the error if that session was torn down in the meantime.
    fn attach(&self, id: &str, kind: SessionKind) -> Result<(), SessionKind> {
        let mut inner = self.inner.lock();
        match inner.session.as_mut() {
            Some(session) if session.id == id && !session.cancel.is_cancelled() => {
                session.kind = Some(kind);
                self.set_state(&mut inner, SessionState::Active);
                Ok(())
            }
            _ => Err(kind),
        }
    }

    /// Tear down session `id` (any session if `None`) and return to idle.
    fn finish(&self, id: Option<&str>) -> bool {
        let session = {
            let mut inner = self.inner.lock();
            let matches = inner
                .session
                .as_ref()
                .is_some_and(|s| id.is_none_or(|id| s.id == id));
            if !matches {
                return false;
            }
            self.set_state(&mut inner, SessionState::Closing);
            inner.session.take()
        };

        if let Some(session) = session {
            session.cancel.cancel();
            if let Some(kind) = session.kind {
                shutdown(kind);
            }
            tracing::info!(session_id = %session.id, "Session closed");
        }

        let mut inner = self.inner.lock();
        self.set_state(&mut inner, SessionState::Idle);
        true
    }
}

/// Release the session's devices off the async workers; stopping the
/// player joins its thread, which may be inside a device write.
fn shutdown(kind: SessionKind) {
    tokio::task::spawn_blocking(move || match kind {
        SessionKind::Duplex(duplex) => duplex.close(),
        SessionKind::Exchange(player) => player.stop(),
    });
}

// ── Orchestrator ──────────────────────────────────────────────────

pub struct BotSessionOrchestrator {
    config: Config,
    client: BotClient,
    backend: Arc<dyn AudioBackend>,
    errors: Arc<dyn ErrorSink>,
    shared: Arc<Shared>,
}

impl BotSessionOrchestrator {
    /// Build the orchestrator and the receiver for its notifications.
    pub fn new(
        config: Config,
        backend: Arc<dyn AudioBackend>,
        errors: Arc<dyn ErrorSink>,
    ) -> BotResult<(Self, mpsc::UnboundedReceiver<Notification>)> {
        let processed = Arc::new(ProcessedIds::new(config.bot.dedup_retention()));
        let client = BotClient::new(config.bot.clone(), processed)?;
        let (notifications, rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                session: None,
            }),
            notifications,
            toast_duration: config.bot.toast_duration(),
        });

        Ok((
            Self {
                config,
                client,
                backend,
                errors,
                shared,
            },
            rx,
        ))
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    pub fn client(&self) -> &BotClient {
        &self.client
    }

    /// Apply a lifecycle event. Events that make no sense in the current
    /// state are ignored.
    pub async fn handle(&self, event: SessionEvent) {
        match event {
            SessionEvent::Connect => self.connect().await,
            SessionEvent::Start { room_id, request } => self.start_exchange(room_id, request).await,
            SessionEvent::Stop => self.stop_capture(),
            SessionEvent::Disconnect => {
                if !self.shared.finish(None) {
                    tracing::debug!("Disconnect with no session");
                }
            }
            SessionEvent::Exit => {
                self.shared.finish(None);
                self.shared.notify(Notification::Exited);
            }
        }
    }

    /// Post a spoken question to the room and play the bot's answer.
    pub async fn ask(&self, timeline: &dyn RoomTimeline, text: &str) {
        match post_question(timeline, text).await {
            Ok(Some(request)) => {
                self.handle(SessionEvent::Start {
                    room_id: timeline.room_id().to_string(),
                    request,
                })
                .await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, "Failed to post question");
                self.shared.toast(e.to_string());
            }
        }
    }

    /// Run a web search, publishing every update as a notification.
    pub async fn web_search(&self, query: &WebSearchQuery) -> BotResult<WebSearchResult> {
        let shared = Arc::clone(&self.shared);
        self.client
            .web_search(query, |result| {
                shared.notify(Notification::WebSearch(result.clone()));
            })
            .await
    }

    fn stop_capture(&self) {
        let inner = self.shared.inner.lock();
        match inner.session.as_ref().and_then(|s| s.kind.as_ref()) {
            Some(SessionKind::Duplex(duplex)) => duplex.stop_capture(),
            _ => tracing::debug!(state = inner.state.as_str(), "Stop with no capture running"),
        }
    }

    // ── Duplex voice session ──────────────────────────────────────

    async fn connect(&self) {
        let session_id = uuid::Uuid::new_v4().to_string();
        let Some(cancel) = self.shared.begin(&session_id, SessionState::Connecting) else {
            return;
        };

        match self.open_duplex(&session_id, cancel).await {
            Ok(duplex) => {
                if let Err(kind) = self.shared.attach(&session_id, SessionKind::Duplex(duplex)) {
                    tracing::debug!(session_id = %session_id, "Session ended while connecting");
                    shutdown(kind);
                }
            }
            Err(BotError::Audio(AudioError::PermissionDenied)) => {
                tracing::info!(session_id = %session_id, "Microphone permission required");
                self.shared.notify(Notification::PermissionRequired);
                self.shared.finish(Some(&session_id));
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Failed to start voice session");
                self.shared.toast(e.to_string());
                self.shared.finish(Some(&session_id));
            }
        }
    }

    async fn open_duplex(
        &self,
        session_id: &str,
        cancel: CancellationToken,
    ) -> BotResult<Arc<DuplexAudioSession>> {
        let audio = &self.config.audio;
        let capture = self.backend.open_capture(audio)?;
        let playback = self.backend.open_playback(audio)?;

        let transport =
            AudioTransport::connect(&self.config.bot.ws_url, session_id.to_string(), cancel.child_token())
                .await?;
        let (frames, transport_events) = transport.into_parts();

        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let duplex = DuplexAudioSession::start(
            capture,
            playback,
            audio,
            frames,
            playback_tx,
            Arc::clone(&self.errors),
            cancel.clone(),
        )?;
        let duplex = Arc::new(duplex);

        tokio::spawn(pump_transport(
            Arc::clone(&self.shared),
            session_id.to_string(),
            transport_events,
            Arc::clone(&duplex),
            cancel,
        ));
        tokio::spawn(forward_playback(
            Arc::clone(&self.shared),
            session_id.to_string(),
            playback_rx,
            false,
        ));

        Ok(duplex)
    }

    // ── Single exchange ───────────────────────────────────────────

    async fn start_exchange(&self, room_id: String, request: AudioStreamRequest) {
        let session_id = request.event_id.clone();
        let Some(cancel) = self.shared.begin(&session_id, SessionState::Active) else {
            return;
        };

        match self.open_exchange(&session_id, &room_id, &request, cancel).await {
            Ok(player) => {
                if let Err(kind) = self.shared.attach(&session_id, SessionKind::Exchange(player)) {
                    shutdown(kind);
                }
            }
            Err(BotError::AlreadyInProgress(id)) => {
                tracing::debug!(event_id = %id, "Exchange already running for this question");
                self.shared.finish(Some(&session_id));
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Bot exchange failed");
                self.shared.toast(e.to_string());
                self.shared.finish(Some(&session_id));
            }
        }
    }

    async fn open_exchange(
        &self,
        session_id: &str,
        room_id: &str,
        request: &AudioStreamRequest,
        cancel: CancellationToken,
    ) -> BotResult<Arc<AudioChunkPlayer>> {
        let messages = self.client.stream_audio(room_id, request).await?;
        let playback = self.backend.open_playback(&self.config.audio)?;

        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let player = Arc::new(AudioChunkPlayer::spawn(
            playback,
            self.config.audio.idle_poll(),
            playback_tx,
            cancel.child_token(),
        )?);

        tokio::spawn(pump_messages(
            Arc::clone(&self.shared),
            messages,
            Arc::clone(&player),
            cancel,
        ));
        tokio::spawn(forward_playback(
            Arc::clone(&self.shared),
            session_id.to_string(),
            playback_rx,
            true,
        ));

        Ok(player)
    }
}

// ── Background tasks ──────────────────────────────────────────────

async fn pump_transport(
    shared: Arc<Shared>,
    session_id: String,
    mut events: mpsc::Receiver<TransportEvent>,
    duplex: Arc<DuplexAudioSession>,
    cancel: CancellationToken,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Audio(chunk) => duplex.play(chunk),
            TransportEvent::Closed { reason } => {
                if !cancel.is_cancelled() {
                    let message = reason.unwrap_or_else(|| "Connection closed".to_string());
                    tracing::warn!(session_id = %session_id, reason = %message, "Audio transport ended");
                    shared.toast(message);
                    shared.finish(Some(&session_id));
                }
                break;
            }
        }
    }
}

async fn pump_messages(
    shared: Arc<Shared>,
    mut messages: BotMessageStream,
    player: Arc<AudioChunkPlayer>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            message = messages.next() => message,
        };
        match message {
            Some(BotMessage::Audio(bytes)) => player.enqueue(bytes),
            Some(BotMessage::Text(text)) => shared.notify(Notification::BotText(text)),
            None => break,
        }
    }
    player.finish();
}

/// Relay player events as notifications. With `end_on_complete`, the
/// session ends once playback has drained.
async fn forward_playback(
    shared: Arc<Shared>,
    session_id: String,
    mut events: mpsc::UnboundedReceiver<PlaybackEvent>,
    end_on_complete: bool,
) {
    let mut speaking = false;
    while let Some(event) = events.recv().await {
        match event {
            PlaybackEvent::Started => {
                speaking = true;
                shared.notify(Notification::PlaybackStarted);
            }
            PlaybackEvent::Silent => {
                if std::mem::take(&mut speaking) {
                    shared.notify(Notification::PlaybackFinished);
                }
            }
            PlaybackEvent::Completed => {
                if std::mem::take(&mut speaking) {
                    shared.notify(Notification::PlaybackFinished);
                }
                if end_on_complete {
                    shared.finish(Some(&session_id));
                    break;
                }
            }
            PlaybackEvent::Error(message) => {
                if std::mem::take(&mut speaking) {
                    shared.notify(Notification::PlaybackFinished);
                }
                shared.toast(format!("Playback error: {message}"));
            }
        }
    }
}
