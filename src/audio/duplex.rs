//! Half-duplex voice session.
//!
//! Runs capture and playback at the same time. While the speaker is
//! audible the microphone frames are replaced by zero frames of the same
//! length, so the bot never hears itself.
//!
//! ```text
//! mic ─▸ capture thread ─▸ (silence? zeros : frame) ─▸ outbound ─▸ transport
//! transport ─▸ play() ─▸ AudioChunkPlayer ─▸ speaker
//!                               │
//!                               └─▸ PlaybackEvent ─▸ silence flag ─▸ caller
//! ```

use super::{AudioChunkPlayer, CaptureDevice, PlaybackDevice, PlaybackEvent, PlaybackState};
use crate::analytics::ErrorSink;
use crate::config::AudioConfig;
use crate::error::{AudioError, AudioResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Handle to a running duplex session.
pub struct DuplexAudioSession {
    player: AudioChunkPlayer,
    silence: Arc<AtomicBool>,
    capture_cancel: CancellationToken,
    capture_active: AtomicBool,
    /// Keeps the outbound channel open after capture ends. The transport
    /// closes on cancellation only.
    _frames: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

impl DuplexAudioSession {
    /// Start capture and playback.
    ///
    /// `outbound` receives one frame per capture read and stays open for the
    /// life of the session, even once capture stops. `events` receives the
    /// player's events after the silence flag has been updated for them.
    ///
    /// Returns [`AudioError::PermissionDenied`] without starting anything
    /// when capture is not allowed. A [`AudioError::Security`] failure is
    /// reported to `errors` and the session runs playback-only.
    pub fn start(
        mut capture: Box<dyn CaptureDevice>,
        playback: Box<dyn PlaybackDevice>,
        config: &AudioConfig,
        outbound: mpsc::Sender<Vec<u8>>,
        events: mpsc::UnboundedSender<PlaybackEvent>,
        errors: Arc<dyn ErrorSink>,
        cancel: CancellationToken,
    ) -> AudioResult<Self> {
        let effects = capture.enable_effects();
        tracing::info!(
            echo_cancellation = effects.echo_cancellation,
            noise_suppression = effects.noise_suppression,
            "Capture effects"
        );

        let capture_started = match capture.start() {
            Ok(()) => true,
            Err(AudioError::Security(reason)) => {
                errors.track_error("capture.start", &AudioError::Security(reason));
                false
            }
            Err(e) => return Err(e),
        };

        let silence = Arc::new(AtomicBool::new(false));
        let (player_tx, player_rx) = mpsc::unbounded_channel();
        let player = AudioChunkPlayer::spawn(
            playback,
            config.idle_poll(),
            player_tx,
            cancel.child_token(),
        )?;

        tokio::spawn(forward_playback_events(
            player_rx,
            Arc::clone(&silence),
            events,
        ));

        let capture_cancel = cancel.child_token();
        if capture_started {
            let loop_silence = Arc::clone(&silence);
            let loop_cancel = capture_cancel.clone();
            let loop_frames = outbound.clone();
            std::thread::Builder::new()
                .name("botstream-capture".into())
                .spawn(move || capture_loop(capture, loop_frames, loop_silence, loop_cancel))?;
        }

        Ok(Self {
            player,
            silence,
            capture_cancel,
            capture_active: AtomicBool::new(capture_started),
            _frames: outbound,
            cancel,
        })
    }

    /// Queue inbound audio for playback.
    pub fn play(&self, chunk: Vec<u8>) {
        self.player.enqueue(chunk);
    }

    /// Halt the microphone only; playback and transport keep running.
    pub fn stop_capture(&self) {
        if self.capture_active.swap(false, Ordering::AcqRel) {
            tracing::info!("Stopping capture");
            self.capture_cancel.cancel();
        }
    }

    pub fn capture_active(&self) -> bool {
        self.capture_active.load(Ordering::Acquire) && !self.capture_cancel.is_cancelled()
    }

    pub fn mic_silenced(&self) -> bool {
        self.silence.load(Ordering::Acquire)
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.player.state()
    }

    /// Stop capture and playback and release both devices.
    pub fn close(&self) {
        self.stop_capture();
        self.player.stop();
        self.cancel.cancel();
        tracing::info!("Duplex session closed");
    }
}

async fn forward_playback_events(
    mut player_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    silence: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
) {
    while let Some(event) = player_rx.recv().await {
        let active = event.speaker_active();
        if silence.swap(active, Ordering::AcqRel) != active {
            tracing::debug!(silenced = active, "Mic silence toggled");
        }
        if events.send(event).is_err() {
            tracing::debug!("Playback event receiver dropped");
        }
    }
}

fn capture_loop(
    mut capture: Box<dyn CaptureDevice>,
    outbound: mpsc::Sender<Vec<u8>>,
    silence: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut frame = vec![0u8; capture.frame_size()];
    let mut sent: u64 = 0;

    while !cancel.is_cancelled() {
        let n = match capture.read(&mut frame) {
            Ok(0) => {
                tracing::info!(frames = sent, "Capture source exhausted");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, frames = sent, "Capture read failed");
                break;
            }
        };
        if cancel.is_cancelled() {
            break;
        }

        let silenced = silence.load(Ordering::Acquire);
        let payload = if silenced {
            vec![0u8; n]
        } else {
            frame[..n].to_vec()
        };
        if outbound.blocking_send(payload).is_err() {
            tracing::debug!(frames = sent, "Outbound channel closed");
            break;
        }

        sent += 1;
        if sent == 1 || sent % 50 == 0 {
            tracing::debug!(frames = sent, bytes = n, silenced, "Sent capture frame");
        }
    }

    capture.stop();
}
