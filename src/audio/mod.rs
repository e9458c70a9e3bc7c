//! Audio playback and capture.
//!
//! Concrete platform devices are external; this module owns the device
//! traits, the chunk player worker and the half-duplex session that ties
//! capture to playback.

pub mod device;
pub mod duplex;
pub mod player;

pub use device::{
    AudioBackend, AudioEffects, CaptureDevice, FileAudioBackend, PcmFileCapture, PcmFileSink,
    PlaybackDevice,
};
pub use duplex::DuplexAudioSession;
pub use player::AudioChunkPlayer;

/// Player lifecycle. Only the player worker mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
    PausedForSilence,
    /// Terminal: the worker has exited and the device is released.
    Ended,
}

impl PlaybackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Playing => "playing",
            Self::PausedForSilence => "paused_for_silence",
            Self::Ended => "ended",
        }
    }
}

/// Events raised by the player worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Playback began or resumed.
    Started,
    /// The queue stayed empty for one idle poll while playing.
    Silent,
    /// End of stream reached and the queue drained.
    Completed,
    /// A device operation failed; the affected chunk was dropped.
    Error(String),
}

impl PlaybackEvent {
    /// Whether the speaker is audible after this event.
    pub fn speaker_active(&self) -> bool {
        matches!(self, Self::Started)
    }
}
