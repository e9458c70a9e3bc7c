//! Error types for the bot streaming pipeline.
//!
//! Library code returns these typed errors; the binary wraps them in
//! `anyhow` with context. Nothing here is fatal: callers either log and
//! skip (parse failures) or surface a toast and return to idle
//! (transport failures).

/// Errors raised while talking to the bot backend.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    /// A request with this identifier was already issued.
    #[error("Request {0} is already in progress")]
    AlreadyInProgress(String),
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("Invalid base64 audio data: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Transport closed")]
    Closed,
    /// The room timeline collaborator failed.
    #[error("Timeline error: {0}")]
    Timeline(String),
    #[error(transparent)]
    Audio(#[from] AudioError),
}

/// Errors raised by capture/playback devices.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    /// The user has not granted microphone access.
    #[error("Microphone permission denied")]
    PermissionDenied,
    /// The platform refused to start capture despite a granted permission.
    #[error("Security failure while starting capture: {0}")]
    Security(String),
    #[error("Audio device is not initialized")]
    NotInitialized,
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BotResult<T> = Result<T, BotError>;
pub type AudioResult<T> = Result<T, AudioError>;
