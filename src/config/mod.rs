//! Runtime configuration.
//!
//! Loaded from TOML (`config.toml` in the platform config directory, or an
//! explicit path), then overridden from the environment:
//!
//! - `BOT_API_URL` → `bot.base_url`
//! - `BOT_WS_URL`  → `bot.ws_url`
//!
//! A missing file is not an error; defaults apply.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Block separator used by the `/web_stream` endpoint.
pub const DEFAULT_DELIMITER: &str = "$_$";

/// PCM16 mono sample rate shared by capture and playback.
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// 40 ms of PCM16 mono at 24 kHz.
const DEFAULT_CAPTURE_FRAME_BYTES: usize = 1_920;

/// Minimum device buffer (40 ms) times four, as the playback track is sized.
const DEFAULT_PLAYBACK_BUFFER_BYTES: usize = DEFAULT_CAPTURE_FRAME_BYTES * 4;

const CONFIG_FILE_NAME: &str = "config.toml";

// ── Sections ─────────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bot: BotConfig,
    pub audio: AudioConfig,
}

/// Bot backend endpoints and request behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Base URL for `/web_stream` and `/stream_audio/{roomId}`.
    pub base_url: String,
    /// Full WebSocket URL of the duplex audio endpoint.
    pub ws_url: String,
    /// Line prefix separating blocks in the web search stream.
    pub delimiter: String,
    /// Overall timeout for the buffered text client, seconds.
    pub request_timeout_secs: u64,
    /// Connect timeout for streaming requests, seconds.
    pub connect_timeout_secs: u64,
    /// How long a processed request id blocks duplicates, seconds.
    pub dedup_retention_secs: u64,
    /// How long toast notifications stay visible, milliseconds.
    pub toast_ms: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            ws_url: "ws://127.0.0.1:8000/ws/audio".to_string(),
            delimiter: DEFAULT_DELIMITER.to_string(),
            request_timeout_secs: 60,
            connect_timeout_secs: 10,
            dedup_retention_secs: 24 * 60 * 60,
            toast_ms: 2_000,
        }
    }
}

/// Audio framing shared by capture, playback and the WebSocket transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Bytes read from the microphone per outbound frame.
    pub capture_frame_bytes: usize,
    /// Largest single write accepted by the playback device.
    pub playback_buffer_bytes: usize,
    /// Bounded wait of the playback worker before it declares silence.
    pub idle_poll_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            capture_frame_bytes: DEFAULT_CAPTURE_FRAME_BYTES,
            playback_buffer_bytes: DEFAULT_PLAYBACK_BUFFER_BYTES,
            idle_poll_ms: 1_000,
        }
    }
}

impl BotConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn dedup_retention(&self) -> Duration {
        Duration::from_secs(self.dedup_retention_secs)
    }

    pub fn toast_duration(&self) -> Duration {
        Duration::from_millis(self.toast_ms)
    }

    /// `{base_url}/web_stream`
    pub fn web_stream_url(&self) -> String {
        format!("{}/web_stream", self.base_url.trim_end_matches('/'))
    }

    /// `{base_url}/stream_audio/{room_id}`
    pub fn stream_audio_url(&self, room_id: &str) -> String {
        format!(
            "{}/stream_audio/{room_id}",
            self.base_url.trim_end_matches('/')
        )
    }
}

impl AudioConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl Config {
    /// Default config file location (`<config dir>/botstream/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "botstream", "botstream")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Load from `path` (with `~` expansion) or the default location,
    /// apply environment overrides and validate.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = match path {
            Some(raw) => Some(PathBuf::from(shellexpand::tilde(raw).as_ref())),
            None => Self::default_path(),
        };

        let mut config = match path {
            Some(ref p) if p.exists() => Self::from_file(p)?,
            Some(ref p) => {
                tracing::debug!(path = %p.display(), "No config file, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without applying overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("BOT_API_URL").filter(|v| !v.trim().is_empty()) {
            self.bot.base_url = url.trim().to_string();
        }
        if let Some(url) = lookup("BOT_WS_URL").filter(|v| !v.trim().is_empty()) {
            self.bot.ws_url = url.trim().to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        let base = &self.bot.base_url;
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            anyhow::bail!("bot.base_url must be an http(s) URL, got {base:?}");
        }
        let ws = &self.bot.ws_url;
        if !(ws.starts_with("ws://") || ws.starts_with("wss://")) {
            anyhow::bail!("bot.ws_url must be a ws(s) URL, got {ws:?}");
        }
        if self.bot.delimiter.is_empty() {
            anyhow::bail!("bot.delimiter must not be empty");
        }
        if self.audio.sample_rate == 0 {
            anyhow::bail!("audio.sample_rate must be positive");
        }
        if self.audio.capture_frame_bytes == 0 || self.audio.capture_frame_bytes % 2 != 0 {
            anyhow::bail!(
                "audio.capture_frame_bytes must be a positive multiple of 2, got {}",
                self.audio.capture_frame_bytes
            );
        }
        if self.audio.playback_buffer_bytes == 0 {
            anyhow::bail!("audio.playback_buffer_bytes must be positive");
        }
        if self.audio.idle_poll_ms == 0 {
            anyhow::bail!("audio.idle_poll_ms must be positive");
        }
        Ok(())
    }

    /// Render as TOML (used by `botstream config`).
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}
