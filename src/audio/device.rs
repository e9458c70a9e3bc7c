//! Audio device seams.
//!
//! Capture and playback hardware is platform specific, so the pipeline only
//! talks to [`CaptureDevice`] and [`PlaybackDevice`]. Devices are blocking:
//! they are driven from dedicated worker threads, never from async tasks.
//!
//! The file-backed implementations read and write raw PCM16 mono and back
//! the CLI and the tests.

use crate::config::AudioConfig;
use crate::error::{AudioError, AudioResult};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bytes per PCM16 mono sample.
const BYTES_PER_SAMPLE: u64 = 2;

/// Device-level voice processing the capture device managed to enable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioEffects {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

pub trait PlaybackDevice: Send {
    /// Largest write the device accepts at once, in bytes.
    fn buffer_capacity(&self) -> usize;

    /// Start or resume output.
    fn start(&mut self) -> AudioResult<()>;

    /// Write PCM bytes, returning how many were accepted.
    fn write(&mut self, pcm: &[u8]) -> AudioResult<usize>;

    fn pause(&mut self) -> AudioResult<()>;

    /// Flush and free the device. It may be started again afterwards.
    fn release(&mut self);
}

pub trait CaptureDevice: Send {
    /// Bytes returned by one [`read`](Self::read).
    fn frame_size(&self) -> usize;

    /// Begin recording. Fails with [`AudioError::PermissionDenied`] when the
    /// user has not granted access and [`AudioError::Security`] when the
    /// platform refuses anyway.
    fn start(&mut self) -> AudioResult<()>;

    /// Block until a frame is available. `Ok(0)` means the source is
    /// exhausted.
    fn read(&mut self, frame: &mut [u8]) -> AudioResult<usize>;

    fn stop(&mut self);

    /// Turn on echo cancellation and noise suppression where supported.
    fn enable_effects(&mut self) -> AudioEffects {
        AudioEffects::default()
    }
}

/// Opens devices for a session.
pub trait AudioBackend: Send + Sync {
    fn open_capture(&self, config: &AudioConfig) -> AudioResult<Box<dyn CaptureDevice>>;
    fn open_playback(&self, config: &AudioConfig) -> AudioResult<Box<dyn PlaybackDevice>>;
}

// ── File capture ────────────────────────────────────────────────

/// Reads raw PCM16 frames from a file, optionally paced to real time.
pub struct PcmFileCapture {
    path: PathBuf,
    file: Option<File>,
    frame_size: usize,
    pace: Option<Duration>,
}

impl PcmFileCapture {
    pub fn new(path: impl Into<PathBuf>, config: &AudioConfig) -> Self {
        Self {
            path: path.into(),
            file: None,
            frame_size: config.capture_frame_bytes,
            pace: Some(frame_duration(config.capture_frame_bytes, config.sample_rate)),
        }
    }

    /// Read as fast as the consumer allows.
    pub fn unpaced(mut self) -> Self {
        self.pace = None;
        self
    }
}

impl CaptureDevice for PcmFileCapture {
    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn start(&mut self) -> AudioResult<()> {
        let file = File::open(&self.path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => AudioError::PermissionDenied,
            _ => AudioError::Io(e),
        })?;
        tracing::info!(path = %self.path.display(), frame_bytes = self.frame_size, "File capture started");
        self.file = Some(file);
        Ok(())
    }

    fn read(&mut self, frame: &mut [u8]) -> AudioResult<usize> {
        let file = self.file.as_mut().ok_or(AudioError::NotInitialized)?;
        if let Some(pace) = self.pace {
            std::thread::sleep(pace);
        }

        let mut filled = 0;
        while filled < frame.len() {
            let n = file.read(&mut frame[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        // Keep whole samples only.
        Ok(filled - filled % BYTES_PER_SAMPLE as usize)
    }

    fn stop(&mut self) {
        if self.file.take().is_some() {
            tracing::debug!(path = %self.path.display(), "File capture stopped");
        }
    }
}

// ── File playback ───────────────────────────────────────────────

/// Appends played PCM to a file.
pub struct PcmFileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    capacity: usize,
    written: u64,
}

impl PcmFileSink {
    /// Create (truncating) the output file.
    pub fn create(path: impl Into<PathBuf>, config: &AudioConfig) -> AudioResult<Self> {
        let path = path.into();
        File::create(&path)?;
        Ok(Self {
            path,
            writer: None,
            capacity: config.playback_buffer_bytes,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl PlaybackDevice for PcmFileSink {
    fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    fn start(&mut self) -> AudioResult<()> {
        if self.writer.is_none() {
            let file = std::fs::OpenOptions::new().append(true).open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) -> AudioResult<usize> {
        let writer = self.writer.as_mut().ok_or(AudioError::NotInitialized)?;
        writer.write_all(pcm)?;
        self.written += pcm.len() as u64;
        Ok(pcm.len())
    }

    fn pause(&mut self) -> AudioResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to flush playback file");
            }
            tracing::debug!(path = %self.path.display(), bytes = self.written, "Playback file released");
        }
    }
}

// ── Backend ─────────────────────────────────────────────────────

/// Opens file-backed devices. Without a capture path, opening capture
/// fails with [`AudioError::NotInitialized`].
#[derive(Debug, Clone)]
pub struct FileAudioBackend {
    pub capture_path: Option<PathBuf>,
    pub playback_path: PathBuf,
}

impl AudioBackend for FileAudioBackend {
    fn open_capture(&self, config: &AudioConfig) -> AudioResult<Box<dyn CaptureDevice>> {
        let path = self.capture_path.as_ref().ok_or(AudioError::NotInitialized)?;
        Ok(Box::new(PcmFileCapture::new(path.clone(), config)))
    }

    fn open_playback(&self, config: &AudioConfig) -> AudioResult<Box<dyn PlaybackDevice>> {
        Ok(Box::new(PcmFileSink::create(self.playback_path.clone(), config)?))
    }
}

/// Wall-clock length of `bytes` of PCM16 mono at `sample_rate`.
pub fn frame_duration(bytes: usize, sample_rate: u32) -> Duration {
    let samples = bytes as u64 / BYTES_PER_SAMPLE;
    Duration::from_micros(samples * 1_000_000 / u64::from(sample_rate.max(1)))
}
