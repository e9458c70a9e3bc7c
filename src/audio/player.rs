//! Sequential audio chunk playback.
//!
//! Chunks are queued from async code and drained by one named worker
//! thread that owns the [`PlaybackDevice`]. The worker waits on the queue
//! with a bounded timeout; a timeout while playing pauses the device and
//! reports [`PlaybackEvent::Silent`] so the caller can unmute the mic.
//!
//! ```text
//! enqueue ─▸ VecDeque ─▸ worker ─▸ device.write (split to capacity)
//!                           │
//!                           └─▸ PlaybackEvent (Started / Silent / Completed / Error)
//! ```

use super::{PlaybackDevice, PlaybackEvent, PlaybackState};
use crate::error::{AudioError, AudioResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Queue {
    chunks: VecDeque<Vec<u8>>,
    end_of_stream: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wake: Condvar,
    state: Mutex<PlaybackState>,
}

enum Next {
    Chunk(Vec<u8>),
    Drained,
    Idle,
    Spurious,
    Cancelled,
}

// ── Player handle ───────────────────────────────────────────────

pub struct AudioChunkPlayer {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AudioChunkPlayer {
    /// Spawn the playback worker.
    ///
    /// `cancel` is typically a child of the session token; cancelling it
    /// ends the worker within one idle poll.
    pub fn spawn(
        device: Box<dyn PlaybackDevice>,
        idle_poll: Duration,
        events: mpsc::UnboundedSender<PlaybackEvent>,
        cancel: CancellationToken,
    ) -> AudioResult<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wake: Condvar::new(),
            state: Mutex::new(PlaybackState::Idle),
        });

        let worker = PlaybackWorker {
            shared: Arc::clone(&shared),
            device,
            idle_poll,
            events,
            cancel: cancel.clone(),
            chunks_played: 0,
        };
        let handle = std::thread::Builder::new()
            .name("botstream-playback".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            shared,
            cancel,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queue a chunk. Playback starts on its own when the device is idle.
    pub fn enqueue(&self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        if self.cancel.is_cancelled() {
            tracing::debug!(bytes = chunk.len(), "Player stopped, dropping chunk");
            return;
        }
        self.shared.queue.lock().chunks.push_back(chunk);
        self.shared.wake.notify_one();
    }

    /// Signal end of stream. Once the queue drains the device is released,
    /// [`PlaybackEvent::Completed`] is sent and the player goes back to idle.
    pub fn finish(&self) {
        self.shared.queue.lock().end_of_stream = true;
        self.shared.wake.notify_one();
    }

    /// Clear the queue, release the device and end the worker.
    pub fn stop(&self) {
        self.shared.queue.lock().chunks.clear();
        self.cancel.cancel();
        self.shared.wake.notify_all();

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Playback worker panicked");
            }
        }
    }

    pub fn state(&self) -> PlaybackState {
        *self.shared.state.lock()
    }

    pub fn queued_chunks(&self) -> usize {
        self.shared.queue.lock().chunks.len()
    }
}

impl Drop for AudioChunkPlayer {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.shared.wake.notify_all();
    }
}

// ── Worker ──────────────────────────────────────────────────────

struct PlaybackWorker {
    shared: Arc<Shared>,
    device: Box<dyn PlaybackDevice>,
    idle_poll: Duration,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    cancel: CancellationToken,
    chunks_played: u64,
}

impl PlaybackWorker {
    fn run(mut self) {
        tracing::debug!(idle_poll_ms = self.idle_poll.as_millis() as u64, "Playback worker started");

        loop {
            match self.next() {
                Next::Chunk(chunk) => self.play(chunk),
                Next::Idle => {
                    if self.state() == PlaybackState::Playing {
                        if let Err(e) = self.device.pause() {
                            tracing::warn!(error = %e, "Failed to pause playback device");
                        }
                        self.set_state(PlaybackState::PausedForSilence);
                        self.emit(PlaybackEvent::Silent);
                    }
                }
                Next::Drained => {
                    if self.state() != PlaybackState::Idle {
                        self.device.release();
                        self.set_state(PlaybackState::Idle);
                    }
                    tracing::debug!(chunks = self.chunks_played, "Playback drained");
                    self.emit(PlaybackEvent::Completed);
                }
                Next::Spurious => {}
                Next::Cancelled => break,
            }
        }

        self.device.release();
        self.set_state(PlaybackState::Ended);
        tracing::debug!(chunks = self.chunks_played, "Playback worker ended");
    }

    fn next(&self) -> Next {
        let mut queue = self.shared.queue.lock();
        let mut timed_out = false;
        if queue.chunks.is_empty() && !queue.end_of_stream && !self.cancel.is_cancelled() {
            timed_out = self
                .shared
                .wake
                .wait_for(&mut queue, self.idle_poll)
                .timed_out();
        }

        if self.cancel.is_cancelled() {
            return Next::Cancelled;
        }
        if let Some(chunk) = queue.chunks.pop_front() {
            return Next::Chunk(chunk);
        }
        if queue.end_of_stream {
            queue.end_of_stream = false;
            return Next::Drained;
        }
        if timed_out {
            Next::Idle
        } else {
            Next::Spurious
        }
    }

    fn play(&mut self, chunk: Vec<u8>) {
        if self.state() != PlaybackState::Playing {
            if let Err(e) = self.device.start() {
                tracing::warn!(error = %e, bytes = chunk.len(), "Failed to start playback device");
                self.emit(PlaybackEvent::Error(e.to_string()));
                return;
            }
            self.set_state(PlaybackState::Playing);
            self.emit(PlaybackEvent::Started);
        }

        self.chunks_played += 1;
        if self.chunks_played == 1 || self.chunks_played % 50 == 0 {
            tracing::debug!(chunks = self.chunks_played, bytes = chunk.len(), "Playing chunk");
        }

        if let Err(e) = self.write_chunk(&chunk) {
            tracing::warn!(error = %e, bytes = chunk.len(), "Dropping chunk after write failure");
            self.emit(PlaybackEvent::Error(e.to_string()));
        }
    }

    /// Write `chunk` in pieces no larger than the device buffer.
    fn write_chunk(&mut self, chunk: &[u8]) -> AudioResult<()> {
        let capacity = self.device.buffer_capacity().max(1);
        for piece in chunk.chunks(capacity) {
            let mut offset = 0;
            while offset < piece.len() {
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                let n = self.device.write(&piece[offset..])?;
                if n == 0 {
                    return Err(AudioError::Device("playback device accepted no data".into()));
                }
                offset += n;
            }
        }
        Ok(())
    }

    fn state(&self) -> PlaybackState {
        *self.shared.state.lock()
    }

    fn set_state(&self, state: PlaybackState) {
        *self.shared.state.lock() = state;
    }

    fn emit(&self, event: PlaybackEvent) {
        // Nobody listening is fine; playback continues.
        let _ = self.events.send(event);
    }
}
