//! Concatenated JSON objects without framing.
//!
//! The `/stream_audio` endpoint writes `{...}{...}{...}` with no separator
//! and reads may split an object anywhere. The splitter tracks brace depth
//! (string and escape aware) and hands out each object as soon as its
//! closing brace arrives. Bytes outside any object are skipped.

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt::Display;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const OBJECT_CHANNEL_CAPACITY: usize = 64;

/// Largest object buffered before the splitter gives up on it and resyncs.
pub const DEFAULT_MAX_OBJECT_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug)]
pub struct JsonObjectSplitter {
    current: Vec<u8>,
    depth: usize,
    in_string: bool,
    escaped: bool,
    max_object_bytes: usize,
}

impl Default for JsonObjectSplitter {
    fn default() -> Self {
        Self {
            current: Vec::new(),
            depth: 0,
            in_string: false,
            escaped: false,
            max_object_bytes: DEFAULT_MAX_OBJECT_BYTES,
        }
    }
}

impl JsonObjectSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_object_bytes(mut self, max: usize) -> Self {
        self.max_object_bytes = max.max(2);
        self
    }

    /// Feed a read; returns every object completed by it, in order.
    ///
    /// An object that fails to parse, or outgrows the size cap, is dropped
    /// and scanning restarts at the first `}{` inside it. A stray quote
    /// therefore costs one record, not the rest of the stream.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Value> {
        let mut objects = Vec::new();
        let mut replay = VecDeque::new();
        for &byte in bytes {
            self.feed(byte, &mut replay, &mut objects);
            while let Some(byte) = replay.pop_front() {
                self.feed(byte, &mut replay, &mut objects);
            }
        }
        objects
    }

    fn feed(&mut self, byte: u8, replay: &mut VecDeque<u8>, objects: &mut Vec<Value>) {
        if self.depth == 0 {
            if byte == b'{' {
                self.current.push(byte);
                self.depth = 1;
            }
            return;
        }

        self.current.push(byte);
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == b'"' {
                self.in_string = false;
            }
        } else {
            match byte {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        let raw = std::mem::take(&mut self.current);
                        match serde_json::from_slice::<Value>(&raw) {
                            Ok(value) => objects.push(value),
                            Err(e) => {
                                tracing::warn!(
                                    error = %e,
                                    bytes = raw.len(),
                                    "Skipping malformed JSON object"
                                );
                                self.resync(&raw, replay);
                            }
                        }
                    }
                    return;
                }
                _ => {}
            }
        }

        if self.current.len() > self.max_object_bytes {
            let raw = std::mem::take(&mut self.current);
            tracing::warn!(bytes = raw.len(), "JSON object exceeds size cap, resyncing");
            self.resync(&raw, replay);
        }
    }

    /// Reset and queue everything after the first `}{` in `raw` for
    /// rescanning ahead of any pending replay bytes.
    fn resync(&mut self, raw: &[u8], replay: &mut VecDeque<u8>) {
        self.reset();
        if let Some(pos) = object_boundary(raw) {
            for &byte in raw[pos + 1..].iter().rev() {
                replay.push_front(byte);
            }
        }
    }

    fn reset(&mut self) {
        self.current.clear();
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
    }

    /// Best-effort parse of the trailing partial buffer at end of stream,
    /// resyncing at `}{` boundaries when it does not parse as a whole.
    pub fn finish(&mut self) -> Vec<Value> {
        let mut values = Vec::new();
        loop {
            let raw = std::mem::take(&mut self.current);
            self.reset();
            if raw.is_empty() {
                return values;
            }
            match serde_json::from_slice::<Value>(&raw) {
                Ok(value) => {
                    values.push(value);
                    return values;
                }
                Err(e) => {
                    tracing::debug!(error = %e, bytes = raw.len(), "Incomplete trailing object");
                    let Some(pos) = object_boundary(&raw) else {
                        return values;
                    };
                    values.extend(self.push(&raw[pos + 1..]));
                }
            }
        }
    }

    /// True when no object is partially buffered.
    pub fn is_idle(&self) -> bool {
        self.depth == 0 && self.current.is_empty()
    }
}

/// Index of the `}` in the first `}{` pair of `raw`.
fn object_boundary(raw: &[u8]) -> Option<usize> {
    raw.windows(2).position(|pair| pair == b"}{")
}

/// Drive a byte stream through a [`JsonObjectSplitter`], yielding values in
/// completion order. A transport error is logged and ends the stream.
pub fn read_json_objects<S, B, E>(body: S) -> ReceiverStream<Value>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(OBJECT_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut body = std::pin::pin!(body);
        let mut splitter = JsonObjectSplitter::new();
        let mut delivered = 0usize;

        while let Some(chunk) = body.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(error = %e, delivered, "JSON object stream failed");
                    return;
                }
            };
            for value in splitter.push(bytes.as_ref()) {
                delivered += 1;
                if tx.send(value).await.is_err() {
                    return;
                }
            }
        }

        for value in splitter.finish() {
            delivered += 1;
            if tx.send(value).await.is_err() {
                return;
            }
        }
        tracing::debug!(objects = delivered, "JSON object stream ended");
    });
    ReceiverStream::new(rx)
}
