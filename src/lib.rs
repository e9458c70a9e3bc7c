#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

//! Streaming bot pipeline.
//!
//! Talks to an external bot backend over HTTP and WebSocket, parses its
//! incremental answer streams, plays back audio answers and runs a
//! half-duplex voice session that mutes the microphone while the bot
//! speaks.

pub mod analytics;
pub mod audio;
pub mod bot;
pub mod config;
pub mod error;
pub mod stream;

pub use config::Config;
pub use error::{AudioError, BotError};
