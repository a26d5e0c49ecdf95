//! Streamed playback of compressed audio on a fixed pool of hardware channels.
//!
//! A [`ChannelPool`] wraps one [`Mixer`](mixer::Mixer). Each [`Sound`] claims a channel, decodes
//! its source a chunk at a time into a three-buffer ring and keeps the hardware queue fed from a
//! dedicated playback thread.

pub mod config;
pub mod decode;
pub mod error;
pub mod mixer;
pub mod pool;
pub mod priority;
pub mod refill;
pub mod ring;
pub mod signal;
pub mod sound;
pub mod task;

pub use channel_stream_types::{PlaybackEndReason, SoundStatus, TaskState};
pub use config::EngineConfig;
pub use error::{Result, StreamError};
pub use pool::ChannelPool;
pub use sound::Sound;
