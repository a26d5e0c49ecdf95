//! Hardware channel collaborator.
//!
//! The engine only talks to the output hardware through [`Mixer`]. Two drivers are provided
//! for the software implementation:
//! - [`clock::ClockedOutput`] renders on a timer thread (headless hosts, tests)
//! - `cpal_out` renders from a real output device (feature `cpal-output`)

use std::sync::Arc;

use serde::Deserialize;

use crate::ring::WaveBuf;

pub mod clock;
#[cfg(feature = "cpal-output")]
pub mod cpal_out;
pub mod soft;

/// Number of hardware channels.
pub const HARDWARE_CHANNELS: usize = 24;

/// Resampling quality requested for a channel.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    /// Nearest sample.
    None,
    Linear,
    #[default]
    Polyphase,
}

/// PCM layout of the buffers queued on a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcmFormat {
    MonoPcm16,
    StereoPcm16,
}

impl PcmFormat {
    /// Format for a stream with `channels` interleaved channels.
    pub fn for_channels(channels: u16) -> Self {
        if channels == 1 {
            Self::MonoPcm16
        } else {
            Self::StereoPcm16
        }
    }

    pub fn channels(self) -> usize {
        match self {
            Self::MonoPcm16 => 1,
            Self::StereoPcm16 => 2,
        }
    }
}

/// Invoked by the hardware with the channel whose buffer just finished playing.
pub type CompletionCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Output hardware with a fixed set of channels, each consuming a queue of PCM buffers.
///
/// Implementations must mark a buffer done ([`crate::ring::BufferRing::mark_done`]) *before*
/// invoking the completion callback for it, and must not call the callback while holding
/// locks that [`Mixer::queue_buffer`] needs.
pub trait Mixer: Send + Sync {
    /// Drop the channel's queue and restore its default configuration.
    fn reset_channel(&self, channel: usize);
    fn set_interpolation(&self, channel: usize, interpolation: Interpolation);
    fn set_rate(&self, channel: usize, rate_hz: u32);
    fn set_format(&self, channel: usize, format: PcmFormat);
    /// Mix weights; the first two route to the front left/right outputs.
    fn set_mix(&self, channel: usize, mix: [f32; 12]);
    /// Append a `Queued` buffer to the channel's playback queue.
    fn queue_buffer(&self, channel: usize, buffer: WaveBuf);
    /// Drop every buffer still queued on the channel, marking them done without a callback.
    fn clear_queue(&self, channel: usize);
    /// Make CPU writes to `buffer` visible to the hardware before it is queued.
    fn flush_data_cache(&self, _buffer: &WaveBuf) {}
    /// Register (or clear) the completion callback shared by all channels.
    fn set_completion_callback(&self, callback: Option<CompletionCallback>);
}
