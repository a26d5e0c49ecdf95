//! Refilling played-out ring buffers and handing them back to the hardware.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::decode::StreamDecoder;
use crate::error::Result;
use crate::mixer::Mixer;
use crate::ring::{BufferRing, BufferStatus, RING_LEN, WaveBuf};

/// Decoded interleaved PCM, read sequentially with rewind support.
pub trait PcmSource {
    /// Fill `out` with whole frames; `Ok(0)` means end of stream.
    fn read(&mut self, out: &mut [i16]) -> Result<usize>;
    fn seek(&mut self, ms: u64) -> Result<()>;
}

impl PcmSource for StreamDecoder {
    fn read(&mut self, out: &mut [i16]) -> Result<usize> {
        StreamDecoder::read(self, out)
    }

    fn seek(&mut self, ms: u64) -> Result<()> {
        StreamDecoder::seek(self, ms)
    }
}

/// What one refill pass did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefillOutcome {
    /// No buffer was `Done`; nothing to do until the hardware finishes one.
    Idle,
    /// `buffers` buffers were queued holding `samples` samples in total.
    Filled { buffers: usize, samples: usize },
    /// Every eligible buffer came up empty: the stream ended (or cannot be decoded further).
    Exhausted,
}

/// The channel a refill pass feeds.
pub struct RefillTarget<'a> {
    pub channel: usize,
    pub ring: &'a Arc<BufferRing>,
    pub mixer: &'a dyn Mixer,
    pub looping: &'a AtomicBool,
}

/// Decode into every `Done` buffer of the ring and queue the non-empty ones.
///
/// `staging` must hold at least one buffer's worth of samples. At end of stream a looping
/// channel rewinds to the start and keeps filling the same buffer; otherwise the buffer is
/// queued short. Decode errors are logged and end the current buffer early.
pub fn fill_buffers<S: PcmSource + ?Sized>(
    target: &RefillTarget<'_>,
    source: &mut S,
    staging: &mut [i16],
) -> RefillOutcome {
    let cap = target.ring.capacity().min(staging.len());
    let mut attempted = 0usize;
    let mut queued = 0usize;
    let mut queued_samples = 0usize;

    for index in 0..RING_LEN {
        if target.ring.status(index) != BufferStatus::Done {
            continue;
        }
        attempted += 1;

        let total = decode_into(target, source, &mut staging[..cap]);
        if total == 0 {
            continue;
        }

        let kept = target.ring.commit(index, &staging[..total]);
        let buffer = WaveBuf::new(target.ring.clone(), index);
        target.mixer.flush_data_cache(&buffer);
        if target.ring.mark_queued(index) {
            target.mixer.queue_buffer(target.channel, buffer);
            queued += 1;
            queued_samples += kept;
        }
    }

    let outcome = match (attempted, queued) {
        (0, _) => RefillOutcome::Idle,
        (_, 0) => RefillOutcome::Exhausted,
        (_, buffers) => RefillOutcome::Filled {
            buffers,
            samples: queued_samples,
        },
    };
    tracing::trace!(channel = target.channel, ?outcome, "refill");
    outcome
}

fn decode_into<S: PcmSource + ?Sized>(
    target: &RefillTarget<'_>,
    source: &mut S,
    out: &mut [i16],
) -> usize {
    let mut total = 0usize;
    let mut rewound_empty = false;

    while total < out.len() {
        match source.read(&mut out[total..]) {
            Ok(0) => {
                if !target.looping.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = source.seek(0) {
                    tracing::warn!(channel = target.channel, "rewind failed: {e}");
                    break;
                }
                // A stream that yields nothing right after a rewind has nothing to loop.
                if total == 0 {
                    if rewound_empty {
                        break;
                    }
                    rewound_empty = true;
                    continue;
                }
                break;
            }
            Ok(n) => total += n,
            Err(e) => {
                tracing::warn!(channel = target.channel, "decode error: {e}");
                break;
            }
        }
    }
    total
}
