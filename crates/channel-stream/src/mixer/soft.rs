//! Software implementation of the hardware mixer.
//!
//! [`SoftMixer::render`] pulls frames from every channel's buffer queue, steps through them at
//! `channel rate / output rate`, applies the front left/right mix weights and sums into an
//! interleaved `f32` output block. Buffers that play out are marked done and reported through
//! the completion callback once the channel lock has been released.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{CompletionCallback, HARDWARE_CHANNELS, Interpolation, Mixer, PcmFormat};
use crate::ring::WaveBuf;

const DEFAULT_MIX: [f32; 12] = [1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];

struct ChannelState {
    rate_hz: u32,
    format: PcmFormat,
    interpolation: Interpolation,
    mix: [f32; 12],
    queue: VecDeque<WaveBuf>,
    /// Fractional frame position inside the front buffer.
    pos: f64,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            rate_hz: 0,
            format: PcmFormat::StereoPcm16,
            interpolation: Interpolation::Polyphase,
            mix: DEFAULT_MIX,
            queue: VecDeque::new(),
            pos: 0.0,
        }
    }
}

impl ChannelState {
    fn drain_queue(&mut self) {
        for buf in self.queue.drain(..) {
            buf.ring.mark_done(buf.index);
        }
        self.pos = 0.0;
    }
}

/// Software mixer with [`HARDWARE_CHANNELS`] channels.
pub struct SoftMixer {
    channels: Mutex<Vec<ChannelState>>,
    callback: Mutex<Option<CompletionCallback>>,
    rendered_frames: AtomicU64,
    completed_buffers: AtomicU64,
}

impl Default for SoftMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftMixer {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(
                (0..HARDWARE_CHANNELS)
                    .map(|_| ChannelState::default())
                    .collect(),
            ),
            callback: Mutex::new(None),
            rendered_frames: AtomicU64::new(0),
            completed_buffers: AtomicU64::new(0),
        }
    }

    /// Mix one block of `out.len() / out_channels` frames at `out_rate` Hz into `out`.
    pub fn render(&self, out: &mut [f32], out_channels: usize, out_rate: u32) {
        out.fill(0.0);
        if out_channels == 0 || out_rate == 0 {
            return;
        }
        let frames = out.len() / out_channels;
        let mut completed: Vec<usize> = Vec::new();

        {
            let mut channels = self.lock_channels();
            for (idx, ch) in channels.iter_mut().enumerate() {
                if ch.rate_hz == 0 || ch.queue.is_empty() {
                    continue;
                }
                let step = ch.rate_hz as f64 / out_rate as f64;
                let src_channels = ch.format.channels();
                let (gain_l, gain_r) = (ch.mix[0], ch.mix[1]);
                let mut frame = 0usize;

                while frame < frames {
                    let Some(front) = ch.queue.front().cloned() else {
                        break;
                    };
                    let interpolation = ch.interpolation;
                    let mut pos = ch.pos;
                    let buf_frames = front.ring.with_samples(front.index, |samples| {
                        let buf_frames = samples.len() / src_channels;
                        while frame < frames && pos < buf_frames as f64 {
                            let (l, r) =
                                read_frame(samples, src_channels, buf_frames, pos, interpolation);
                            mix_into(
                                &mut out[frame * out_channels..(frame + 1) * out_channels],
                                l * gain_l,
                                r * gain_r,
                            );
                            pos += step;
                            frame += 1;
                        }
                        buf_frames
                    });

                    if pos >= buf_frames as f64 {
                        ch.pos = pos - buf_frames as f64;
                        ch.queue.pop_front();
                        if front.ring.mark_done(front.index) {
                            completed.push(idx);
                        }
                    } else {
                        ch.pos = pos;
                    }
                }
            }
        }

        self.rendered_frames
            .fetch_add(frames as u64, Ordering::Relaxed);
        if completed.is_empty() {
            return;
        }
        self.completed_buffers
            .fetch_add(completed.len() as u64, Ordering::Relaxed);
        let callback = self
            .callback
            .lock()
            .map(|g| g.clone())
            .unwrap_or(None);
        if let Some(cb) = callback {
            for channel in completed {
                cb(channel);
            }
        }
    }

    /// Buffers currently queued on `channel`.
    pub fn queued_len(&self, channel: usize) -> usize {
        self.lock_channels()
            .get(channel)
            .map(|ch| ch.queue.len())
            .unwrap_or(0)
    }

    /// Sample rate configured on `channel` (0 when unconfigured).
    pub fn channel_rate(&self, channel: usize) -> u32 {
        self.lock_channels()
            .get(channel)
            .map(|ch| ch.rate_hz)
            .unwrap_or(0)
    }

    pub fn channel_format(&self, channel: usize) -> Option<PcmFormat> {
        self.lock_channels().get(channel).map(|ch| ch.format)
    }

    /// Total output frames rendered so far.
    pub fn rendered_frames(&self) -> u64 {
        self.rendered_frames.load(Ordering::Relaxed)
    }

    /// Total buffers played out so far, across all channels.
    pub fn completed_buffers(&self) -> u64 {
        self.completed_buffers.load(Ordering::Relaxed)
    }

    fn lock_channels(&self) -> MutexGuard<'_, Vec<ChannelState>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_channel(&self, channel: usize, f: impl FnOnce(&mut ChannelState)) {
        let mut channels = self.lock_channels();
        match channels.get_mut(channel) {
            Some(ch) => f(ch),
            None => tracing::warn!(channel, "mixer channel out of range"),
        }
    }
}

impl Mixer for SoftMixer {
    fn reset_channel(&self, channel: usize) {
        self.with_channel(channel, |ch| {
            ch.drain_queue();
            *ch = ChannelState::default();
        });
    }

    fn set_interpolation(&self, channel: usize, interpolation: Interpolation) {
        self.with_channel(channel, |ch| ch.interpolation = interpolation);
    }

    fn set_rate(&self, channel: usize, rate_hz: u32) {
        self.with_channel(channel, |ch| ch.rate_hz = rate_hz);
    }

    fn set_format(&self, channel: usize, format: PcmFormat) {
        self.with_channel(channel, |ch| ch.format = format);
    }

    fn set_mix(&self, channel: usize, mix: [f32; 12]) {
        self.with_channel(channel, |ch| ch.mix = mix);
    }

    fn queue_buffer(&self, channel: usize, buffer: WaveBuf) {
        self.with_channel(channel, |ch| ch.queue.push_back(buffer));
    }

    fn clear_queue(&self, channel: usize) {
        self.with_channel(channel, ChannelState::drain_queue);
    }

    fn set_completion_callback(&self, callback: Option<CompletionCallback>) {
        if let Ok(mut g) = self.callback.lock() {
            *g = callback;
        }
    }
}

/// Read the (left, right) pair at fractional frame `pos`, normalized to `[-1, 1)`.
fn read_frame(
    samples: &[i16],
    src_channels: usize,
    buf_frames: usize,
    pos: f64,
    interpolation: Interpolation,
) -> (f32, f32) {
    let i = pos as usize;
    let at = |frame: usize, ch: usize| -> f32 {
        let ch = ch.min(src_channels - 1);
        samples[frame * src_channels + ch] as f32 / 32_768.0
    };
    match interpolation {
        Interpolation::None => (at(i, 0), at(i, 1)),
        Interpolation::Linear | Interpolation::Polyphase => {
            let next = (i + 1).min(buf_frames - 1);
            let t = (pos - i as f64) as f32;
            (
                at(i, 0) + (at(next, 0) - at(i, 0)) * t,
                at(i, 1) + (at(next, 1) - at(i, 1)) * t,
            )
        }
    }
}

fn mix_into(frame: &mut [f32], left: f32, right: f32) {
    match frame.len() {
        0 => {}
        1 => frame[0] += 0.5 * (left + right),
        _ => {
            frame[0] += left;
            frame[1] += right;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{BufferRing, BufferStatus};
    use std::sync::Arc;

    fn queued_ring(mixer: &SoftMixer, channel: usize, samples: &[i16]) -> Arc<BufferRing> {
        let ring = BufferRing::allocate(8_000, 1, 28).unwrap();
        ring.arm();
        for i in 0..crate::ring::RING_LEN {
            ring.commit(i, samples);
            assert!(ring.mark_queued(i));
            mixer.queue_buffer(channel, WaveBuf::new(ring.clone(), i));
        }
        ring
    }

    #[test]
    fn render_without_queue_is_silence() {
        let mixer = SoftMixer::new();
        let mut out = vec![1.0f32; 64];
        mixer.render(&mut out, 2, 8_000);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(mixer.rendered_frames(), 32);
    }

    #[test]
    fn render_plays_out_buffers_and_reports_completion() {
        let mixer = SoftMixer::new();
        mixer.set_rate(4, 8_000);
        mixer.set_format(4, PcmFormat::MonoPcm16);
        let ring = queued_ring(&mixer, 4, &[16_384; 100]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        mixer.set_completion_callback(Some(Arc::new(move |ch| {
            seen_cb.lock().unwrap().push(ch);
        })));

        let mut out = vec![0.0f32; 150 * 2];
        mixer.render(&mut out, 2, 8_000);
        assert_eq!(out[0], 0.5);
        assert_eq!(out[1], 0.5);
        assert_eq!(ring.status(0), BufferStatus::Done);
        assert_eq!(ring.status(1), BufferStatus::Queued);
        assert_eq!(*seen.lock().unwrap(), vec![4]);
        assert_eq!(mixer.queued_len(4), 2);

        let mut out = vec![0.0f32; 150 * 2];
        mixer.render(&mut out, 2, 8_000);
        assert_eq!(ring.statuses(), [BufferStatus::Done; 3]);
        assert_eq!(*seen.lock().unwrap(), vec![4, 4, 4]);
        assert_eq!(mixer.completed_buffers(), 3);

        let mut out = vec![1.0f32; 8];
        mixer.render(&mut out, 2, 8_000);
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn double_rate_consumes_twice_as_fast() {
        let mixer = SoftMixer::new();
        mixer.set_rate(0, 16_000);
        mixer.set_format(0, PcmFormat::MonoPcm16);
        let ring = queued_ring(&mixer, 0, &[0; 100]);
        let mut out = vec![0.0f32; 50];
        mixer.render(&mut out, 1, 8_000);
        assert_eq!(ring.status(0), BufferStatus::Done);
        assert_eq!(ring.status(1), BufferStatus::Queued);
    }

    #[test]
    fn mix_weights_route_left_and_right() {
        let mixer = SoftMixer::new();
        mixer.set_rate(1, 8_000);
        mixer.set_format(1, PcmFormat::MonoPcm16);
        let mut mix = DEFAULT_MIX;
        mix[1] = 0.0;
        mixer.set_mix(1, mix);
        queued_ring(&mixer, 1, &[16_384; 10]);
        let mut out = vec![0.0f32; 4];
        mixer.render(&mut out, 2, 8_000);
        assert_eq!(out[0], 0.5);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn clear_queue_marks_done_without_callback() {
        let mixer = SoftMixer::new();
        mixer.set_rate(2, 8_000);
        let calls = Arc::new(AtomicU64::new(0));
        let calls_cb = calls.clone();
        mixer.set_completion_callback(Some(Arc::new(move |_| {
            calls_cb.fetch_add(1, Ordering::Relaxed);
        })));
        let ring = queued_ring(&mixer, 2, &[1; 10]);
        mixer.clear_queue(2);
        assert_eq!(ring.statuses(), [BufferStatus::Done; 3]);
        assert_eq!(mixer.queued_len(2), 0);
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn reset_restores_defaults() {
        let mixer = SoftMixer::new();
        mixer.set_rate(3, 44_100);
        mixer.set_format(3, PcmFormat::MonoPcm16);
        mixer.reset_channel(3);
        assert_eq!(mixer.channel_rate(3), 0);
        assert_eq!(mixer.channel_format(3), Some(PcmFormat::StereoPcm16));
    }

    #[test]
    fn linear_interpolation_blends_neighbours() {
        let samples = [0i16, 16_384];
        let (l, _) = read_frame(&samples, 1, 2, 0.5, Interpolation::Linear);
        assert_eq!(l, 0.25);
        let (l, _) = read_frame(&samples, 1, 2, 0.5, Interpolation::None);
        assert_eq!(l, 0.0);
    }
}
