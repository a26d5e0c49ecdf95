//! Streaming decoder binding.
//!
//! Uses Symphonia to:
//! - probe the input container/codec (Ogg Vorbis first, anything else the build enables)
//! - pull decoded packets on demand as interleaved `i16` into caller buffers
//! - seek to a time offset for start-at-offset playback and loop restarts
//!
//! Unlike a push decoder there is no thread here: the playback task calls [`StreamDecoder::read`]
//! only when a ring buffer needs refilling.

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::TimeBase;

use crate::error::{Result, StreamError};

/// Frames decoded ahead of a seek target. Covers one full Vorbis long-block packet, which is
/// what the decoder swallows after a reset before it outputs audio again.
const SEEK_PREROLL_FRAMES: u64 = 4096;

/// Stream parameters captured while probing the source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSpec {
    pub sample_rate: u32,
    /// 1 (mono) or 2 (stereo).
    pub channels: u16,
    /// Total duration in milliseconds, 0 when the container does not say.
    pub duration_ms: u64,
    /// Codec label (best-effort).
    pub codec: Option<String>,
}

/// An open compressed stream that yields interleaved 16-bit PCM on demand.
pub struct StreamDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    start_ts: u64,
    spec: StreamSpec,
    sample_buf: Option<SampleBuffer<i16>>,
    /// Frame capacity `sample_buf` was allocated with.
    sample_buf_frames: u64,
    /// Valid samples in `sample_buf`.
    pending_len: usize,
    /// Next sample to hand out from `sample_buf`.
    pending_pos: usize,
    /// Timestamp an accurate seek asked for, until a decoded packet reaches it.
    seek_target: Option<u64>,
    /// Timestamp of the first frame in `sample_buf` (or the seek target).
    packet_ts: u64,
}

impl std::fmt::Debug for StreamDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDecoder")
            .field("track_id", &self.track_id)
            .field("spec", &self.spec)
            .field("position_ms", &self.position_ms())
            .finish()
    }
}

impl StreamDecoder {
    /// Open the file at `path` and parse its headers.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|source| StreamError::SourceOpenFailure {
            path: path.to_path_buf(),
            source,
        })?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let decoder = Self::from_media_source(Box::new(file), hint)?;
        tracing::debug!(
            path = %path.display(),
            rate_hz = decoder.spec.sample_rate,
            channels = decoder.spec.channels,
            duration_ms = decoder.spec.duration_ms,
            codec = decoder.spec.codec.as_deref().unwrap_or("unknown"),
            "stream opened"
        );
        Ok(decoder)
    }

    /// Probe an arbitrary Symphonia [`MediaSource`].
    pub fn from_media_source(source: Box<dyn MediaSource>, hint: Hint) -> Result<Self> {
        let mss = MediaSourceStream::new(source, Default::default());

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| StreamError::init(format!("probe: {e}")))?;

        let format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| StreamError::init("no decodable audio track"))?;

        let channels = track
            .codec_params
            .channels
            .ok_or_else(|| StreamError::init("unknown channel count"))?
            .count();
        if !(1..=2).contains(&channels) {
            return Err(StreamError::init(format!(
                "unsupported channel count {channels} (mono or stereo only)"
            )));
        }

        let rate = track
            .codec_params
            .sample_rate
            .filter(|rate| *rate > 0)
            .ok_or_else(|| StreamError::init("unknown sample rate"))?;

        let codec_params: CodecParameters = track.codec_params.clone();
        let track_id = track.id;
        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| StreamError::init(format!("codec: {e}")))?;

        let spec = StreamSpec {
            sample_rate: rate,
            channels: channels as u16,
            duration_ms: duration_ms_from_codec_params(&codec_params).unwrap_or(0),
            codec: codec_name_from_params(&codec_params),
        };

        Ok(Self {
            format,
            decoder,
            track_id,
            time_base: codec_params.time_base,
            start_ts: codec_params.start_ts,
            spec,
            sample_buf: None,
            sample_buf_frames: 0,
            pending_len: 0,
            pending_pos: 0,
            seek_target: None,
            packet_ts: codec_params.start_ts,
        })
    }

    pub fn spec(&self) -> &StreamSpec {
        &self.spec
    }

    pub fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    pub fn channel_count(&self) -> u16 {
        self.spec.channels
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.spec.duration_ms
    }

    /// Current decode position in milliseconds.
    ///
    /// This is where the *decoder* is, which runs ahead of what the hardware is playing by at
    /// most the buffered audio.
    pub fn position_ms(&self) -> u64 {
        let channels = self.spec.channels as u64;
        let consumed_frames = self.pending_pos as u64 / channels;
        self.ts_to_ms(self.packet_ts) + consumed_frames * 1000 / self.spec.sample_rate as u64
    }

    /// Reposition decoding to `ms`, clamped to the stream length when it is known.
    ///
    /// The demuxer is sent [`SEEK_PREROLL_FRAMES`] early so the decoder is primed again by the
    /// time it reaches the target; `read` drops everything before it.
    pub fn seek(&mut self, ms: u64) -> Result<()> {
        let ms = if self.spec.duration_ms > 0 {
            ms.min(self.spec.duration_ms)
        } else {
            ms
        };
        let target_ts = self.ms_to_ts(ms).max(self.start_ts);
        let preroll_ms = (SEEK_PREROLL_FRAMES * 1000).div_ceil(self.spec.sample_rate as u64);
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts: self
                        .ms_to_ts(ms.saturating_sub(preroll_ms))
                        .max(self.start_ts),
                    track_id: self.track_id,
                },
            )
            .map_err(StreamError::Seek)?;

        self.decoder.reset();
        self.pending_len = 0;
        self.pending_pos = 0;
        self.seek_target = (seeked.actual_ts < target_ts).then_some(target_ts);
        self.packet_ts = target_ts;
        tracing::trace!(
            ms,
            target_ts,
            required_ts = seeked.required_ts,
            actual_ts = seeked.actual_ts,
            "stream seek"
        );
        Ok(())
    }

    /// Decode into `out`, returning the number of samples written.
    ///
    /// - `Ok(0)` means end of stream.
    /// - Only whole frames are written; `out` shorter than one frame yields `Ok(0)`.
    /// - A corrupt packet yields [`StreamError::DecodeRead`]; the next call moves on to the
    ///   following packet.
    pub fn read(&mut self, out: &mut [i16]) -> Result<usize> {
        let channels = self.spec.channels as usize;
        let want_frames = out.len() / channels;
        if want_frames == 0 {
            return Ok(0);
        }

        loop {
            if self.pending_pos < self.pending_len {
                if let Some(buf) = self.sample_buf.as_ref() {
                    let avail_frames = (self.pending_len - self.pending_pos) / channels;
                    let n = avail_frames.min(want_frames) * channels;
                    out[..n].copy_from_slice(&buf.samples()[self.pending_pos..self.pending_pos + n]);
                    self.pending_pos += n;
                    return Ok(n);
                }
            }

            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(0);
                }
                // Chained streams change parameters; this binding plays the first one only.
                Err(SymphoniaError::ResetRequired) => return Ok(0),
                Err(e) => return Err(StreamError::DecodeRead(e)),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(0);
                }
                Err(e) => return Err(StreamError::DecodeRead(e)),
            };

            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }
            if decoded.spec().channels.count() != channels {
                return Err(StreamError::DecodeRead(SymphoniaError::Unsupported(
                    "channel layout changed mid-stream",
                )));
            }

            // The seek landed on an earlier packet: drop packets that end before the target and
            // trim the head of the one that straddles it.
            let skip = match self.seek_target {
                Some(target) if packet.ts() + frames as u64 <= target => continue,
                Some(target) => {
                    self.seek_target = None;
                    target.saturating_sub(packet.ts())
                }
                None => 0,
            };

            let spec = *decoded.spec();
            let capacity = decoded.capacity() as u64;
            if self.sample_buf.is_none() || self.sample_buf_frames < capacity {
                self.sample_buf = Some(SampleBuffer::<i16>::new(capacity, spec));
                self.sample_buf_frames = capacity;
            }
            let Some(buf) = self.sample_buf.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);

            self.packet_ts = packet.ts();
            self.pending_len = buf.samples().len();
            self.pending_pos = skip as usize * channels;
        }
    }

    /// Release the decoder and its backing file.
    pub fn close(self) {
        tracing::debug!(track_id = self.track_id, "stream closed");
    }

    fn ms_to_ts(&self, ms: u64) -> u64 {
        match self.time_base {
            Some(tb) if tb.numer > 0 => {
                (ms as u128 * tb.denom as u128 / (tb.numer as u128 * 1000)) as u64
            }
            _ => ms * self.spec.sample_rate as u64 / 1000,
        }
    }

    fn ts_to_ms(&self, ts: u64) -> u64 {
        match self.time_base {
            Some(tb) if tb.denom > 0 => {
                (ts as u128 * tb.numer as u128 * 1000 / tb.denom as u128) as u64
            }
            Some(_) => 0,
            None => ts * 1000 / self.spec.sample_rate as u64,
        }
    }
}

/// Best-effort duration in milliseconds from codec metadata.
///
/// Returns `None` if the container does not provide total frames or sample rate.
fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

/// Best-effort codec label for logs and status.
fn codec_name_from_params(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}
