//! Caller-facing sound instances.
//!
//! A [`Sound`] owns one pool channel for its whole life: the decoder, the buffer ring and (while
//! playing) the playback task. Construction never fails outright; a sound that could not get a
//! channel or open its source is *inert* and every operation on it is a no-op.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use channel_stream_types::{PlaybackEndReason, SoundStatus, TaskState};

use crate::decode::{StreamDecoder, StreamSpec};
use crate::error::Result;
use crate::mixer::PcmFormat;
use crate::pool::{ChannelPool, SlotLease};
use crate::priority::elevated_priority;
use crate::ring::BufferRing;
use crate::task::{PlaybackShared, PlaybackTask, TaskContext};

struct Binding {
    lease: SlotLease,
    decoder: Arc<Mutex<StreamDecoder>>,
    ring: Arc<BufferRing>,
    spec: StreamSpec,
    task: Option<PlaybackTask>,
}

/// A streamed sound bound to one hardware channel.
pub struct Sound {
    source_path: PathBuf,
    total_length_ms: u64,
    shared: Arc<PlaybackShared>,
    binding: Option<Binding>,
    last_end_reason: Option<PlaybackEndReason>,
}

impl std::fmt::Debug for Sound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sound")
            .field("source_path", &self.source_path)
            .field("channel", &self.channel_index())
            .field("state", &self.state())
            .finish()
    }
}

impl Sound {
    /// Open `path` (relative to the pool's storage root) on the next free channel.
    ///
    /// Failures are logged and yield an inert sound.
    pub fn new(pool: &Arc<ChannelPool>, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::try_new(pool, path) {
            Ok(sound) => sound,
            Err(e) => {
                let e = anyhow::Error::new(e).context(format!("open sound {}", path.display()));
                tracing::warn!("{e:#}");
                Self::inert(path)
            }
        }
    }

    /// Like [`Sound::new`] but reports why the sound could not be set up.
    pub fn try_new(pool: &Arc<ChannelPool>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let lease = pool.acquire()?;
        let channel = lease.index();
        let config = pool.config();

        let decoder = StreamDecoder::open(&config.resolve(path))?;
        let spec = decoder.spec().clone();

        let mixer = pool.mixer();
        mixer.reset_channel(channel);
        mixer.set_interpolation(channel, config.interpolation);
        mixer.set_rate(channel, spec.sample_rate);
        mixer.set_format(channel, PcmFormat::for_channels(spec.channels));
        mixer.set_mix(channel, config.mix);

        let ring =
            BufferRing::allocate(spec.sample_rate, spec.channels, config.effective_chunk_ms())?;

        tracing::info!(
            channel,
            path = %path.display(),
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            total_length_ms = spec.duration_ms,
            "sound ready"
        );
        Ok(Self {
            source_path: path.to_path_buf(),
            total_length_ms: spec.duration_ms,
            shared: Arc::new(PlaybackShared::default()),
            binding: Some(Binding {
                lease,
                decoder: Arc::new(Mutex::new(decoder)),
                ring,
                spec,
                task: None,
            }),
            last_end_reason: None,
        })
    }

    fn inert(path: &Path) -> Self {
        Self {
            source_path: path.to_path_buf(),
            total_length_ms: 0,
            shared: Arc::new(PlaybackShared::default()),
            binding: None,
            last_end_reason: None,
        }
    }

    /// Play from the start.
    pub fn play(&mut self) {
        self.play_at(0);
    }

    /// Play from `start_ms`, restarting if already playing.
    pub fn play_at(&mut self, start_ms: u64) {
        if self.binding.is_none() {
            return;
        }
        self.stop();
        let Some(binding) = self.binding.as_mut() else {
            return;
        };
        let pool = binding.lease.pool().clone();
        let config = pool.config();
        let channel = binding.lease.index();

        {
            let mut decoder = lock_decoder(&binding.decoder);
            if let Err(e) = decoder.seek(start_ms) {
                tracing::warn!(channel, start_ms, "seek failed: {e}");
            }
            self.shared.set_elapsed_ms(decoder.position_ms());
        }
        binding.ring.arm();

        let caller = pool
            .scheduler()
            .current_priority()
            .unwrap_or(config.caller_priority);
        let priority = elevated_priority(caller, config.priority_min, config.priority_max);
        let entry = binding.lease.entry().clone();
        entry.signal.clear();
        entry.set_active(true);

        let ctx = TaskContext {
            channel,
            mixer: pool.mixer().clone(),
            ring: binding.ring.clone(),
            decoder: binding.decoder.clone(),
            slot: entry,
            shared: self.shared.clone(),
            scheduler: pool.scheduler().clone(),
        };
        match PlaybackTask::spawn(ctx, priority, config.task_stack_size) {
            Ok(task) => {
                binding.task = Some(task);
                self.last_end_reason = None;
            }
            Err(e) => {
                tracing::warn!(channel, "{:#}", anyhow::Error::new(e));
                self.last_end_reason = Some(PlaybackEndReason::Error);
            }
        }
    }

    /// Stop playback and wait for the task to exit. Idempotent.
    pub fn stop(&mut self) {
        let Some(binding) = self.binding.as_mut() else {
            return;
        };
        let Some(task) = binding.task.take() else {
            return;
        };
        let channel = binding.lease.index();
        let reason = task.stop_and_join();
        binding.lease.pool().mixer().clear_queue(channel);
        binding.lease.entry().set_active(false);
        self.last_end_reason = Some(reason);
        tracing::debug!(channel, ?reason, "sound stopped");
    }

    pub fn set_loop(&self, looping: bool) {
        self.shared.set_looping(looping);
    }

    pub fn is_looping(&self) -> bool {
        self.shared.is_looping()
    }

    /// Decode position of the running (or last) playback, in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.shared.elapsed_ms()
    }

    pub fn total_length_ms(&self) -> u64 {
        self.total_length_ms
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Hardware channel owned by this sound; `None` when inert.
    pub fn channel_index(&self) -> Option<usize> {
        self.binding.as_ref().map(|b| b.lease.index())
    }

    pub fn is_inert(&self) -> bool {
        self.binding.is_none()
    }

    /// Whether the playback task is running.
    pub fn is_playing(&self) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|b| b.lease.entry().is_active())
    }

    pub fn stream_spec(&self) -> Option<&StreamSpec> {
        self.binding.as_ref().map(|b| &b.spec)
    }

    pub fn state(&self) -> TaskState {
        self.task().map(PlaybackTask::state).unwrap_or(TaskState::Idle)
    }

    /// Priority requested for the current playback task.
    pub fn task_priority(&self) -> Option<i32> {
        self.task().map(PlaybackTask::priority)
    }

    /// Priority the current playback thread reported once it switched.
    pub fn observed_task_priority(&self) -> Option<i32> {
        self.task().and_then(PlaybackTask::observed_priority)
    }

    fn task(&self) -> Option<&PlaybackTask> {
        self.binding.as_ref().and_then(|b| b.task.as_ref())
    }

    /// Why the latest playback run ended, if it has.
    pub fn end_reason(&self) -> Option<PlaybackEndReason> {
        self.task().and_then(PlaybackTask::end_reason).or(self.last_end_reason)
    }

    pub fn status(&self) -> SoundStatus {
        let spec = self.stream_spec();
        SoundStatus {
            source_path: self.source_path.display().to_string(),
            channel: self.channel_index(),
            state: self.state(),
            elapsed_ms: self.elapsed_ms(),
            total_length_ms: self.total_length_ms,
            looping: self.is_looping(),
            sample_rate: spec.map(|s| s.sample_rate),
            channels: spec.map(|s| s.channels),
            end_reason: self.end_reason(),
        }
    }
}

impl Drop for Sound {
    fn drop(&mut self) {
        self.stop();
        let Some(binding) = self.binding.take() else {
            return;
        };
        let Binding {
            lease,
            decoder,
            ring,
            ..
        } = binding;
        drop(ring);
        match Arc::try_unwrap(decoder) {
            Ok(decoder) => decoder
                .into_inner()
                .unwrap_or_else(|p| p.into_inner())
                .close(),
            Err(_) => tracing::warn!(channel = lease.index(), "decoder still shared at drop"),
        }
        // Dropping the lease resets the hardware channel and frees the slot.
        drop(lease);
    }
}

fn lock_decoder(decoder: &Mutex<StreamDecoder>) -> MutexGuard<'_, StreamDecoder> {
    decoder.lock().unwrap_or_else(|p| p.into_inner())
}
