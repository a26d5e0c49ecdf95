//! The per-sound playback worker.
//!
//! One thread per playing sound: refill every `Done` buffer, sleep on the channel's completion
//! signal, record the decode position, repeat. The owner stops it by raising the stop flag and
//! signaling, then joins.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use channel_stream_types::{PlaybackEndReason, TaskState};

use crate::decode::StreamDecoder;
use crate::error::{Result, StreamError};
use crate::mixer::Mixer;
use crate::pool::SlotEntry;
use crate::priority::ThreadScheduler;
use crate::refill::{RefillOutcome, RefillTarget, fill_buffers};
use crate::ring::BufferRing;

/// Playback properties the owner and the task both touch.
#[derive(Debug, Default)]
pub struct PlaybackShared {
    pub looping: AtomicBool,
    pub elapsed_ms: AtomicU64,
}

impl PlaybackShared {
    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    pub fn set_looping(&self, looping: bool) {
        self.looping.store(looping, Ordering::Release);
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms.load(Ordering::Acquire)
    }

    pub fn set_elapsed_ms(&self, ms: u64) {
        self.elapsed_ms.store(ms, Ordering::Release);
    }
}

#[derive(Debug)]
struct TaskControl {
    stop: AtomicBool,
    state: AtomicU8,
    end_reason: Mutex<Option<PlaybackEndReason>>,
    observed_priority: Mutex<Option<i32>>,
}

impl TaskControl {
    fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            state: AtomicU8::new(TaskState::Idle.as_u8()),
            end_reason: Mutex::new(None),
            observed_priority: Mutex::new(None),
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn set_state(&self, state: TaskState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn lock_reason(&self) -> MutexGuard<'_, Option<PlaybackEndReason>> {
        self.end_reason.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Everything a playback task needs to drive one channel.
pub struct TaskContext {
    pub channel: usize,
    pub mixer: Arc<dyn Mixer>,
    pub ring: Arc<BufferRing>,
    pub decoder: Arc<Mutex<StreamDecoder>>,
    pub slot: Arc<SlotEntry>,
    pub shared: Arc<PlaybackShared>,
    pub scheduler: Arc<dyn ThreadScheduler>,
}

/// Handle to a running playback thread.
#[derive(Debug)]
pub struct PlaybackTask {
    channel: usize,
    priority: i32,
    control: Arc<TaskControl>,
    slot: Arc<SlotEntry>,
    handle: Option<JoinHandle<()>>,
}

impl PlaybackTask {
    /// Spawn the worker thread, which switches itself to `priority` before its first refill.
    ///
    /// The slot must already be marked active; on spawn failure it is marked inactive again.
    pub fn spawn(ctx: TaskContext, priority: i32, stack_size: usize) -> Result<Self> {
        let channel = ctx.channel;
        let slot = ctx.slot.clone();
        let control = Arc::new(TaskControl::new());
        control.set_state(TaskState::Running);
        let control_task = control.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("channel-stream-{channel}"))
            .stack_size(stack_size)
            .spawn(move || run(ctx, priority, &control_task));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(source) => {
                slot.set_active(false);
                control.set_state(TaskState::Finished);
                return Err(StreamError::TaskSpawn { channel, source });
            }
        };

        tracing::debug!(channel, priority, stack_size, "playback task started");
        Ok(Self {
            channel,
            priority,
            control,
            slot,
            handle: Some(handle),
        })
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Priority requested for this task.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Priority the task thread reported after switching, once it has started.
    pub fn observed_priority(&self) -> Option<i32> {
        *self
            .control
            .observed_priority
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> TaskState {
        self.control.state()
    }

    /// Why the task ended, once it has.
    pub fn end_reason(&self) -> Option<PlaybackEndReason> {
        *self.control.lock_reason()
    }

    /// Ask the task to exit, wake it and wait for it.
    pub fn stop_and_join(mut self) -> PlaybackEndReason {
        if self.control.state() == TaskState::Running {
            self.control.set_state(TaskState::Stopping);
        }
        self.control.stop.store(true, Ordering::Release);
        self.slot.signal.signal();
        self.join()
    }

    fn join(&mut self) -> PlaybackEndReason {
        let panicked = match self.handle.take() {
            Some(handle) => handle.join().is_err(),
            None => false,
        };
        if panicked {
            tracing::warn!(channel = self.channel, "playback task panicked");
            self.slot.set_active(false);
            self.control.set_state(TaskState::Finished);
            let mut reason = self.control.lock_reason();
            reason.get_or_insert(PlaybackEndReason::Error);
        }
        self.end_reason().unwrap_or(PlaybackEndReason::Stopped)
    }
}

impl Drop for PlaybackTask {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.control.stop.store(true, Ordering::Release);
            self.slot.signal.signal();
            self.join();
        }
    }
}

fn lock_decoder(decoder: &Mutex<StreamDecoder>) -> MutexGuard<'_, StreamDecoder> {
    decoder.lock().unwrap_or_else(|p| p.into_inner())
}

fn run(ctx: TaskContext, priority: i32, control: &TaskControl) {
    if let Err(e) = ctx.scheduler.apply_priority(priority) {
        tracing::warn!(channel = ctx.channel, priority, "task priority not applied: {e:#}");
    }
    *control
        .observed_priority
        .lock()
        .unwrap_or_else(|p| p.into_inner()) = ctx.scheduler.current_priority();

    let mut staging = vec![0i16; ctx.ring.capacity()];
    let target = RefillTarget {
        channel: ctx.channel,
        ring: &ctx.ring,
        mixer: ctx.mixer.as_ref(),
        looping: &ctx.shared.looping,
    };

    let reason = loop {
        if control.stop_requested() {
            break PlaybackEndReason::Stopped;
        }
        let outcome = {
            let mut decoder = lock_decoder(&ctx.decoder);
            fill_buffers(&target, &mut *decoder, &mut staging)
        };
        if outcome == RefillOutcome::Exhausted {
            break PlaybackEndReason::Eof;
        }

        ctx.slot.signal.wait();
        if control.stop_requested() {
            break PlaybackEndReason::Stopped;
        }
        let position = lock_decoder(&ctx.decoder).position_ms();
        ctx.shared.set_elapsed_ms(position);
    };

    *control.lock_reason() = Some(reason);
    ctx.slot.set_active(false);
    control.set_state(TaskState::Finished);
    tracing::debug!(channel = ctx.channel, ?reason, "playback task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::decode::tests::write_ramp_wav;
    use crate::mixer::soft::SoftMixer;
    use crate::mixer::{Mixer, PcmFormat};
    use crate::pool::ChannelPool;
    use crate::priority::tests::{RefusingScheduler, ThreadLocalScheduler};
    use crate::priority::OsScheduler;
    use crate::ring::BufferStatus;
    use std::time::{Duration, Instant};

    struct Fixture {
        _dir: tempfile::TempDir,
        mixer: Arc<SoftMixer>,
        _pool: Arc<ChannelPool>,
        lease: crate::pool::SlotLease,
        ctx: Option<TaskContext>,
        ring: Arc<BufferRing>,
        shared: Arc<PlaybackShared>,
    }

    fn fixture(frames: u32) -> Fixture {
        fixture_with(frames, Arc::new(OsScheduler))
    }

    fn fixture_with(frames: u32, scheduler: Arc<dyn ThreadScheduler>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_ramp_wav(&path, 8_000, 1, frames);

        let mixer = Arc::new(SoftMixer::new());
        let pool = ChannelPool::with_scheduler(mixer.clone(), EngineConfig::default(), scheduler);
        let lease = pool.acquire().unwrap();
        mixer.set_rate(lease.index(), 8_000);
        mixer.set_format(lease.index(), PcmFormat::MonoPcm16);

        let decoder = StreamDecoder::open(&path).unwrap();
        let ring = BufferRing::allocate(8_000, 1, 28).unwrap();
        ring.arm();
        let shared = Arc::new(PlaybackShared::default());
        lease.entry().set_active(true);
        let ctx = TaskContext {
            channel: lease.index(),
            mixer: mixer.clone(),
            ring: ring.clone(),
            decoder: Arc::new(Mutex::new(decoder)),
            slot: lease.entry().clone(),
            shared: shared.clone(),
            scheduler: pool.scheduler().clone(),
        };
        Fixture {
            _dir: dir,
            mixer,
            _pool: pool,
            lease,
            ctx: Some(ctx),
            ring,
            shared,
        }
    }

    fn render_until(mixer: &SoftMixer, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut block = vec![0.0f32; 64];
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            mixer.render(&mut block, 1, 8_000);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn task_plays_to_end_of_stream() {
        let mut fx = fixture(1_000);
        let task = PlaybackTask::spawn(fx.ctx.take().unwrap(), 0x2F, 64 * 1024).unwrap();
        assert_eq!(task.priority(), 0x2F);

        render_until(&fx.mixer, || task.state() == TaskState::Finished);
        assert_eq!(task.end_reason(), Some(PlaybackEndReason::Eof));
        assert!(!fx.lease.entry().is_active());
        assert_eq!(fx.shared.elapsed_ms(), 125);
        assert_eq!(task.stop_and_join(), PlaybackEndReason::Eof);
    }

    #[test]
    fn stop_interrupts_a_waiting_task() {
        let mut fx = fixture(80_000);
        let task = PlaybackTask::spawn(fx.ctx.take().unwrap(), 0x2F, 64 * 1024).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while fx.ring.statuses() != [BufferStatus::Queued; 3] {
            assert!(Instant::now() < deadline, "initial fill never happened");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(task.state(), TaskState::Running);
        assert_eq!(task.stop_and_join(), PlaybackEndReason::Stopped);
        assert!(!fx.lease.entry().is_active());
        assert_eq!(fx.mixer.queued_len(fx.lease.index()), 3);
    }

    #[test]
    fn looping_task_keeps_running_past_the_end() {
        let mut fx = fixture(500);
        fx.shared.set_looping(true);
        let task = PlaybackTask::spawn(fx.ctx.take().unwrap(), 0x2F, 64 * 1024).unwrap();

        let target = fx.mixer.completed_buffers() + 12;
        render_until(&fx.mixer, || fx.mixer.completed_buffers() >= target);
        assert_eq!(task.state(), TaskState::Running);
        assert!(fx.shared.elapsed_ms() <= 62);
        assert_eq!(task.stop_and_join(), PlaybackEndReason::Stopped);
    }

    #[test]
    fn task_thread_runs_at_requested_priority() {
        let mut fx = fixture_with(1_000, Arc::new(ThreadLocalScheduler));
        ThreadLocalScheduler::set_current(Some(0x30));
        let task = PlaybackTask::spawn(fx.ctx.take().unwrap(), 0x2F, 64 * 1024).unwrap();

        render_until(&fx.mixer, || task.state() == TaskState::Finished);
        assert_eq!(task.observed_priority(), Some(0x2F));
        // The spawning thread keeps its own priority.
        assert_eq!(ThreadLocalScheduler.current_priority(), Some(0x30));
        assert_eq!(task.stop_and_join(), PlaybackEndReason::Eof);
    }

    #[test]
    fn refused_priority_still_plays() {
        let mut fx = fixture_with(1_000, Arc::new(RefusingScheduler));
        let task = PlaybackTask::spawn(fx.ctx.take().unwrap(), 0x18, 64 * 1024).unwrap();

        render_until(&fx.mixer, || task.state() == TaskState::Finished);
        assert_eq!(task.observed_priority(), None);
        assert_eq!(fx.shared.elapsed_ms(), 125);
        assert_eq!(task.stop_and_join(), PlaybackEndReason::Eof);
    }
}
