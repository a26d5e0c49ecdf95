//! The per-channel ring of PCM buffers shared with the hardware.
//!
//! One contiguous region is allocated per ring and sliced into [`RING_LEN`] equal buffers.
//! Ownership of each buffer alternates by [`BufferStatus`]:
//! - `Done`: the CPU (refill engine) may write it
//! - `Queued`: the hardware may read it
//!
//! Status transitions are compare-and-swap so neither side can claim a buffer it does not own.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Result, StreamError};

/// Number of buffers per channel.
pub const RING_LEN: usize = 3;

/// Readiness of one ring buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferStatus {
    /// Allocated but never armed for playback.
    Free,
    /// Owned by the hardware queue.
    Queued,
    /// Played out (or freshly armed); eligible for refill.
    Done,
}

impl BufferStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Queued,
            2 => Self::Done,
            _ => Self::Free,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Queued => 1,
            Self::Done => 2,
        }
    }
}

struct BufferSlot {
    offset: usize,
    sample_count: AtomicUsize,
    status: AtomicU8,
}

/// Three equally sized interleaved `i16` buffers carved out of one region.
pub struct BufferRing {
    region: Mutex<Box<[i16]>>,
    buffers: [BufferSlot; RING_LEN],
    capacity: usize,
    channels: u16,
}

impl std::fmt::Debug for BufferRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRing")
            .field("capacity", &self.capacity)
            .field("channels", &self.channels)
            .field("status", &self.statuses())
            .finish()
    }
}

/// Samples (not frames) in one buffer for a `(rate, channels, chunk)` target.
///
/// Returns 0 when the chunk is too short to hold a single frame.
pub fn chunk_len_samples(sample_rate: u32, channels: u16, chunk_ms: u32) -> usize {
    let frames = (sample_rate as u64).saturating_mul(chunk_ms as u64) / 1000;
    (frames as usize).saturating_mul(channels as usize)
}

impl BufferRing {
    /// Allocate a ring sized for `chunk_ms` of audio per buffer.
    ///
    /// Every buffer starts `Free`; call [`BufferRing::arm`] before the first fill.
    pub fn allocate(sample_rate: u32, channels: u16, chunk_ms: u32) -> Result<Arc<Self>> {
        let capacity = chunk_len_samples(sample_rate, channels, chunk_ms);
        if capacity == 0 {
            return Err(StreamError::init(format!(
                "buffer ring would be empty ({sample_rate} Hz, {channels} ch, {chunk_ms} ms)"
            )));
        }
        let total = capacity
            .checked_mul(RING_LEN)
            .ok_or_else(|| StreamError::init("buffer ring size overflows"))?;

        let mut region: Vec<i16> = Vec::new();
        region
            .try_reserve_exact(total)
            .map_err(|e| StreamError::init(format!("buffer ring allocation: {e}")))?;
        region.resize(total, 0);

        let buffers = std::array::from_fn(|i| BufferSlot {
            offset: i * capacity,
            sample_count: AtomicUsize::new(capacity),
            status: AtomicU8::new(BufferStatus::Free.as_u8()),
        });

        tracing::trace!(capacity, channels, total, "buffer ring allocated");
        Ok(Arc::new(Self {
            region: Mutex::new(region.into_boxed_slice()),
            buffers,
            capacity,
            channels,
        }))
    }

    /// Capacity of one buffer in samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn status(&self, index: usize) -> BufferStatus {
        BufferStatus::from_u8(self.buffers[index].status.load(Ordering::Acquire))
    }

    pub fn statuses(&self) -> [BufferStatus; RING_LEN] {
        std::array::from_fn(|i| self.status(i))
    }

    /// Valid samples currently held by buffer `index`.
    pub fn sample_count(&self, index: usize) -> usize {
        self.buffers[index].sample_count.load(Ordering::Acquire)
    }

    /// Make every buffer eligible for the first fill of a playback run.
    ///
    /// Only call while the hardware holds none of the buffers (after its queue was cleared).
    pub fn arm(&self) {
        for slot in &self.buffers {
            slot.sample_count.store(0, Ordering::Relaxed);
            slot.status
                .store(BufferStatus::Done.as_u8(), Ordering::Release);
        }
    }

    /// Indices of buffers the refill engine may write.
    pub fn done_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..RING_LEN).filter(|i| self.status(*i) == BufferStatus::Done)
    }

    /// Copy freshly decoded samples into `Done` buffer `index`.
    ///
    /// Stores at most [`BufferRing::capacity`] samples and returns how many were kept. A buffer
    /// that is not `Done` is left untouched and 0 is returned.
    pub fn commit(&self, index: usize, samples: &[i16]) -> usize {
        let slot = &self.buffers[index];
        if self.status(index) != BufferStatus::Done {
            return 0;
        }
        let n = samples.len().min(self.capacity);
        let mut region = self.lock_region();
        region[slot.offset..slot.offset + n].copy_from_slice(&samples[..n]);
        drop(region);
        slot.sample_count.store(n, Ordering::Release);
        n
    }

    /// Hand buffer `index` to the hardware (`Done -> Queued`).
    pub fn mark_queued(&self, index: usize) -> bool {
        self.transition(index, BufferStatus::Done, BufferStatus::Queued)
    }

    /// Hardware finished playing buffer `index` (`Queued -> Done`).
    pub fn mark_done(&self, index: usize) -> bool {
        self.transition(index, BufferStatus::Queued, BufferStatus::Done)
    }

    /// Run `f` over the valid samples of buffer `index`.
    ///
    /// The hardware side uses this to read `Queued` buffers; the region lock is held for the
    /// duration of `f`, so keep it short.
    pub fn with_samples<R>(&self, index: usize, f: impl FnOnce(&[i16]) -> R) -> R {
        let slot = &self.buffers[index];
        let count = slot.sample_count.load(Ordering::Acquire).min(self.capacity);
        let region = self.lock_region();
        f(&region[slot.offset..slot.offset + count])
    }

    fn transition(&self, index: usize, from: BufferStatus, to: BufferStatus) -> bool {
        self.buffers[index]
            .status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn lock_region(&self) -> MutexGuard<'_, Box<[i16]>> {
        // A panic while holding the lock leaves plain sample data behind; keep using it.
        self.region.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Reference to one buffer of a ring, as handed to the hardware queue.
#[derive(Clone, Debug)]
pub struct WaveBuf {
    pub ring: Arc<BufferRing>,
    pub index: usize,
}

impl WaveBuf {
    pub fn new(ring: Arc<BufferRing>, index: usize) -> Self {
        Self { ring, index }
    }

    pub fn status(&self) -> BufferStatus {
        self.ring.status(self.index)
    }

    pub fn sample_count(&self) -> usize {
        self.ring.sample_count(self.index)
    }

    /// Frames held by the buffer.
    pub fn frames(&self) -> usize {
        self.sample_count() / self.ring.channels() as usize
    }
}
