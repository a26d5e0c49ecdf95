//! The fixed pool of hardware channels.
//!
//! Ownership of a channel is a [`SlotLease`]: acquiring scans the tag array under a mutex for the
//! first `Free` slot, dropping the lease resets the hardware channel and frees the slot again.
//! Each slot also carries its own completion signal, so the hardware only wakes the task whose
//! buffer finished.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::EngineConfig;
use crate::error::{Result, StreamError};
use crate::mixer::{CompletionCallback, HARDWARE_CHANNELS, Mixer};
use crate::priority::{OsScheduler, ThreadScheduler};
use crate::signal::CompletionSignal;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotTag {
    Free,
    Bound,
}

/// Per-channel state shared between the owning sound, its playback task and the hardware
/// callback.
#[derive(Debug, Default)]
pub struct SlotEntry {
    pub(crate) signal: CompletionSignal,
    active: AtomicBool,
}

impl SlotEntry {
    /// Whether a playback task is running (or about to run) on this channel.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }
}

/// Fixed set of [`HARDWARE_CHANNELS`] channels on one mixer.
///
/// Creating the pool registers the completion callback on the mixer; dropping it (after every
/// lease is gone) clears the callback again.
pub struct ChannelPool {
    mixer: Arc<dyn Mixer>,
    config: EngineConfig,
    scheduler: Arc<dyn ThreadScheduler>,
    tags: Mutex<[SlotTag; HARDWARE_CHANNELS]>,
    entries: Arc<[Arc<SlotEntry>]>,
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("bound", &self.bound_count())
            .field("active", &self.active_count())
            .finish()
    }
}

impl ChannelPool {
    pub fn new(mixer: Arc<dyn Mixer>, config: EngineConfig) -> Arc<Self> {
        Self::with_scheduler(mixer, config, Arc::new(OsScheduler))
    }

    /// Pool whose playback threads read and set priorities through `scheduler`.
    pub fn with_scheduler(
        mixer: Arc<dyn Mixer>,
        config: EngineConfig,
        scheduler: Arc<dyn ThreadScheduler>,
    ) -> Arc<Self> {
        let entries: Arc<[Arc<SlotEntry>]> = (0..HARDWARE_CHANNELS)
            .map(|_| Arc::new(SlotEntry::default()))
            .collect();

        let entries_cb = entries.clone();
        let callback: CompletionCallback = Arc::new(move |channel| {
            if let Some(entry) = entries_cb.get(channel) {
                entry.signal.signal();
            }
        });
        mixer.set_completion_callback(Some(callback));

        Arc::new(Self {
            mixer,
            config,
            scheduler,
            tags: Mutex::new([SlotTag::Free; HARDWARE_CHANNELS]),
            entries,
        })
    }

    /// Number of channels in the pool.
    pub fn capacity(&self) -> usize {
        HARDWARE_CHANNELS
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn mixer(&self) -> &Arc<dyn Mixer> {
        &self.mixer
    }

    pub fn scheduler(&self) -> &Arc<dyn ThreadScheduler> {
        &self.scheduler
    }

    /// Claim the lowest free channel.
    pub fn acquire(self: &Arc<Self>) -> Result<SlotLease> {
        let mut tags = self.lock_tags();
        let Some(index) = tags.iter().position(|t| *t == SlotTag::Free) else {
            return Err(StreamError::ChannelPoolExhausted {
                capacity: HARDWARE_CHANNELS,
            });
        };
        tags[index] = SlotTag::Bound;
        drop(tags);

        let entry = self.entries[index].clone();
        entry.set_active(false);
        entry.signal.clear();
        tracing::debug!(channel = index, "channel acquired");
        Ok(SlotLease {
            pool: self.clone(),
            index,
            entry,
        })
    }

    /// Whether `index` is owned by a sound.
    pub fn is_bound(&self, index: usize) -> bool {
        self.lock_tags()
            .get(index)
            .is_some_and(|t| *t == SlotTag::Bound)
    }

    /// Whether a playback task is running on `index`.
    pub fn is_active(&self, index: usize) -> bool {
        self.entries.get(index).is_some_and(|e| e.is_active())
    }

    pub fn bound_count(&self) -> usize {
        self.lock_tags()
            .iter()
            .filter(|t| **t == SlotTag::Bound)
            .count()
    }

    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_active()).count()
    }

    fn release(&self, index: usize) {
        self.mixer.reset_channel(index);
        let entry = &self.entries[index];
        entry.set_active(false);
        entry.signal.clear();
        let mut tags = self.lock_tags();
        tags[index] = SlotTag::Free;
        tracing::debug!(channel = index, "channel released");
    }

    fn lock_tags(&self) -> MutexGuard<'_, [SlotTag; HARDWARE_CHANNELS]> {
        self.tags.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for ChannelPool {
    fn drop(&mut self) {
        self.mixer.set_completion_callback(None);
    }
}

/// Exclusive ownership of one pool channel. Dropping it releases the channel.
pub struct SlotLease {
    pool: Arc<ChannelPool>,
    index: usize,
    entry: Arc<SlotEntry>,
}

impl std::fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotLease").field("index", &self.index).finish()
    }
}

impl SlotLease {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    pub fn entry(&self) -> &Arc<SlotEntry> {
        &self.entry
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::soft::SoftMixer;
    use std::time::Duration;

    fn pool() -> (Arc<SoftMixer>, Arc<ChannelPool>) {
        let mixer = Arc::new(SoftMixer::new());
        let pool = ChannelPool::new(mixer.clone(), EngineConfig::default());
        (mixer, pool)
    }

    #[test]
    fn acquire_hands_out_lowest_free_index() {
        let (_mixer, pool) = pool();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));
        drop(a);
        let c = pool.acquire().unwrap();
        assert_eq!(c.index(), 0);
        assert_eq!(pool.bound_count(), 2);
    }

    #[test]
    fn exhausted_after_capacity_leases() {
        let (_mixer, pool) = pool();
        let leases: Vec<_> = (0..pool.capacity()).map(|_| pool.acquire().unwrap()).collect();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(
            err,
            StreamError::ChannelPoolExhausted { capacity: HARDWARE_CHANNELS }
        ));
        drop(leases);
        assert_eq!(pool.bound_count(), 0);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn concurrent_acquire_never_shares_an_index() {
        let (_mixer, pool) = pool();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    (0..3)
                        .map(|_| pool.acquire().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let leases: Vec<SlotLease> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let mut indices: Vec<usize> = leases.iter().map(|l| l.index()).collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), HARDWARE_CHANNELS);
    }

    #[test]
    fn completion_callback_wakes_only_its_channel() {
        let (mixer, pool) = pool();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        mixer.set_rate(a.index(), 8_000);

        let ring = crate::ring::BufferRing::allocate(8_000, 1, 28).unwrap();
        ring.arm();
        ring.commit(0, &[0; 8]);
        ring.mark_queued(0);
        mixer.queue_buffer(a.index(), crate::ring::WaveBuf::new(ring, 0));
        let mut out = vec![0.0f32; 16];
        mixer.render(&mut out, 1, 8_000);

        assert!(a.entry().signal.wait_timeout(Duration::from_millis(100)));
        assert!(!b.entry().signal.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn release_resets_hardware_channel() {
        let (mixer, pool) = pool();
        let lease = pool.acquire().unwrap();
        mixer.set_rate(lease.index(), 44_100);
        drop(lease);
        assert_eq!(mixer.channel_rate(0), 0);
        assert!(!pool.is_bound(0));
    }
}
