//! Timer-driven output for the software mixer.
//!
//! Renders one block per tick on a background thread and discards the result, standing in for
//! an output device on headless hosts. `speed > 1.0` runs the clock faster than real time.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Sender, select};

use super::soft::SoftMixer;

/// Block size and pacing of a [`ClockedOutput`].
#[derive(Clone, Debug)]
pub struct ClockConfig {
    pub rate_hz: u32,
    pub channels: usize,
    /// Frames rendered per tick.
    pub period_frames: usize,
    /// Clock multiplier; 1.0 is real time.
    pub speed: f32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            rate_hz: 48_000,
            channels: 2,
            period_frames: 480,
            speed: 1.0,
        }
    }
}

impl ClockConfig {
    /// Wall-clock time between ticks.
    pub fn period(&self) -> Duration {
        let speed = if self.speed.is_finite() && self.speed > 0.0 {
            self.speed as f64
        } else {
            1.0
        };
        let secs = self.period_frames.max(1) as f64 / self.rate_hz.max(1) as f64 / speed;
        Duration::from_secs_f64(secs)
    }
}

/// Background thread pulling blocks from a [`SoftMixer`] at a fixed pace.
pub struct ClockedOutput {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ClockedOutput {
    pub fn start(mixer: Arc<SoftMixer>, cfg: ClockConfig) -> Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let period = cfg.period();
        let channels = cfg.channels.max(1);
        let mut block = vec![0.0f32; cfg.period_frames.max(1) * channels];

        let handle = std::thread::Builder::new()
            .name("clocked-output".to_string())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(period);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => mixer.render(&mut block, channels, cfg.rate_hz),
                    }
                }
                tracing::debug!("clocked output stopped");
            })
            .context("spawn clocked output thread")?;

        tracing::debug!(period_us = period.as_micros() as u64, "clocked output started");
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop ticking and join the thread. Idempotent.
    pub fn stop(&mut self) {
        // Dropping the sender disconnects `stop_rx`, which wakes the select.
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ClockedOutput {
    fn drop(&mut self) {
        self.stop();
    }
}
