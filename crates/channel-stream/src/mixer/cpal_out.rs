//! Output device stage (CPAL).
//!
//! Opens an output stream on the default (or a named) device and renders the software mixer
//! straight from the real-time callback. The callback never waits on a condition variable;
//! the only lock it takes is the mixer's channel table.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::soft::SoftMixer;

/// A running output stream fed by a [`SoftMixer`].
pub struct CpalOutput {
    stream: cpal::Stream,
    rate_hz: u32,
    channels: usize,
}

impl CpalOutput {
    /// Start playback on the device whose name contains `needle` (case-insensitive), or on
    /// the host default device.
    pub fn start(mixer: Arc<SoftMixer>, needle: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = pick_device(&host, needle)?;
        let supported = device
            .default_output_config()
            .context("default output config")?;
        let config: cpal::StreamConfig = supported.clone().into();
        let rate_hz = config.sample_rate;
        let channels = config.channels as usize;

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, mixer),
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, mixer),
            cpal::SampleFormat::I32 => build_stream::<i32>(&device, &config, mixer),
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, mixer),
            other => Err(anyhow!("Unsupported sample format: {other:?}")),
        }?;
        stream.play().context("start output stream")?;

        tracing::info!(
            device = %device.description().map(|d| d.to_string()).unwrap_or_default(),
            rate_hz,
            channels,
            "output stream started"
        );
        Ok(Self {
            stream,
            rate_hz,
            channels,
        })
    }

    pub fn rate_hz(&self) -> u32 {
        self.rate_hz
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Pause the device stream; queued buffers stay where they are.
    pub fn pause(&self) -> Result<()> {
        self.stream.pause().context("pause output stream")
    }
}

/// Pick the first output device matching `needle` (case-insensitive), or the default device.
fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let needle_lc = needle.to_lowercase();
        let mut devices = host.output_devices().context("No output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .map(|desc| desc.name().to_lowercase().contains(&needle_lc))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Type-specialized stream builder for CPAL sample formats.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mixer: Arc<SoftMixer>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = config.channels as usize;
    let rate_hz = config.sample_rate;
    let mut scratch: Vec<f32> = Vec::new();

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            if scratch.len() != data.len() {
                scratch.resize(data.len(), 0.0);
            }
            mixer.render(&mut scratch, channels, rate_hz);
            for (dst, src) in data.iter_mut().zip(scratch.iter()) {
                *dst = <T as cpal::Sample>::from_sample::<f32>(src.clamp(-1.0, 1.0));
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}
