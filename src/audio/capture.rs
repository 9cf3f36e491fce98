//! Microphone audio capture using cpal.
//!
//! Captures audio at the device's native sample rate, downmixes and
//! resamples to the pipeline rate, and re-blocks it into fixed-size
//! [`AudioFrame`]s.

use crate::audio::frame::{FrameAssembler, f32_to_i16};
use crate::config::AudioConfig;
use crate::error::{KioskError, Result};
use crate::pipeline::messages::AudioFrame;
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A producer of audio frames.
///
/// Implementations push frames into `tx` without ever blocking on a full
/// queue, and return when `cancel` fires or the source is exhausted.
#[async_trait]
pub trait AudioFrameSource: Send + Sync {
    /// Produce frames until cancelled or exhausted.
    async fn run(&self, tx: mpsc::Sender<AudioFrame>, cancel: CancellationToken) -> Result<()>;
}

/// Audio capture from the system microphone via cpal.
pub struct CpalCapture {
    device: cpal::Device,
    stream_config: StreamConfig,
    /// The pipeline sample rate (e.g. 16kHz).
    target_sample_rate: u32,
    frame_size: usize,
}

impl CpalCapture {
    /// Create a new capture instance.
    ///
    /// Uses the device's default configuration for maximum compatibility,
    /// then resamples to the target rate in software.
    ///
    /// # Errors
    ///
    /// Returns an error if no input device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.input_device {
            host.input_devices()
                .map_err(|e| KioskError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| KioskError::Audio(format!("input device '{name}' not found")))?
        } else {
            host.default_input_device()
                .ok_or_else(|| KioskError::Audio("no default input device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using input device: {device_name}");

        let default_config = device
            .default_input_config()
            .map_err(|e| KioskError::Audio(format!("no default input config: {e}")))?;

        let stream_config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: default_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        info!(
            "native input config: {}Hz, {} channels -> {}Hz mono, {} samples/frame",
            stream_config.sample_rate,
            stream_config.channels,
            config.sample_rate,
            config.frame_size
        );

        Ok(Self {
            device,
            stream_config,
            target_sample_rate: config.sample_rate,
            frame_size: config.frame_size,
        })
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| KioskError::Audio(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl AudioFrameSource for CpalCapture {
    async fn run(&self, tx: mpsc::Sender<AudioFrame>, cancel: CancellationToken) -> Result<()> {
        let native_rate = self.stream_config.sample_rate;
        let native_channels = self.stream_config.channels;
        let target_rate = self.target_sample_rate;
        let mut assembler = FrameAssembler::new(self.frame_size, target_rate);

        let stream = self
            .device
            .build_input_stream(
                &self.stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = to_mono(data, native_channels);
                    let resampled = resample(&mono, native_rate, target_rate);
                    let pcm: Vec<i16> = resampled.into_iter().map(f32_to_i16).collect();
                    // try_send keeps the audio thread from ever blocking.
                    assembler.push(&pcm, |frame| match tx.try_send(frame) {
                        Ok(()) => true,
                        Err(_) => {
                            debug!("frame queue full, dropping frame");
                            false
                        }
                    });
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(|e| KioskError::Audio(format!("failed to build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| KioskError::Audio(format!("failed to start input stream: {e}")))?;

        info!("audio capture started");

        // Hold the stream alive until cancelled
        cancel.cancelled().await;

        drop(stream);
        info!("audio capture stopped");
        Ok(())
    }
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
pub(crate) fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    let ch = usize::from(channels);
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler.
///
/// Adequate for speech: there is no anti-alias filter, and speech energy
/// sits below 8kHz.
pub(crate) fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || src_rate == 0 || dst_rate == 0 {
        return samples.to_vec();
    }

    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else {
            f64::from(samples[idx.min(samples.len() - 1)])
        };

        output.push(sample as f32);
    }

    output
}
