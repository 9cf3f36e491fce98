//! Audio playback sinks.

use crate::audio::frame::i16_to_f32;
use crate::audio::pcm::{PcmAudio, encode_wav};
use crate::config::AudioConfig;
use crate::error::{KioskError, Result};
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// Destination for sample-aligned reply audio.
///
/// `play` returns once the audio has been fully written to the device.
#[async_trait]
pub trait AudioSink: Send {
    /// Play one buffer of 16-bit mono PCM.
    async fn play(&mut self, audio: &PcmAudio) -> Result<()>;
}

/// Audio playback to system speakers via cpal.
pub struct CpalPlayback {
    device: Arc<cpal::Device>,
}

impl CpalPlayback {
    /// Create a new playback instance.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.output_device {
            host.output_devices()
                .map_err(|e| KioskError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| KioskError::Audio(format!("output device '{name}' not found")))?
        } else {
            host.default_output_device()
                .ok_or_else(|| KioskError::Audio("no default output device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using output device: {device_name}");

        Ok(Self {
            device: Arc::new(device),
        })
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
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
impl AudioSink for CpalPlayback {
    async fn play(&mut self, audio: &PcmAudio) -> Result<()> {
        if audio.is_empty() {
            return Ok(());
        }
        let samples: Vec<f32> = audio.samples().into_iter().map(i16_to_f32).collect();
        let sample_rate = audio.sample_rate;
        let device = Arc::clone(&self.device);

        // The drain loop sleeps, so keep it off the async workers.
        tokio::task::spawn_blocking(move || play_blocking(&device, samples, sample_rate))
            .await
            .map_err(|e| KioskError::Audio(format!("playback task failed: {e}")))?
    }
}

/// Play samples and block until the device has consumed them.
fn play_blocking(device: &cpal::Device, samples: Vec<f32>, sample_rate: u32) -> Result<()> {
    let stream_config = StreamConfig {
        channels: 1,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let buffer = Arc::new(Mutex::new(PlaybackBuffer {
        samples,
        position: 0,
        finished: false,
    }));
    let buffer_clone = Arc::clone(&buffer);

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut buf = match buffer_clone.lock() {
                    Ok(b) => b,
                    Err(_) => return,
                };

                for sample in data.iter_mut() {
                    if buf.position < buf.samples.len() {
                        *sample = buf.samples[buf.position];
                        buf.position += 1;
                    } else {
                        *sample = 0.0;
                        buf.finished = true;
                    }
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| KioskError::Audio(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| KioskError::Audio(format!("failed to start output stream: {e}")))?;

    loop {
        std::thread::sleep(std::time::Duration::from_millis(10));
        let buf = buffer
            .lock()
            .map_err(|e| KioskError::Audio(format!("playback buffer lock poisoned: {e}")))?;
        if buf.finished {
            break;
        }
    }

    drop(stream);
    Ok(())
}

/// Internal buffer for tracking playback progress.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

/// Writes each reply to `reply-NNN.wav` in a directory.
///
/// Used by replay mode and on machines without an output device.
pub struct WavDirSink {
    dir: PathBuf,
    count: usize,
}

impl WavDirSink {
    /// Create the sink, creating `dir` if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, count: 0 })
    }

    /// Number of files written so far.
    pub fn written(&self) -> usize {
        self.count
    }
}

#[async_trait]
impl AudioSink for WavDirSink {
    async fn play(&mut self, audio: &PcmAudio) -> Result<()> {
        self.count += 1;
        let path = self.dir.join(format!("reply-{:03}.wav", self.count));
        let wav = encode_wav(&audio.samples(), audio.sample_rate)?;
        tokio::fs::write(&path, wav).await?;
        info!(path = %path.display(), ms = audio.duration().as_millis() as u64, "reply written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::audio::pcm::read_wav_file;

    #[tokio::test]
    async fn wav_dir_sink_numbers_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = WavDirSink::new(dir.path().join("out")).unwrap();

        sink.play(&PcmAudio::from_samples(&[1, 2, 3], 16_000))
            .await
            .unwrap();
        sink.play(&PcmAudio::from_samples(&[4, 5], 16_000))
            .await
            .unwrap();

        assert_eq!(sink.written(), 2);
        let second = read_wav_file(&dir.path().join("out").join("reply-002.wav")).unwrap();
        assert_eq!(second.samples, vec![4, 5]);
    }
}
