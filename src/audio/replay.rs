//! Frame source that replays a recorded WAV file.
//!
//! Lets the full turn-taking path run without a microphone: the file is
//! downmixed and resampled to the pipeline rate, then fed through the same
//! [`FrameAssembler`] as live capture.

use crate::audio::capture::{AudioFrameSource, resample};
use crate::audio::frame::{FrameAssembler, f32_to_i16, i16_to_f32};
use crate::audio::pcm::read_wav_file;
use crate::config::AudioConfig;
use crate::error::Result;
use crate::pipeline::messages::AudioFrame;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Replays a WAV file as a stream of audio frames.
pub struct WavReplaySource {
    samples: Vec<i16>,
    sample_rate: u32,
    frame_size: usize,
    realtime: bool,
}

impl WavReplaySource {
    /// Load `path` and prepare it for replay at the configured rate.
    ///
    /// `trailing_silence` is appended so the final turn reaches its silence
    /// timeout. With `realtime` set, frames are paced at capture speed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read as WAV.
    pub fn open(
        path: impl Into<PathBuf>,
        config: &AudioConfig,
        trailing_silence: Duration,
        realtime: bool,
    ) -> Result<Self> {
        let path = path.into();
        let wav = read_wav_file(&path)?;
        let samples = if wav.sample_rate == config.sample_rate {
            wav.samples
        } else {
            let float: Vec<f32> = wav.samples.iter().copied().map(i16_to_f32).collect();
            resample(&float, wav.sample_rate, config.sample_rate)
                .into_iter()
                .map(f32_to_i16)
                .collect()
        };
        info!(
            path = %path.display(),
            source_rate = wav.sample_rate,
            seconds = samples.len() as f64 / f64::from(config.sample_rate.max(1)),
            "loaded replay audio"
        );
        Ok(Self::from_samples(samples, config, trailing_silence, realtime))
    }

    /// Replay in-memory samples already at the configured rate.
    pub fn from_samples(
        mut samples: Vec<i16>,
        config: &AudioConfig,
        trailing_silence: Duration,
        realtime: bool,
    ) -> Self {
        let pad = (trailing_silence.as_secs_f64() * f64::from(config.sample_rate)) as usize;
        samples.resize(samples.len() + pad, 0);
        Self {
            samples,
            sample_rate: config.sample_rate,
            frame_size: config.frame_size.max(1),
            realtime,
        }
    }
}

#[async_trait]
impl AudioFrameSource for WavReplaySource {
    async fn run(&self, tx: mpsc::Sender<AudioFrame>, cancel: CancellationToken) -> Result<()> {
        let mut assembler = FrameAssembler::new(self.frame_size, self.sample_rate);
        let frame_period =
            Duration::from_secs_f64(self.frame_size as f64 / f64::from(self.sample_rate.max(1)));

        for block in self.samples.chunks(self.frame_size) {
            if cancel.is_cancelled() {
                break;
            }
            let mut ready = Vec::with_capacity(1);
            assembler.push(block, |frame| {
                ready.push(frame);
                true
            });
            for frame in ready {
                // Replay has no real-time deadline, so wait for queue space
                // instead of dropping.
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    sent = tx.send(frame) => {
                        if sent.is_err() {
                            warn!("frame queue closed, stopping replay");
                            return Ok(());
                        }
                    }
                }
            }
            if self.realtime {
                tokio::time::sleep(frame_period).await;
            }
        }

        info!(frames_dropped = assembler.dropped(), "replay finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::audio::pcm::encode_wav;

    fn config() -> AudioConfig {
        AudioConfig {
            sample_rate: 16_000,
            frame_size: 160,
            ..AudioConfig::default()
        }
    }

    #[tokio::test]
    async fn replays_contiguous_frames_with_padding() {
        let source = WavReplaySource::from_samples(
            vec![500; 1600],
            &config(),
            Duration::from_millis(100),
            false,
        );
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(async move { source.run(tx, cancel).await });

        let mut seqs = Vec::new();
        while let Some(frame) = rx.recv().await {
            assert_eq!(frame.samples.len(), 160);
            seqs.push(frame.seq);
        }
        handle.await.unwrap().unwrap();
        assert_eq!(seqs, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn open_resamples_to_pipeline_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.wav");
        std::fs::write(&path, encode_wav(&vec![1000; 8000], 8_000).unwrap()).unwrap();

        let source = WavReplaySource::open(&path, &config(), Duration::ZERO, false).unwrap();
        assert_eq!(source.samples.len(), 16_000);
    }
}
