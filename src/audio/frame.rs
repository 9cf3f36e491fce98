//! Fixed-size frame assembly for captured audio.

use crate::pipeline::messages::AudioFrame;
use std::time::Instant;

/// Re-blocks an arbitrary-length sample stream into fixed-size frames.
///
/// A sequence number is consumed only when a frame is accepted by the
/// delivery callback, so a dropped frame never leaves a gap in the sequence
/// the pipeline sees.
pub struct FrameAssembler {
    frame_size: usize,
    sample_rate: u32,
    pending: Vec<i16>,
    next_seq: u64,
    dropped: u64,
}

impl FrameAssembler {
    /// Create an assembler producing frames of `frame_size` samples.
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            sample_rate,
            pending: Vec::with_capacity(frame_size * 2),
            next_seq: 0,
            dropped: 0,
        }
    }

    /// Append samples and offer every completed frame to `deliver`.
    ///
    /// `deliver` returns `false` when the frame could not be queued; the
    /// frame is then dropped. Returns the number of frames delivered.
    pub fn push<F>(&mut self, samples: &[i16], mut deliver: F) -> usize
    where
        F: FnMut(AudioFrame) -> bool,
    {
        self.pending.extend_from_slice(samples);
        let mut delivered = 0;
        while self.pending.len() >= self.frame_size {
            let block: Vec<i16> = self.pending.drain(..self.frame_size).collect();
            let frame = AudioFrame {
                seq: self.next_seq,
                samples: block,
                sample_rate: self.sample_rate,
                captured_at: Instant::now(),
            };
            if deliver(frame) {
                self.next_seq += 1;
                delivered += 1;
            } else {
                self.dropped += 1;
            }
        }
        delivered
    }

    /// Frames dropped because delivery failed.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Convert a normalized float sample to signed 16-bit PCM.
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

/// Convert signed 16-bit PCM to a normalized float sample.
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32_768.0
}
