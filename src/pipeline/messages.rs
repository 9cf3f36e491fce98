//! Message types passed between pipeline stages.

use std::time::{Duration, Instant};

/// A fixed-size block of captured mono PCM audio.
///
/// Frames are immutable once captured. Sequence numbers increase by exactly
/// one for every frame delivered to the pipeline.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Monotonic sequence number assigned at capture.
    pub seq: u64,
    /// Signed 16-bit mono samples.
    pub samples: Vec<i16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Timestamp when this frame was captured.
    pub captured_at: Instant,
}

impl AudioFrame {
    /// Audio duration of this frame.
    pub fn duration(&self) -> Duration {
        samples_duration(self.samples.len(), self.sample_rate)
    }

    /// RMS energy of the frame on samples normalized to \[-1, 1\].
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let x = f64::from(s) / 32_768.0;
                x * x
            })
            .sum();
        (sum_sq / self.samples.len() as f64).sqrt() as f32
    }
}

/// One speech segment: the frames between speech onset and the end of the
/// turn, with trailing silence trimmed.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Frames in capture order. Sequence numbers are strictly increasing
    /// and contiguous.
    pub frames: Vec<AudioFrame>,
    /// Capture time of the first frame.
    pub started_at: Instant,
    /// When the silence threshold elapsed (or the turn was force-completed).
    pub ended_at: Instant,
}

impl Utterance {
    /// Total audio duration of the frames.
    pub fn duration(&self) -> Duration {
        let samples = self.frames.iter().map(|f| f.samples.len()).sum();
        samples_duration(samples, self.sample_rate())
    }

    /// Sample rate of the frames (0 when empty).
    pub fn sample_rate(&self) -> u32 {
        self.frames.first().map_or(0, |f| f.sample_rate)
    }

    /// All samples, concatenated in order.
    pub fn samples(&self) -> Vec<i16> {
        let total = self.frames.iter().map(|f| f.samples.len()).sum();
        let mut out = Vec::with_capacity(total);
        for frame in &self.frames {
            out.extend_from_slice(&frame.samples);
        }
        out
    }

    /// Whether frame sequence numbers are strictly increasing with no gaps.
    pub fn is_contiguous(&self) -> bool {
        self.frames.windows(2).all(|w| w[1].seq == w[0].seq + 1)
    }
}

/// Output of one [`TurnSegmenter::observe`](crate::vad::TurnSegmenter::observe) step.
#[derive(Debug, Clone)]
pub enum SegmentEvent {
    /// First non-silent frame of a new turn.
    SpeechStarted,
    /// A frame was added to the turn in progress.
    SpeechContinuing,
    /// The turn ended; the utterance is ready for transcription.
    TurnComplete(Utterance),
    /// The turn ended but was too short to be speech, or a capture gap
    /// broke it. Nothing is forwarded.
    TurnDiscarded,
}

fn samples_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(samples as f64 / f64::from(sample_rate))
}
