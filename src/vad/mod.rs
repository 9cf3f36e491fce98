//! Turn segmentation using energy-based voice activity detection.
//!
//! [`TurnSegmenter`] is a pure state machine: feed it frames in capture order
//! with [`TurnSegmenter::observe`] and it reports when a user turn starts and
//! when it is complete. A frame counts as silent when the mean RMS energy of
//! the most recent frames falls below the configured threshold; a turn ends
//! once the silence since the last non-silent frame reaches the timeout.

use crate::config::SegmenterConfig;
use crate::pipeline::messages::{AudioFrame, SegmentEvent, Utterance};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Splits a continuous frame stream into utterances.
pub struct TurnSegmenter {
    /// Energy threshold on normalized RMS.
    threshold: f32,
    /// Energies of the most recent frames.
    window: VecDeque<f32>,
    /// Number of frames averaged.
    window_len: usize,
    silence_timeout_ms: u64,
    min_speech_ms: u64,
    max_utterance_ms: u64,
    /// Turn in progress, if any.
    turn: Option<ActiveTurn>,
}

struct ActiveTurn {
    /// Frames up to and including the last non-silent one.
    voiced: Vec<AudioFrame>,
    /// Silent frames since the last non-silent frame.
    trailing: Vec<AudioFrame>,
    started_at: Instant,
}

impl ActiveTurn {
    fn last_seq(&self) -> Option<u64> {
        self.trailing
            .last()
            .or_else(|| self.voiced.last())
            .map(|f| f.seq)
    }

    fn trailing_ms(&self) -> u64 {
        frames_ms(&self.trailing)
    }

    fn total_ms(&self) -> u64 {
        frames_ms(&self.voiced) + frames_ms(&self.trailing)
    }
}

impl TurnSegmenter {
    /// Create a segmenter from configuration.
    pub fn new(config: &SegmenterConfig) -> Self {
        let window_len = config.energy_window_frames.max(1);
        info!(
            "segmenter initialized: threshold={}, window={} frames, silence_timeout={}ms, min_speech={}ms",
            config.energy_threshold, window_len, config.silence_timeout_ms, config.min_speech_ms
        );
        Self {
            threshold: config.energy_threshold,
            window: VecDeque::with_capacity(window_len),
            window_len,
            silence_timeout_ms: u64::from(config.silence_timeout_ms),
            min_speech_ms: u64::from(config.min_speech_ms),
            max_utterance_ms: u64::from(config.max_utterance_ms),
            turn: None,
        }
    }

    /// Whether a turn is in progress.
    pub fn in_turn(&self) -> bool {
        self.turn.is_some()
    }

    /// Feed one frame and return what it means for the current turn.
    ///
    /// Returns `None` for silent frames outside a turn.
    pub fn observe(&mut self, frame: &AudioFrame) -> Option<SegmentEvent> {
        let silent = self.push_energy(frame.rms());

        let gap = self
            .turn
            .as_ref()
            .and_then(ActiveTurn::last_seq)
            .is_some_and(|last| frame.seq != last + 1);
        if gap {
            warn!(seq = frame.seq, "frame gap inside a turn, discarding turn");
            self.reset();
            // Keep its energy so speech on the next frame opens a new turn
            // with a regular SpeechStarted.
            self.push_energy(frame.rms());
            return Some(SegmentEvent::TurnDiscarded);
        }

        let Some(turn) = self.turn.as_mut() else {
            if silent {
                return None;
            }
            self.start_turn(frame);
            return Some(SegmentEvent::SpeechStarted);
        };

        if silent {
            turn.trailing.push(frame.clone());
            if turn.trailing_ms() >= self.silence_timeout_ms {
                return Some(self.finish(frame.captured_at));
            }
        } else {
            let trailing = std::mem::take(&mut turn.trailing);
            turn.voiced.extend(trailing);
            turn.voiced.push(frame.clone());
        }

        if self
            .turn
            .as_ref()
            .is_some_and(|t| t.total_ms() >= self.max_utterance_ms)
        {
            info!("utterance reached {}ms, completing turn", self.max_utterance_ms);
            return Some(self.finish(frame.captured_at));
        }

        Some(SegmentEvent::SpeechContinuing)
    }

    /// Drop any turn in progress and forget recent energy.
    pub fn reset(&mut self) {
        self.turn = None;
        self.window.clear();
    }

    fn start_turn(&mut self, frame: &AudioFrame) {
        debug!(seq = frame.seq, "speech started");
        self.turn = Some(ActiveTurn {
            voiced: vec![frame.clone()],
            trailing: Vec::new(),
            started_at: frame.captured_at,
        });
    }

    /// Record a frame energy and report whether the window reads as silence.
    fn push_energy(&mut self, energy: f32) -> bool {
        if self.window.len() == self.window_len {
            self.window.pop_front();
        }
        self.window.push_back(energy);
        let mean = self.window.iter().sum::<f32>() / self.window.len() as f32;
        mean < self.threshold
    }

    fn finish(&mut self, ended_at: Instant) -> SegmentEvent {
        let turn = self.turn.take();
        self.window.clear();

        let Some(turn) = turn else {
            return SegmentEvent::TurnDiscarded;
        };

        let utterance = Utterance {
            frames: turn.voiced,
            started_at: turn.started_at,
            ended_at,
        };

        let speech_ms = utterance.duration().as_millis() as u64;
        if speech_ms < self.min_speech_ms {
            debug!(speech_ms, "utterance below minimum length, treating as noise");
            return SegmentEvent::TurnDiscarded;
        }

        info!(
            speech_ms,
            frames = utterance.frames.len(),
            "turn complete"
        );
        SegmentEvent::TurnComplete(utterance)
    }
}

fn frames_ms(frames: &[AudioFrame]) -> u64 {
    let Some(rate) = frames.first().map(|f| u64::from(f.sample_rate)) else {
        return 0;
    };
    if rate == 0 {
        return 0;
    }
    let samples: u64 = frames.iter().map(|f| f.samples.len() as u64).sum();
    samples * 1000 / rate
}
