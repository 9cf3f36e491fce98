//! Sample alignment for playback buffers.
//!
//! Remote synthesis can hand back a byte count that is not a whole number of
//! samples. Output devices expect whole samples, so the tail is cut.

use tracing::debug;

/// Truncates byte buffers to a whole number of samples.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackBufferAligner {
    sample_width: usize,
}

impl PlaybackBufferAligner {
    /// Create an aligner for samples of `sample_width` bytes (at least 1).
    pub fn new(sample_width: usize) -> Self {
        Self {
            sample_width: sample_width.max(1),
        }
    }

    /// Bytes per sample.
    pub fn sample_width(&self) -> usize {
        self.sample_width
    }

    /// Longest prefix of `bytes` whose length is a multiple of the sample width.
    pub fn align<'a>(&self, bytes: &'a [u8]) -> &'a [u8] {
        let keep = bytes.len() - bytes.len() % self.sample_width;
        if keep != bytes.len() {
            debug!(
                dropped = bytes.len() - keep,
                "truncating partial sample from playback buffer"
            );
        }
        &bytes[..keep]
    }

    /// Owned variant of [`align`](Self::align), truncating in place.
    pub fn align_vec(&self, mut bytes: Vec<u8>) -> Vec<u8> {
        let keep = self.align(&bytes).len();
        bytes.truncate(keep);
        bytes
    }
}

impl Default for PlaybackBufferAligner {
    /// 16-bit PCM.
    fn default() -> Self {
        Self::new(2)
    }
}
