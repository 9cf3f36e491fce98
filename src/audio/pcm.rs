//! PCM buffers and WAV encoding.

use crate::audio::frame::f32_to_i16;
use crate::error::{KioskError, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Cursor;
use std::time::Duration;

/// Synthesized speech as raw little-endian 16-bit mono PCM bytes.
///
/// Remote backends may return byte counts that are not a whole number of
/// samples; run the buffer through
/// [`PlaybackBufferAligner`](crate::audio::aligner::PlaybackBufferAligner)
/// before writing it to a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcmAudio {
    /// Raw PCM bytes.
    pub bytes: Vec<u8>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl PcmAudio {
    /// Wrap raw bytes.
    pub fn new(bytes: Vec<u8>, sample_rate: u32) -> Self {
        Self { bytes, sample_rate }
    }

    /// Encode samples as little-endian bytes.
    pub fn from_samples(samples: &[i16], sample_rate: u32) -> Self {
        let bytes = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self { bytes, sample_rate }
    }

    /// Decode whole samples; a trailing odd byte is ignored.
    pub fn samples(&self) -> Vec<i16> {
        self.bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    /// Byte length.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether there is no audio.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Playback duration.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((self.bytes.len() / 2) as f64 / f64::from(self.sample_rate))
    }
}

/// Encode mono 16-bit samples as an in-memory WAV file.
///
/// # Errors
///
/// Returns an error if the WAV writer fails.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)
            .map_err(|e| KioskError::Audio(format!("cannot start WAV: {e}")))?;
        for &s in samples {
            writer
                .write_sample(s)
                .map_err(|e| KioskError::Audio(format!("cannot write WAV sample: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| KioskError::Audio(format!("cannot finalize WAV: {e}")))?;
    }
    Ok(cursor.into_inner())
}

/// Decoded WAV content, downmixed to mono 16-bit.
#[derive(Debug, Clone)]
pub struct DecodedWav {
    /// Mono samples.
    pub samples: Vec<i16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

/// Decode a WAV byte buffer to mono 16-bit samples.
///
/// Writers that stream to a pipe (`espeak-ng --stdout`) cannot patch the
/// chunk sizes afterwards and leave a placeholder length in the header.
/// When the declared data is longer than the buffer, decoding stops at the
/// end of the buffer instead of failing.
///
/// # Errors
///
/// Returns an error if the data is not a readable WAV file.
pub fn decode_wav(bytes: &[u8]) -> Result<DecodedWav> {
    let reader = WavReader::new(Cursor::new(bytes))
        .map_err(|e| KioskError::Audio(format!("invalid WAV data: {e}")))?;
    let streamed = declared_data_len(&reader) > bytes.len() as u64;
    read_wav(reader, streamed)
}

/// Read a WAV file from disk as mono 16-bit samples.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or decoded.
pub fn read_wav_file(path: &std::path::Path) -> Result<DecodedWav> {
    let reader = WavReader::open(path)
        .map_err(|e| KioskError::Audio(format!("cannot open {}: {e}", path.display())))?;
    let streamed = declared_data_len(&reader) > std::fs::metadata(path)?.len();
    read_wav(reader, streamed)
}

/// Data chunk length in bytes according to the header.
fn declared_data_len<R: std::io::Read>(reader: &WavReader<R>) -> u64 {
    let bytes_per_sample = u64::from(reader.spec().bits_per_sample).div_ceil(8);
    u64::from(reader.len()) * bytes_per_sample
}

/// With `streamed`, the first short read is the end of the data.
fn collect_samples<S>(
    samples: impl Iterator<Item = hound::Result<S>>,
    streamed: bool,
    convert: impl Fn(S) -> i16,
) -> Result<Vec<i16>> {
    if streamed {
        return Ok(samples.map_while(std::result::Result::ok).map(convert).collect());
    }
    samples
        .map(|s| s.map(&convert))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| KioskError::Audio(format!("bad WAV sample: {e}")))
}

fn read_wav<R: std::io::Read>(reader: WavReader<R>, streamed: bool) -> Result<DecodedWav> {
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 16) => collect_samples(reader.into_samples::<i16>(), streamed, |s| s)?,
        (SampleFormat::Int, bits) if bits <= 32 => {
            let shift = u32::from(bits.saturating_sub(16));
            collect_samples(reader.into_samples::<i32>(), streamed, |v| {
                if bits > 16 {
                    (v >> shift) as i16
                } else {
                    (v << (16 - bits)) as i16
                }
            })?
        }
        (SampleFormat::Float, 32) => {
            collect_samples(reader.into_samples::<f32>(), streamed, f32_to_i16)?
        }
        (format, bits) => {
            return Err(KioskError::Audio(format!(
                "unsupported WAV format: {format:?} {bits}-bit"
            )));
        }
    };

    let samples = if channels > 1 {
        interleaved
            .chunks_exact(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
                (sum / channels as i32) as i16
            })
            .collect()
    } else {
        interleaved
    };

    Ok(DecodedWav {
        samples,
        sample_rate: spec.sample_rate,
    })
}
