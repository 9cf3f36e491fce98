//! Speech synthesis with a remote primary voice and a local fallback.
//!
//! Two tiers:
//! - **Primary**: ElevenLabs over HTTP, returning raw 16-bit PCM.
//! - **Fallback**: `espeak-ng` (or `espeak`) run as a subprocess. If no
//!   binary is available, or it fails, a short prompt tone is produced so
//!   the output device always receives valid audio.
//!
//! [`SpeechSynthesizer::synthesize`] never fails; degradation is logged and
//! reported on the outcome.

use crate::audio::capture::resample;
use crate::audio::frame::{f32_to_i16, i16_to_f32};
use crate::audio::pcm::{PcmAudio, decode_wav};
use crate::config::SynthesisConfig;
use crate::llm::extract_error_message;
use crate::session::CredentialCache;
use async_trait::async_trait;
use std::f32::consts::PI;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// Sample rate requested from the primary backend and produced locally.
pub const OUTPUT_SAMPLE_RATE: u32 = 16_000;

/// Why the primary synthesis backend failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SynthesisError {
    /// The API key was refused (HTTP 401/403).
    #[error("credential rejected: {0}")]
    CredentialRejected(String),
    /// Character quota or rate limit exhausted.
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),
    /// Connection failure or timeout.
    #[error("network error: {0}")]
    Network(String),
    /// Any other error response.
    #[error("backend error: {0}")]
    Backend(String),
    /// The backend answered with no audio.
    #[error("backend returned no audio")]
    EmptyAudio,
}

impl SynthesisError {
    /// Whether the backend's credential should be skipped for the session.
    pub fn invalidates_credential(&self) -> bool {
        matches!(self, Self::CredentialRejected(_))
    }

    fn from_status(status: reqwest::StatusCode, message: &str) -> Self {
        let code = status.as_u16();
        match code {
            401 | 403 => Self::CredentialRejected(format!("HTTP {code}: {message}")),
            429 => Self::QuotaExhausted(format!("HTTP {code}: {message}")),
            _ => Self::Backend(format!("HTTP {code}: {message}")),
        }
    }
}

/// A high-quality synthesis backend that may fail.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    /// Stable identifier for logs and credential tracking.
    fn name(&self) -> &str;

    /// Synthesize `text` as 16-bit mono PCM. One attempt, no retry.
    async fn synthesize(&self, text: &str) -> Result<PcmAudio, SynthesisError>;
}

/// A synthesizer that always produces audio.
#[async_trait]
pub trait LocalSynthesizer: Send + Sync {
    /// Synthesize `text`; never fails.
    async fn synthesize(&self, text: &str) -> PcmAudio;
}

/// Result of one synthesis request.
#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    /// Audio to play (not yet sample-aligned).
    pub audio: PcmAudio,
    /// Whether the fallback tier produced it.
    pub degraded: bool,
}

/// Two-tier synthesizer used by the dialogue loop.
pub struct SpeechSynthesizer {
    primary: Option<Box<dyn SynthesisBackend>>,
    fallback: Box<dyn LocalSynthesizer>,
}

impl SpeechSynthesizer {
    /// Combine a primary backend (if configured) with a local fallback.
    pub fn new(
        primary: Option<Box<dyn SynthesisBackend>>,
        fallback: Box<dyn LocalSynthesizer>,
    ) -> Self {
        Self { primary, fallback }
    }

    /// Build the standard ElevenLabs + espeak pair from configuration.
    pub fn from_config(config: &SynthesisConfig) -> Self {
        let primary = ElevenLabsBackend::from_config(config)
            .map(|b| Box::new(b) as Box<dyn SynthesisBackend>);
        if primary.is_none() {
            warn!("no ElevenLabs key configured, using the local voice only");
        }
        Self::new(primary, Box::new(EspeakSynthesizer::from_config(config)))
    }

    /// Name of the primary backend, if any.
    pub fn primary_name(&self) -> Option<&str> {
        self.primary.as_deref().map(|p| p.name())
    }

    /// Synthesize `text`, falling back to the local voice on any primary
    /// failure. A primary whose credential was rejected earlier in the
    /// session is not called.
    pub async fn synthesize(&self, text: &str, credentials: &mut CredentialCache) -> SynthesisOutcome {
        if let Some(primary) = self.primary.as_deref() {
            let name = primary.name();
            if credentials.is_invalid(name) {
                debug!(backend = name, "primary voice disabled for this session");
            } else {
                let started = Instant::now();
                match primary.synthesize(text).await {
                    Ok(audio) if !audio.is_empty() => {
                        credentials.mark_valid(name);
                        debug!(
                            backend = name,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            bytes = audio.len(),
                            "primary synthesis succeeded"
                        );
                        return SynthesisOutcome {
                            audio,
                            degraded: false,
                        };
                    }
                    Ok(_) => {
                        warn!(backend = name, "primary synthesis returned no audio, using local voice");
                    }
                    Err(e) => {
                        if e.invalidates_credential() {
                            credentials.mark_invalid(name);
                        }
                        warn!(backend = name, error = %e, "primary synthesis failed, using local voice");
                    }
                }
            }
        }

        SynthesisOutcome {
            audio: self.fallback.synthesize(text).await,
            degraded: self.primary.is_some(),
        }
    }
}

/// ElevenLabs text-to-speech, requesting raw `pcm_16000` output.
pub struct ElevenLabsBackend {
    client: reqwest::Client,
    api_key: String,
    voice_id: String,
    model_id: String,
    base_url: String,
}

impl ElevenLabsBackend {
    /// Create a backend, or `None` when no API key is configured.
    pub fn from_config(config: &SynthesisConfig) -> Option<Self> {
        let api_key = config
            .elevenlabs_api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_default();
        Some(Self {
            client,
            api_key: api_key.to_owned(),
            voice_id: config.voice_id.clone(),
            model_id: config.model_id.clone(),
            base_url: config.base_url.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl SynthesisBackend for ElevenLabsBackend {
    fn name(&self) -> &str {
        "elevenlabs"
    }

    async fn synthesize(&self, text: &str) -> Result<PcmAudio, SynthesisError> {
        let url = format!("{}/v1/text-to-speech/{}", self.base_url, self.voice_id);
        let body = serde_json::json!({
            "text": text,
            "model_id": self.model_id,
            "voice_settings": { "stability": 0.5, "similarity_boost": 0.75 },
        });

        let response = self
            .client
            .post(&url)
            .query(&[("output_format", format!("pcm_{OUTPUT_SAMPLE_RATE}"))])
            .header("xi-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SynthesisError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = extract_detail_message(&body);
            return Err(SynthesisError::from_status(status, &message));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SynthesisError::Network(e.to_string()))?;
        if bytes.is_empty() {
            return Err(SynthesisError::EmptyAudio);
        }
        Ok(PcmAudio::new(bytes.to_vec(), OUTPUT_SAMPLE_RATE))
    }
}

/// ElevenLabs puts errors under `detail.message`; other services under
/// `error.message`.
fn extract_detail_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("detail")
                .and_then(|d| d.get("message").or(Some(d)))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| extract_error_message(body))
}

/// Local voice via `espeak-ng --stdout`.
pub struct EspeakSynthesizer {
    binary: Option<PathBuf>,
    voice: String,
    rate_wpm: u32,
}

impl EspeakSynthesizer {
    /// Locate the binary (explicit path, then `espeak-ng`, then `espeak`).
    pub fn from_config(config: &SynthesisConfig) -> Self {
        let binary = config
            .local_binary
            .clone()
            .filter(|p| p.exists())
            .or_else(|| which::which("espeak-ng").ok())
            .or_else(|| which::which("espeak").ok());
        match &binary {
            Some(path) => info!(binary = %path.display(), "local voice available"),
            None => warn!("espeak-ng not found, local fallback will play a tone"),
        }
        Self {
            binary,
            voice: config.local_voice.clone(),
            rate_wpm: config.local_rate_wpm,
        }
    }

    /// A synthesizer with no binary; always produces the prompt tone.
    pub fn tone_only() -> Self {
        Self {
            binary: None,
            voice: String::new(),
            rate_wpm: 0,
        }
    }

    async fn run_binary(&self, binary: &std::path::Path, text: &str) -> Result<PcmAudio, String> {
        // Text goes in on stdin so a reply starting with '-' is not an option.
        let mut child = tokio::process::Command::new(binary)
            .arg("-v")
            .arg(&self.voice)
            .arg("-s")
            .arg(self.rate_wpm.to_string())
            .arg("--stdout")
            .arg("--stdin")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to execute {}: {e}", binary.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|e| format!("cannot write text to {}: {e}", binary.display()))?;
            stdin
                .write_all(b"\n")
                .await
                .map_err(|e| format!("cannot write text to {}: {e}", binary.display()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| format!("{} did not finish: {e}", binary.display()))?;

        if !output.status.success() {
            return Err(format!(
                "{} exited with {}: {}",
                binary.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let wav = decode_wav(&output.stdout).map_err(|e| e.to_string())?;
        let samples = if wav.sample_rate == OUTPUT_SAMPLE_RATE {
            wav.samples
        } else {
            let float: Vec<f32> = wav.samples.iter().copied().map(i16_to_f32).collect();
            resample(&float, wav.sample_rate, OUTPUT_SAMPLE_RATE)
                .into_iter()
                .map(f32_to_i16)
                .collect()
        };
        if samples.is_empty() {
            return Err("local voice produced no audio".into());
        }
        Ok(PcmAudio::from_samples(&samples, OUTPUT_SAMPLE_RATE))
    }
}

#[async_trait]
impl LocalSynthesizer for EspeakSynthesizer {
    async fn synthesize(&self, text: &str) -> PcmAudio {
        if let Some(binary) = &self.binary {
            match self.run_binary(binary, text).await {
                Ok(audio) => return audio,
                Err(e) => error!("local voice failed, playing prompt tone: {e}"),
            }
        }
        prompt_tone(OUTPUT_SAMPLE_RATE)
    }
}

/// Two short beeps, so a visitor knows the kiosk heard them.
pub fn prompt_tone(sample_rate: u32) -> PcmAudio {
    let beep = (sample_rate as usize * 150) / 1000;
    let gap = (sample_rate as usize * 80) / 1000;
    let mut samples = Vec::with_capacity(beep * 2 + gap);
    let tone = |i: usize| {
        let t = i as f32 / sample_rate.max(1) as f32;
        // Short linear fade avoids clicks at the edges.
        let fade = (i.min(beep - i) as f32 / (beep as f32 * 0.1)).min(1.0);
        f32_to_i16(0.3 * fade * (2.0 * PI * 660.0 * t).sin())
    };
    samples.extend((0..beep).map(tone));
    samples.extend(std::iter::repeat_n(0, gap));
    samples.extend((0..beep).map(tone));
    PcmAudio::from_samples(&samples, sample_rate)
}
