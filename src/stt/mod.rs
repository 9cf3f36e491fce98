//! Speech-to-text via a Whisper transcription server.
//!
//! The kiosk does not run recognition in-process. Utterances are encoded as
//! 16-bit WAV and posted to an OpenAI-compatible
//! `/v1/audio/transcriptions` endpoint (whisper.cpp server,
//! faster-whisper-server, or the OpenAI API itself).

use crate::audio::pcm::encode_wav;
use crate::config::{TranscriptionConfig, WhisperModel};
use crate::pipeline::messages::Utterance;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Why a transcription attempt failed. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscriptionError {
    /// The backend could not be reached or is not serving.
    #[error("transcription backend unavailable: {0}")]
    Unavailable(String),
    /// The audio was empty or rejected as undecodable.
    #[error("malformed audio: {0}")]
    MalformedAudio(String),
    /// The backend answered with an error or an unreadable body.
    #[error("transcription backend error: {0}")]
    Backend(String),
}

/// Converts an utterance's audio to text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one utterance. An empty string means nothing intelligible
    /// was said.
    async fn transcribe(&self, utterance: &Utterance) -> Result<String, TranscriptionError>;
}

/// Transcriber backed by a Whisper HTTP server.
pub struct WhisperServerTranscriber {
    client: reqwest::Client,
    endpoint: String,
    model: WhisperModel,
    language: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl WhisperServerTranscriber {
    /// Create a transcriber from configuration.
    pub fn new(config: &TranscriptionConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_default();
        let endpoint = format!(
            "{}/v1/audio/transcriptions",
            config.api_url.trim_end_matches('/')
        );
        info!(model = %config.model, endpoint = %endpoint, "transcriber configured");
        Self {
            client,
            endpoint,
            model: config.model,
            language: config.language.clone(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
        }
    }

    fn map_http_error(status: reqwest::StatusCode, body: &str) -> TranscriptionError {
        let message = extract_error_message(body);
        match status.as_u16() {
            400 | 413 | 415 | 422 => TranscriptionError::MalformedAudio(format!(
                "HTTP {}: {message}",
                status.as_u16()
            )),
            502..=504 => TranscriptionError::Unavailable(format!(
                "HTTP {}: {message}",
                status.as_u16()
            )),
            _ => TranscriptionError::Backend(format!("HTTP {}: {message}", status.as_u16())),
        }
    }
}

#[async_trait]
impl Transcriber for WhisperServerTranscriber {
    async fn transcribe(&self, utterance: &Utterance) -> Result<String, TranscriptionError> {
        let samples = utterance.samples();
        if samples.is_empty() || utterance.sample_rate() == 0 {
            return Err(TranscriptionError::MalformedAudio(
                "utterance has no audio".into(),
            ));
        }

        let started = Instant::now();
        let wav = encode_wav(&samples, utterance.sample_rate())
            .map_err(|e| TranscriptionError::MalformedAudio(e.to_string()))?;

        let part = Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscriptionError::Backend(e.to_string()))?;
        let form = Form::new()
            .part("file", part)
            .text("model", self.model.as_str())
            .text("language", self.language.clone())
            .text("response_format", "json");

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TranscriptionError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_http_error(status, &body));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| TranscriptionError::Backend(format!("unreadable response: {e}")))?;

        let text = parsed.text.trim().to_owned();
        debug!(
            audio_ms = utterance.duration().as_millis() as u64,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "transcribed utterance"
        );
        Ok(text)
    }
}

/// Pull `error.message` (OpenAI style) or `error` (whisper.cpp style) out of
/// an error body, falling back to the raw text.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            let error = v.get("error")?;
            error
                .get("message")
                .and_then(|m| m.as_str())
                .or_else(|| error.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn maps_client_errors_to_malformed_audio() {
        let err = WhisperServerTranscriber::map_http_error(
            reqwest::StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"error":{"message":"could not decode"}}"#,
        );
        assert_eq!(
            err,
            TranscriptionError::MalformedAudio("HTTP 422: could not decode".into())
        );
    }

    #[test]
    fn maps_gateway_errors_to_unavailable() {
        let err =
            WhisperServerTranscriber::map_http_error(reqwest::StatusCode::BAD_GATEWAY, "down");
        assert!(matches!(err, TranscriptionError::Unavailable(_)));
    }

    #[test]
    fn error_message_reads_plain_string_errors() {
        assert_eq!(extract_error_message(r#"{"error":"no model"}"#), "no model");
        assert_eq!(extract_error_message("plain"), "plain");
    }

    #[tokio::test]
    async fn empty_utterance_is_malformed() {
        let transcriber = WhisperServerTranscriber::new(&TranscriptionConfig::default());
        let now = Instant::now();
        let utterance = Utterance {
            frames: Vec::new(),
            started_at: now,
            ended_at: now,
        };
        let err = transcriber.transcribe(&utterance).await.unwrap_err();
        assert!(matches!(err, TranscriptionError::MalformedAudio(_)));
    }
}
