//! Configuration types for the kiosk pipeline.
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then environment variables (see [`KioskConfig::apply_env_from`]).

use crate::error::{KioskError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Sample rates the capture path accepts.
pub const SUPPORTED_SAMPLE_RATES: [u32; 4] = [8_000, 16_000, 32_000, 48_000];

/// Top-level configuration for the kiosk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KioskConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Turn segmentation (voice activity) settings.
    pub segmenter: SegmenterConfig,
    /// Speech-to-text settings.
    pub transcription: TranscriptionConfig,
    /// Knowledge retrieval settings.
    pub retrieval: RetrievalConfig,
    /// Reply generation provider settings.
    pub generation: GenerationConfig,
    /// Speech synthesis settings.
    pub synthesis: SynthesisConfig,
    /// Dialogue behaviour (prompting, canned replies, queueing).
    pub dialogue: DialogueConfig,
    /// Scripted answers for greetings and desk requests.
    pub intents: IntentConfig,
    /// Verbose logging.
    pub debug: bool,
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Pipeline sample rate in Hz. Capture is resampled to this rate.
    pub sample_rate: u32,
    /// Samples per [`AudioFrame`](crate::pipeline::messages::AudioFrame).
    pub frame_size: usize,
    /// Bytes per PCM sample on the playback path.
    pub sample_width: usize,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// Capacity of the captured-frame queue.
    pub frame_queue: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_size: 1024,
            sample_width: 2,
            input_device: None,
            output_device: None,
            frame_queue: 64,
        }
    }
}

impl AudioConfig {
    /// Duration of one frame in milliseconds.
    pub fn frame_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_size as f64 * 1000.0 / f64::from(self.sample_rate)
    }
}

/// Turn segmentation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Continuous silence in ms that ends a turn.
    pub silence_timeout_ms: u32,
    /// RMS energy threshold for speech, on samples normalized to \[-1, 1\].
    ///
    /// Typical values:
    ///   - 0.005: very sensitive
    ///   - 0.01:  normal sensitivity (default)
    ///   - 0.03:  noisy lobby
    pub energy_threshold: f32,
    /// Number of recent frames averaged for the energy measure.
    pub energy_window_frames: usize,
    /// Utterances shorter than this are discarded as noise.
    pub min_speech_ms: u32,
    /// Turns are force-completed once they reach this length.
    pub max_utterance_ms: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            silence_timeout_ms: 1500,
            energy_threshold: 0.01,
            energy_window_frames: 2,
            min_speech_ms: 120,
            max_utterance_ms: 30_000,
        }
    }
}

/// Whisper model size. Larger models are more accurate and slower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhisperModel {
    /// Fastest, least accurate.
    Tiny,
    /// Balanced default.
    #[default]
    Base,
    /// Most accurate of the supported sizes.
    Small,
}

impl WhisperModel {
    /// Model identifier sent to the transcription server.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tiny => "tiny",
            Self::Base => "base",
            Self::Small => "small",
        }
    }
}

impl fmt::Display for WhisperModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WhisperModel {
    type Err = KioskError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tiny" => Ok(Self::Tiny),
            "base" => Ok(Self::Base),
            "small" => Ok(Self::Small),
            other => Err(KioskError::Config(format!(
                "unknown whisper model '{other}' (expected tiny, base or small)"
            ))),
        }
    }
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// Model size, selected once per session.
    pub model: WhisperModel,
    /// Spoken language hint (ISO 639-1).
    pub language: String,
    /// Base URL of an OpenAI-compatible transcription server.
    pub api_url: String,
    /// Optional bearer token for the transcription server.
    pub api_key: Option<String>,
    /// Request timeout in ms.
    pub timeout_ms: u64,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            model: WhisperModel::Base,
            language: "es".into(),
            api_url: "http://127.0.0.1:8080".into(),
            api_key: None,
            timeout_ms: 15_000,
        }
    }
}

/// Knowledge retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Passage file produced by the ingestion job (JSON array or JSON lines).
    pub index_path: Option<PathBuf>,
    /// Maximum passages returned per query.
    pub top_k: usize,
    /// Minimum relevance score in \[0, 1\] for a passage to be returned.
    pub min_score: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            index_path: None,
            top_k: 3,
            min_score: 0.1,
        }
    }
}

/// Generation provider identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Google Gemini `generateContent` API.
    Gemini,
    /// OpenAI Chat Completions API.
    OpenAi,
}

impl ProviderKind {
    /// Stable provider id, used in logs and the credential cache.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenAi => "openai",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = KioskError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" => Ok(Self::Gemini),
            "openai" => Ok(Self::OpenAi),
            other => Err(KioskError::Config(format!("unknown LLM provider '{other}'"))),
        }
    }
}

/// Reply generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Providers in the order they are tried.
    pub providers: Vec<ProviderKind>,
    /// Gemini settings.
    pub gemini: RemoteModelConfig,
    /// OpenAI settings.
    pub openai: RemoteModelConfig,
    /// Maximum tokens in a reply.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            providers: vec![ProviderKind::Gemini, ProviderKind::OpenAi],
            gemini: RemoteModelConfig {
                api_key: None,
                model: "gemini-1.5-flash".into(),
                base_url: "https://generativelanguage.googleapis.com".into(),
                timeout_ms: 5_000,
            },
            openai: RemoteModelConfig {
                api_key: None,
                model: "gpt-4o-mini".into(),
                base_url: "https://api.openai.com".into(),
                timeout_ms: 3_000,
            },
            max_tokens: 150,
            temperature: 0.7,
        }
    }
}

/// Connection settings for a hosted model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteModelConfig {
    /// API key. A missing key disables the provider.
    pub api_key: Option<String>,
    /// Model identifier.
    pub model: String,
    /// API base URL.
    pub base_url: String,
    /// Request timeout in ms.
    pub timeout_ms: u64,
}

impl RemoteModelConfig {
    /// The API key, if one is set and non-blank.
    pub fn credential(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

/// Speech synthesis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// ElevenLabs API key. A missing key leaves only the local voice.
    pub elevenlabs_api_key: Option<String>,
    /// ElevenLabs voice id.
    pub voice_id: String,
    /// ElevenLabs model id.
    pub model_id: String,
    /// ElevenLabs API base URL.
    pub base_url: String,
    /// Request timeout in ms.
    pub timeout_ms: u64,
    /// Explicit path to the local synthesizer binary (None = search `PATH`
    /// for `espeak-ng`, then `espeak`).
    pub local_binary: Option<PathBuf>,
    /// Voice passed to the local synthesizer (`espeak-ng -v`).
    pub local_voice: String,
    /// Local synthesizer speaking rate in words per minute.
    pub local_rate_wpm: u32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            elevenlabs_api_key: None,
            voice_id: "21m00Tcm4TlvDq8ikWAM".into(),
            model_id: "eleven_multilingual_v2".into(),
            base_url: "https://api.elevenlabs.io".into(),
            timeout_ms: 10_000,
            local_binary: None,
            local_voice: "es".into(),
            local_rate_wpm: 160,
        }
    }
}

/// Dialogue behaviour configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    /// Who the assistant is, used as the opening of the system prompt.
    pub persona: String,
    /// Language replies must be written in.
    pub reply_language: String,
    /// Completed turns included as conversation history.
    pub history_turns: usize,
    /// Retrieved context is trimmed to this many characters.
    pub max_context_chars: usize,
    /// Pre-generation latency in ms above which a brevity hint is added.
    pub brevity_hint_after_ms: u64,
    /// Spoken when transcription or generation fails.
    pub apology: String,
    /// Spoken when the transcript is empty.
    pub clarification: String,
    /// Capacity of the completed-utterance queue.
    pub utterance_queue: usize,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            persona: "a virtual hotel concierge".into(),
            reply_language: "Spanish".into(),
            history_turns: 5,
            max_context_chars: 2500,
            brevity_hint_after_ms: 6_000,
            apology: "Lo siento, no he podido procesar tu consulta. ¿Puedes intentarlo de nuevo?"
                .into(),
            clarification: "No entendí bien lo que dijiste. ¿Podrías repetir?".into(),
            utterance_queue: 4,
        }
    }
}

/// Scripted replies for requests that need no lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    /// Answer greetings and desk requests from the scripts below. When
    /// off, every request goes through retrieval and generation.
    pub enabled: bool,
    /// Greeting variants, used in rotation.
    pub greeting_replies: Vec<String>,
    /// Reply to check-in requests.
    pub check_in_reply: String,
    /// Reply to booking requests.
    pub booking_reply: String,
    /// Reply to requests for a person or contact details.
    pub contact_reply: String,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            greeting_replies: vec![
                "¡Hola! Bienvenido a nuestro hotel. ¿En qué puedo ayudarte?".into(),
                "¡Buenos días! Soy tu asistente virtual. ¿Qué necesitas saber?".into(),
                "¡Hola! Estoy aquí para ayudarte con cualquier consulta sobre el hotel.".into(),
            ],
            check_in_reply: "Para realizar el check-in necesito tu número de reserva. \
                             También puedes hacerlo directamente en recepción a partir de las 15:00."
                .into(),
            booking_reply: "Me gustaría ayudarte con la reserva. ¿Para qué fecha y hora la necesitas?"
                .into(),
            contact_reply: "Puedes hablar con el personal en el mostrador de recepción, \
                            que está abierto las 24 horas."
                .into(),
        }
    }
}

impl KioskConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| KioskError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| KioskError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/concierge/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("concierge").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("concierge")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/concierge-config/config.toml")
        }
    }

    /// Overlay settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a recognised variable has an unparseable value.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(std::env::vars())
    }

    /// Overlay settings from `KEY=value` pairs.
    ///
    /// Unknown keys are ignored. Blank credential values count as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if a recognised variable has an unparseable value.
    pub fn apply_env_from<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let value = value.as_ref().trim();
            match key.as_ref() {
                "WHISPER_MODEL" => self.transcription.model = value.parse()?,
                "STT_LANGUAGE" => self.transcription.language = value.to_owned(),
                "STT_API_URL" => self.transcription.api_url = value.to_owned(),
                "SILENCE_TIMEOUT_MS" => {
                    self.segmenter.silence_timeout_ms = parse_number(key.as_ref(), value)?;
                }
                "SAMPLE_RATE" => self.audio.sample_rate = parse_number(key.as_ref(), value)?,
                "CHUNK_SIZE" => self.audio.frame_size = parse_number(key.as_ref(), value)?,
                "LLM_PROVIDERS" => {
                    self.generation.providers = value
                        .split(',')
                        .filter(|p| !p.trim().is_empty())
                        .map(str::parse)
                        .collect::<Result<_>>()?;
                }
                "GOOGLE_API_KEY" => self.generation.gemini.api_key = non_blank(value),
                "OPENAI_API_KEY" => self.generation.openai.api_key = non_blank(value),
                "ELEVENLABS_API_KEY" => self.synthesis.elevenlabs_api_key = non_blank(value),
                "TTS_VOICE_ID" if !value.is_empty() => self.synthesis.voice_id = value.to_owned(),
                "KNOWLEDGE_INDEX_PATH" => {
                    self.retrieval.index_path = non_blank(value).map(PathBuf::from);
                }
                "INTENT_ROUTING" => {
                    self.intents.enabled =
                        !matches!(value.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off");
                }
                "DEBUG" => {
                    self.debug = matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`KioskError::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.audio.sample_rate) {
            return Err(KioskError::Config(format!(
                "sample rate {} not supported (expected one of {SUPPORTED_SAMPLE_RATES:?})",
                self.audio.sample_rate
            )));
        }
        if self.audio.frame_size == 0 {
            return Err(KioskError::Config("frame size must be positive".into()));
        }
        if self.audio.sample_width == 0 {
            return Err(KioskError::Config("sample width must be positive".into()));
        }
        if self.segmenter.silence_timeout_ms == 0 {
            return Err(KioskError::Config(
                "silence timeout must be positive".into(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(KioskError::Config("top_k must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.retrieval.min_score) {
            return Err(KioskError::Config(format!(
                "min_score {} outside [0, 1]",
                self.retrieval.min_score
            )));
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| KioskError::Config(format!("{key} must be a number, got '{value}'")))
}

fn non_blank(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = KioskConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.audio.sample_rate, 16_000);
        assert_eq!(config.segmenter.silence_timeout_ms, 1500);
        assert_eq!(config.transcription.model, WhisperModel::Base);
        assert_eq!(
            config.generation.providers,
            vec![ProviderKind::Gemini, ProviderKind::OpenAi]
        );
    }

    #[test]
    fn env_overlay_sets_model_timeout_and_keys() {
        let mut config = KioskConfig::default();
        config
            .apply_env_from([
                ("WHISPER_MODEL", "small"),
                ("SILENCE_TIMEOUT_MS", "900"),
                ("OPENAI_API_KEY", "sk-test"),
                ("GOOGLE_API_KEY", "   "),
                ("UNRELATED", "ignored"),
            ])
            .unwrap();

        assert_eq!(config.transcription.model, WhisperModel::Small);
        assert_eq!(config.segmenter.silence_timeout_ms, 900);
        assert_eq!(config.generation.openai.credential(), Some("sk-test"));
        assert_eq!(config.generation.gemini.credential(), None);
    }

    #[test]
    fn env_overlay_reorders_providers() {
        let mut config = KioskConfig::default();
        config
            .apply_env_from([("LLM_PROVIDERS", "openai, gemini")])
            .unwrap();
        assert_eq!(
            config.generation.providers,
            vec![ProviderKind::OpenAi, ProviderKind::Gemini]
        );
    }

    #[test]
    fn env_overlay_toggles_intent_routing() {
        let mut config = KioskConfig::default();
        assert!(config.intents.enabled);
        config.apply_env_from([("INTENT_ROUTING", "off")]).unwrap();
        assert!(!config.intents.enabled);
        config.apply_env_from([("INTENT_ROUTING", "1")]).unwrap();
        assert!(config.intents.enabled);
    }

    #[test]
    fn intent_scripts_load_from_toml() {
        let config: KioskConfig = toml::from_str(
            r#"
            [intents]
            contact_reply = "Marque el 9 para recepción."
            "#,
        )
        .unwrap();
        assert_eq!(config.intents.contact_reply, "Marque el 9 para recepción.");
        assert!(config.intents.enabled);
        assert_eq!(config.intents.greeting_replies.len(), 3);
    }

    #[test]
    fn env_overlay_rejects_unknown_model() {
        let mut config = KioskConfig::default();
        let result = config.apply_env_from([("WHISPER_MODEL", "large-v3")]);
        assert!(matches!(result, Err(KioskError::Config(_))));
    }

    #[test]
    fn env_overlay_rejects_non_numeric_timeout() {
        let mut config = KioskConfig::default();
        let result = config.apply_env_from([("SILENCE_TIMEOUT_MS", "soon")]);
        assert!(result.is_err());
    }

    #[test]
    fn validate_rejects_unsupported_sample_rate() {
        let mut config = KioskConfig::default();
        config.audio.sample_rate = 44_100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn whisper_model_parses_case_insensitively() {
        assert_eq!("TINY".parse::<WhisperModel>().unwrap(), WhisperModel::Tiny);
        assert_eq!(" base ".parse::<WhisperModel>().unwrap(), WhisperModel::Base);
    }

    #[test]
    fn frame_ms_matches_rate() {
        let audio = AudioConfig {
            sample_rate: 16_000,
            frame_size: 160,
            ..AudioConfig::default()
        };
        assert!((audio.frame_ms() - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result = KioskConfig::from_file(std::path::Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = KioskConfig::default();
        config.segmenter.silence_timeout_ms = 2000;
        config.transcription.model = WhisperModel::Tiny;
        config.save_to_file(&path).unwrap();

        let loaded = KioskConfig::from_file(&path).unwrap();
        assert_eq!(loaded.segmenter.silence_timeout_ms, 2000);
        assert_eq!(loaded.transcription.model, WhisperModel::Tiny);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config: KioskConfig = toml::from_str(
            r#"
            [segmenter]
            silence_timeout_ms = 800

            [generation]
            providers = ["openai"]
            "#,
        )
        .unwrap();
        assert_eq!(config.segmenter.silence_timeout_ms, 800);
        assert_eq!(config.segmenter.energy_window_frames, 2);
        assert_eq!(config.generation.providers, vec![ProviderKind::OpenAi]);
        assert_eq!(config.audio.frame_size, 1024);
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = KioskConfig::default_config_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.ends_with("config.toml"));
        assert!(path_str.contains("concierge"));
    }
}
