//! Process-wide session state: dialogue state, turn history, and provider
//! credential validity.
//!
//! A [`SessionState`] is created at startup and mutated only by the
//! dialogue orchestrator. History is append-only.

use crate::audio::pcm::PcmAudio;
use crate::config::KioskConfig;
use crate::intent::Intent;
use crate::knowledge::RetrievalContext;
use crate::llm::ChatMessage;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// What the kiosk is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DialogueState {
    /// Capture armed, no speech in progress.
    #[default]
    Idle,
    /// A user turn is being accumulated.
    Listening,
    /// Transcription, retrieval and generation are running.
    Processing,
    /// A stage failed; an apology is about to be spoken.
    Error,
    /// The reply is being synthesized and played.
    Speaking,
}

impl fmt::Display for DialogueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Error => "error",
            Self::Speaking => "speaking",
        };
        f.write_str(s)
    }
}

/// Validity of a provider credential as observed this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredentialStatus {
    /// Not yet used.
    #[default]
    Unknown,
    /// Accepted at least once.
    Valid,
    /// Rejected by the provider; skip for the rest of the session.
    Invalid,
}

/// Provider id to credential validity.
#[derive(Debug, Clone, Default)]
pub struct CredentialCache {
    statuses: HashMap<String, CredentialStatus>,
}

impl CredentialCache {
    /// Status for `provider` (Unknown if never seen).
    pub fn status(&self, provider: &str) -> CredentialStatus {
        self.statuses.get(provider).copied().unwrap_or_default()
    }

    /// Whether `provider` should be skipped.
    pub fn is_invalid(&self, provider: &str) -> bool {
        self.status(provider) == CredentialStatus::Invalid
    }

    /// Record a successful authenticated call.
    ///
    /// An invalid credential stays invalid: it is never retried, so it
    /// cannot succeed again.
    pub fn mark_valid(&mut self, provider: &str) {
        let status = self.statuses.entry(provider.to_owned()).or_default();
        if *status == CredentialStatus::Unknown {
            *status = CredentialStatus::Valid;
        }
    }

    /// Record an authentication rejection.
    pub fn mark_invalid(&mut self, provider: &str) {
        let previous = self
            .statuses
            .insert(provider.to_owned(), CredentialStatus::Invalid);
        if previous != Some(CredentialStatus::Invalid) {
            warn!(provider, "credential rejected, provider disabled for this session");
        }
    }

    /// All providers currently marked invalid.
    pub fn invalid_providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .statuses
            .iter()
            .filter(|(_, s)| **s == CredentialStatus::Invalid)
            .map(|(n, _)| n.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// A generated reply was spoken.
    Completed,
    /// A scripted reply was spoken without retrieval or generation.
    Scripted,
    /// Nothing intelligible was heard; a clarification was spoken.
    EmptyTranscript,
    /// Transcription failed; an apology was spoken.
    TranscriptionFailed,
    /// Every generation provider failed; an apology was spoken.
    GenerationFailed,
}

impl TurnStatus {
    /// Whether the visitor got a real answer; only these turns feed the
    /// model's history window.
    pub fn is_answer(self) -> bool {
        matches!(self, Self::Completed | Self::Scripted)
    }
}

/// Wall-clock time spent in each stage of a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageLatencies {
    /// Speech-to-text.
    pub transcription: Duration,
    /// Knowledge lookup.
    pub retrieval: Duration,
    /// Reply generation, including failed providers.
    pub generation: Duration,
    /// Speech synthesis.
    pub synthesis: Duration,
    /// Device playback.
    pub playback: Duration,
}

impl StageLatencies {
    /// Time before generation started; drives the brevity hint.
    pub fn before_generation(&self) -> Duration {
        self.transcription + self.retrieval
    }

    /// Sum of all stages.
    pub fn total(&self) -> Duration {
        self.transcription + self.retrieval + self.generation + self.synthesis + self.playback
    }
}

/// One user turn and everything the pipeline produced for it.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    /// Turn identifier.
    pub id: Uuid,
    /// What the user said.
    pub transcript: String,
    /// What the request was classified as.
    pub intent: Intent,
    /// Passages handed to the generator.
    pub context: RetrievalContext,
    /// What the kiosk said back.
    pub reply: String,
    /// Sample-aligned synthesized reply.
    pub audio: PcmAudio,
    /// Per-stage timings.
    pub latencies: StageLatencies,
    /// Outcome.
    pub status: TurnStatus,
    /// Generation provider that answered, if any.
    pub provider: Option<String>,
    /// Whether the local fallback voice was used.
    pub synthesis_degraded: bool,
    /// When the turn finished.
    pub completed_at: DateTime<Utc>,
}

/// Session-scoped settings fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Silence that ends a turn.
    pub silence_timeout_ms: u32,
    /// Transcription model size.
    pub whisper_model: String,
    /// Generation providers in preference order.
    pub providers: Vec<String>,
}

impl SessionSettings {
    /// Capture the session-relevant settings from configuration.
    pub fn from_config(config: &KioskConfig) -> Self {
        Self {
            silence_timeout_ms: config.segmenter.silence_timeout_ms,
            whisper_model: config.transcription.model.to_string(),
            providers: config
                .generation
                .providers
                .iter()
                .map(|p| p.as_str().to_owned())
                .collect(),
        }
    }
}

/// State that lives for the whole process.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Session identifier.
    pub session_id: Uuid,
    /// Process start time.
    pub started_at: DateTime<Utc>,
    /// Current dialogue state.
    pub state: DialogueState,
    /// Session settings.
    pub settings: SessionSettings,
    /// Provider credential validity.
    pub credentials: CredentialCache,
    history: Vec<ConversationTurn>,
}

impl SessionState {
    /// Start a new session.
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            state: DialogueState::Idle,
            settings,
            credentials: CredentialCache::default(),
            history: Vec::new(),
        }
    }

    /// Completed and failed turns, oldest first.
    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    /// Append a finished turn.
    pub fn record_turn(&mut self, turn: ConversationTurn) {
        self.history.push(turn);
    }

    /// The last `turns` successful exchanges as chat messages, oldest first.
    ///
    /// Failed turns are left out so apologies never reach the model.
    pub fn recent_messages(&self, turns: usize) -> Vec<ChatMessage> {
        let recent: Vec<&ConversationTurn> = self
            .history
            .iter()
            .rev()
            .filter(|t| t.status.is_answer())
            .take(turns)
            .collect();
        recent
            .into_iter()
            .rev()
            .flat_map(|t| {
                [
                    ChatMessage::user(t.transcript.clone()),
                    ChatMessage::assistant(t.reply.clone()),
                ]
            })
            .collect()
    }
}
