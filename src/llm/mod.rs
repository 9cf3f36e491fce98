//! Reply generation through hosted language models.
//!
//! Providers implement [`GenerationProvider`]; [`ResponseGenerator`] tries
//! them in order with per-session credential tracking. Prompt assembly lives
//! in [`prompt`].

pub mod fallback;
pub mod gemini;
pub mod openai;
pub mod prompt;

pub use fallback::{GeneratedReply, ResponseGenerator};
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use prompt::PromptBuilder;

use async_trait::async_trait;

/// Speaker of a history message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The kiosk visitor.
    User,
    /// The kiosk.
    Assistant,
}

impl Role {
    /// Role name in OpenAI-style chat APIs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One prior message included as conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Who said it.
    pub role: Role,
    /// What was said.
    pub content: String,
}

impl ChatMessage {
    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// An assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A fully assembled generation request, provider-agnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Instructions plus the retrieved context block.
    pub system_prompt: String,
    /// Prior exchanges, oldest first.
    pub history: Vec<ChatMessage>,
    /// The visitor's question for this turn.
    pub user_message: String,
    /// Reply length cap.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

/// Why a single provider attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The provider refused the API key (HTTP 401/403).
    #[error("credential rejected: {0}")]
    CredentialRejected(String),
    /// Rate limit or quota exhausted (HTTP 429).
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),
    /// Connection failure or timeout.
    #[error("network error: {0}")]
    Network(String),
    /// Any other error response or unreadable body.
    #[error("backend error: {0}")]
    Backend(String),
}

impl ProviderError {
    /// Whether the provider's credential should be treated as invalid for
    /// the rest of the session.
    pub fn invalidates_credential(&self) -> bool {
        matches!(self, Self::CredentialRejected(_))
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(provider: &str, status: reqwest::StatusCode, message: &str) -> Self {
        let code = status.as_u16();
        match code {
            401 | 403 => Self::CredentialRejected(format!("{provider} HTTP {code}: {message}")),
            429 => Self::QuotaExhausted(format!("{provider} HTTP {code}: {message}")),
            _ => Self::Backend(format!("{provider} HTTP {code}: {message}")),
        }
    }

    /// Classify a transport-level failure.
    pub fn from_transport(provider: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Network(format!("{provider} request timed out"))
        } else {
            Self::Network(format!("{provider} request failed: {err}"))
        }
    }
}

/// Every provider failed or was skipped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// The provider list is empty.
    #[error("no generation provider configured")]
    NoProviders,
    /// All providers were tried or skipped without a reply.
    #[error("all generation providers failed: {}", describe_failures(.failures))]
    AllProvidersFailed {
        /// `(provider, reason)` for each provider, in order.
        failures: Vec<(String, String)>,
    },
}

fn describe_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(provider, reason)| format!("{provider}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A hosted model that turns a request into reply text.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Stable identifier, used for logging and credential tracking.
    fn name(&self) -> &str;

    /// Make one attempt at a reply. Implementations must not retry.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError>;
}

/// Pull `error.message` out of a JSON error body, falling back to the raw text.
pub(crate) fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.trim().to_string())
}
