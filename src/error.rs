//! Error types for the concierge pipeline.

/// Top-level error type for the kiosk runtime.
///
/// Stage-level failures that the dialogue loop recovers from have their own
/// types next to the stage (`TranscriptionError`, `ProviderError`,
/// `GenerationError`, `SynthesisError`); this enum covers device and setup
/// failures, including a generator with no usable provider.
#[derive(Debug, thiserror::Error)]
pub enum KioskError {
    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Knowledge index loading error.
    #[error("retrieval error: {0}")]
    Retrieval(String),

    /// Every generation provider failed or none is configured.
    #[error("generation error: {0}")]
    Generation(#[from] crate::llm::GenerationError),

    /// Pipeline coordination error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, KioskError>;
