//! Concierge: a spoken-dialogue kiosk with real-time turn taking.
//!
//! A visitor speaks, the kiosk transcribes, retrieves hotel knowledge,
//! generates a reply and speaks it back:
//! Microphone → segmenter → STT → retrieval → LLM → TTS → aligner → Speaker
//!
//! # Architecture
//!
//! Capture and segmentation run as their own tasks joined by bounded
//! channels, so the microphone never stalls behind a slow turn:
//! - **Audio capture**: Records from the microphone via `cpal` (or replays a WAV file)
//! - **Segmenter**: Splits frames into utterances using energy and silence
//! - **STT**: Transcribes through a Whisper-compatible HTTP server
//! - **Intents**: Answers greetings and desk requests from scripts
//! - **Knowledge**: Ranks pre-built passages against the transcript
//! - **LLM**: Gemini and OpenAI with ordered fallback
//! - **TTS**: ElevenLabs with a local `espeak-ng` fallback
//! - **Audio playback**: Sample-aligned PCM via `cpal` (or WAV files)

pub mod audio;
pub mod config;
pub mod error;
pub mod intent;
pub mod knowledge;
pub mod llm;
pub mod pipeline;
pub mod runtime;
pub mod session;
pub mod stt;
pub mod tts;
pub mod vad;

pub use config::KioskConfig;
pub use error::{KioskError, Result};
pub use pipeline::orchestrator::{DialogueOrchestrator, DialogueServices};
pub use runtime::RuntimeEvent;
pub use session::{ConversationTurn, DialogueState, SessionState};
