//! Runtime events emitted by the dialogue loop for display and observability.
//!
//! Events are small and cloneable so the orchestrator can broadcast them
//! without waiting on slow subscribers.

use crate::session::{DialogueState, StageLatencies, TurnStatus};
use uuid::Uuid;

/// What the kiosk is doing "right now".
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// The dialogue state machine moved.
    StateChanged {
        from: DialogueState,
        to: DialogueState,
    },
    /// The visitor's words, as transcribed.
    Transcript { turn_id: Uuid, text: String },
    /// The text about to be spoken.
    Reply {
        turn_id: Uuid,
        text: String,
        /// Generation provider that answered, if any.
        provider: Option<String>,
    },
    /// An utterance was dropped because a turn was already queued or the
    /// kiosk was speaking.
    UtteranceDropped { reason: &'static str },
    /// A turn finished and was appended to history.
    TurnFinished {
        turn_id: Uuid,
        status: TurnStatus,
        latencies: StageLatencies,
        synthesis_degraded: bool,
    },
}
