//! Keyword intent routing for visitor requests.
//!
//! Greetings, check-in, booking and contact requests have fixed answers at
//! a hotel desk, so they are spoken from configured scripts without a
//! knowledge lookup or a model call. Information requests and anything
//! unrecognised take the full retrieval + generation path.
//!
//! Matching is a word-level scan (well under a millisecond) over the
//! lowercased, accent-folded transcript. Specific requests win over a
//! greeting, so "hola, ¿dónde está la piscina?" is still an information
//! request.

use crate::config::IntentConfig;
use std::fmt;

/// What the visitor is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Intent {
    /// Hello, good morning.
    Greeting,
    /// Wants to check in.
    CheckIn,
    /// Wants to book a room or a table.
    Booking,
    /// Wants to reach a person.
    Contact,
    /// Asks about the hotel (hours, places, wifi).
    Info,
    /// Nothing recognised.
    #[default]
    Unknown,
}

impl Intent {
    /// Stable identifier for logs and events.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::CheckIn => "check_in",
            Self::Booking => "booking",
            Self::Contact => "contact",
            Self::Info => "info",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Keyword tables ──────────────────────────────────────────────────────

/// Checked in order; the first intent with a matching phrase wins.
/// Phrases are written accent-free and lowercase.
const INTENT_TABLE: &[(Intent, &[&str])] = &[
    (
        Intent::CheckIn,
        &["check in", "checkin", "llegada", "registrarme", "registro"],
    ),
    (
        Intent::Booking,
        &["reservar", "reserva", "reservacion", "alojamiento", "book a room"],
    ),
    (
        Intent::Contact,
        &[
            "contacto",
            "contactar",
            "llamar",
            "telefono",
            "email",
            "correo",
            "hablar con alguien",
            "hablar con una persona",
        ],
    ),
    (
        Intent::Info,
        &[
            "horario",
            "hora",
            "donde",
            "ubicacion",
            "wifi",
            "clave",
            "piscina",
            "desayuno",
            "cena",
            "restaurante",
            "gym",
            "gimnasio",
        ],
    ),
    (
        Intent::Greeting,
        &[
            "hola",
            "buenos dias",
            "buenas tardes",
            "buenas noches",
            "buenas",
            "hey",
            "hello",
        ],
    ),
];

/// Classifies transcripts and hands out scripted replies.
#[derive(Debug, Clone)]
pub struct IntentRouter {
    config: IntentConfig,
}

impl IntentRouter {
    /// Create a router from configuration.
    pub fn new(config: &IntentConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Classify a transcript.
    pub fn classify(&self, text: &str) -> Intent {
        let words = normalized_words(text);
        if words.is_empty() {
            return Intent::Unknown;
        }
        INTENT_TABLE
            .iter()
            .find(|(_, phrases)| phrases.iter().any(|p| contains_phrase(&words, p)))
            .map_or(Intent::Unknown, |&(intent, _)| intent)
    }

    /// The scripted reply for `intent`, or `None` when the request needs
    /// retrieval and generation (or routing is disabled).
    ///
    /// Greetings rotate through the configured variants by `turn_index`.
    pub fn scripted_reply(&self, intent: Intent, turn_index: usize) -> Option<&str> {
        if !self.config.enabled {
            return None;
        }
        let reply = match intent {
            Intent::Greeting => {
                let n = self.config.greeting_replies.len();
                if n == 0 {
                    return None;
                }
                &self.config.greeting_replies[turn_index % n]
            }
            Intent::CheckIn => &self.config.check_in_reply,
            Intent::Booking => &self.config.booking_reply,
            Intent::Contact => &self.config.contact_reply,
            Intent::Info | Intent::Unknown => return None,
        };
        let reply = reply.trim();
        (!reply.is_empty()).then_some(reply)
    }
}

// ── Internals ───────────────────────────────────────────────────────────

/// Lowercase, accent-folded words.
fn normalized_words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .map(fold_accent)
        .collect::<String>()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_owned)
        .collect()
}

fn fold_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'ä' | 'â' => 'a',
        'é' | 'è' | 'ë' | 'ê' => 'e',
        'í' | 'ì' | 'ï' | 'î' => 'i',
        'ó' | 'ò' | 'ö' | 'ô' => 'o',
        'ú' | 'ù' | 'ü' | 'û' => 'u',
        'ñ' => 'n',
        other => other,
    }
}

/// Whether the phrase's words appear consecutively in `words`.
fn contains_phrase(words: &[String], phrase: &str) -> bool {
    let needle: Vec<&str> = phrase.split_whitespace().collect();
    if needle.is_empty() || needle.len() > words.len() {
        return false;
    }
    words
        .windows(needle.len())
        .any(|window| window.iter().zip(&needle).all(|(w, n)| w == n))
}
