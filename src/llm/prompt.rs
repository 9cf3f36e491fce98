//! System prompt and request assembly.

use crate::config::{DialogueConfig, GenerationConfig};
use crate::knowledge::RetrievalContext;
use crate::llm::{ChatMessage, GenerationRequest};
use std::time::Duration;

const NO_CONTEXT: &str = "No specific information is available for this question.";

/// Builds [`GenerationRequest`]s from dialogue settings.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    persona: String,
    reply_language: String,
    max_context_chars: usize,
    brevity_hint_after: Duration,
    max_tokens: u32,
    temperature: f32,
}

impl PromptBuilder {
    /// Create a builder from configuration.
    pub fn new(dialogue: &DialogueConfig, generation: &GenerationConfig) -> Self {
        Self {
            persona: dialogue.persona.clone(),
            reply_language: dialogue.reply_language.clone(),
            max_context_chars: dialogue.max_context_chars,
            brevity_hint_after: Duration::from_millis(dialogue.brevity_hint_after_ms),
            max_tokens: generation.max_tokens,
            temperature: generation.temperature,
        }
    }

    /// Assemble the request for one turn.
    ///
    /// `upstream_latency` is the time already spent on this turn before
    /// generation; past the configured threshold the model is asked to be
    /// extra brief.
    pub fn build(
        &self,
        query: &str,
        context: &RetrievalContext,
        history: Vec<ChatMessage>,
        upstream_latency: Duration,
    ) -> GenerationRequest {
        let mut system_prompt = format!(
            "You are {persona}.\n\
             \n\
             Rules:\n\
             - Answer using only the CONTEXT below. If it does not cover the question, say so and suggest asking at reception.\n\
             - Give concrete times, prices and places from the CONTEXT when available.\n\
             - Replies are spoken aloud: two or three short sentences, no lists, no markdown.\n\
             - Never repeat the question back.\n\
             - Always reply in {language}.\n",
            persona = self.persona,
            language = self.reply_language,
        );

        if upstream_latency > self.brevity_hint_after {
            system_prompt.push_str(
                "- The visitor has already waited longer than usual. Be extremely brief.\n",
            );
        }

        system_prompt.push_str("\nCONTEXT:\n");
        system_prompt.push_str(&self.context_block(context));

        GenerationRequest {
            system_prompt,
            history,
            user_message: query.trim().to_owned(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }

    /// Render passages, trimmed to the configured character budget.
    fn context_block(&self, context: &RetrievalContext) -> String {
        if context.is_empty() {
            return NO_CONTEXT.to_owned();
        }
        let joined = context
            .passages
            .iter()
            .map(|p| {
                if p.source.is_empty() {
                    p.text.trim().to_owned()
                } else {
                    format!("[{}] {}", p.source, p.text.trim())
                }
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        truncate_chars(&joined, self.max_context_chars)
    }
}

/// Cut `text` to at most `max` characters, marking the cut with "...".
fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::knowledge::Passage;

    fn builder() -> PromptBuilder {
        PromptBuilder::new(&DialogueConfig::default(), &GenerationConfig::default())
    }

    fn context(text: &str) -> RetrievalContext {
        RetrievalContext {
            passages: vec![Passage {
                text: text.into(),
                score: 0.8,
                source: "amenities.md".into(),
            }],
        }
    }

    #[test]
    fn includes_persona_language_and_context() {
        let req = builder().build(
            " what time does the pool close ",
            &context("The pool closes at 10pm."),
            Vec::new(),
            Duration::from_millis(500),
        );
        assert!(req.system_prompt.contains("a virtual hotel concierge"));
        assert!(req.system_prompt.contains("reply in Spanish"));
        assert!(req.system_prompt.contains("[amenities.md] The pool closes at 10pm."));
        assert!(!req.system_prompt.contains("extremely brief"));
        assert_eq!(req.user_message, "what time does the pool close");
    }

    #[test]
    fn empty_context_says_so() {
        let req = builder().build("hi", &RetrievalContext::empty(), Vec::new(), Duration::ZERO);
        assert!(req.system_prompt.contains(NO_CONTEXT));
    }

    #[test]
    fn slow_turn_adds_brevity_hint() {
        let req = builder().build(
            "hi",
            &RetrievalContext::empty(),
            Vec::new(),
            Duration::from_millis(6_500),
        );
        assert!(req.system_prompt.contains("extremely brief"));
    }

    #[test]
    fn long_context_is_trimmed() {
        let long = "a".repeat(5_000);
        let req = builder().build("q", &context(&long), Vec::new(), Duration::ZERO);
        let block = req.system_prompt.split("CONTEXT:\n").nth(1).unwrap();
        assert_eq!(block.chars().count(), 2_500 + 3);
        assert!(block.ends_with("..."));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("piscína", 5), "piscí...");
        assert_eq!(truncate_chars("abc", 3), "abc");
    }

    #[test]
    fn history_is_passed_through() {
        let history = vec![ChatMessage::user("hola"), ChatMessage::assistant("¡Hola!")];
        let req = builder().build("q", &RetrievalContext::empty(), history.clone(), Duration::ZERO);
        assert_eq!(req.history, history);
    }
}
