//! Knowledge retrieval over the kiosk's pre-built passage index.
//!
//! The ingestion job (out of process) chunks source documents and writes
//! them as passages. This module loads that file read-only and ranks
//! passages against a query by term-frequency cosine similarity.

use crate::config::RetrievalConfig;
use crate::error::{KioskError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// One retrieved passage.
#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    /// Passage text.
    pub text: String,
    /// Relevance in \[0, 1\].
    pub score: f32,
    /// Where the passage came from (file name, URL, ...).
    pub source: String,
}

/// Ranked passages for one query, best first, at most `top_k` long.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalContext {
    /// Passages in descending score order.
    pub passages: Vec<Passage>,
}

impl RetrievalContext {
    /// An empty context (nothing relevant found).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether no passage was relevant.
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Number of passages.
    pub fn len(&self) -> usize {
        self.passages.len()
    }

    /// Highest score, if any.
    pub fn best_score(&self) -> Option<f32> {
        self.passages.first().map(|p| p.score)
    }
}

/// Looks up context passages for a query.
///
/// Retrieval never fails: an unreachable or empty store yields an empty
/// context, which the prompt treats as "no specific information".
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    /// Return the most relevant passages for `query`.
    async fn retrieve(&self, query: &str) -> RetrievalContext;
}

#[derive(Debug, Deserialize)]
struct PassageRecord {
    #[serde(alias = "content", alias = "page_content")]
    text: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

impl PassageRecord {
    fn source(&self) -> String {
        self.source
            .clone()
            .or_else(|| {
                self.metadata
                    .as_ref()
                    .and_then(|m| m.get("source"))
                    .and_then(|s| s.as_str())
                    .map(String::from)
            })
            .unwrap_or_default()
    }
}

struct IndexedPassage {
    text: String,
    source: String,
    terms: HashMap<String, f32>,
    norm: f32,
}

/// In-memory passage index with lexical cosine ranking.
pub struct PassageIndex {
    passages: Vec<IndexedPassage>,
    top_k: usize,
    min_score: f32,
}

impl PassageIndex {
    /// Build an index from `(text, source)` pairs.
    pub fn new<I, T, S>(passages: I, config: &RetrievalConfig) -> Self
    where
        I: IntoIterator<Item = (T, S)>,
        T: Into<String>,
        S: Into<String>,
    {
        let passages = passages
            .into_iter()
            .filter_map(|(text, source)| {
                let text = text.into();
                let terms = term_frequencies(&text);
                if terms.is_empty() {
                    return None;
                }
                let norm = vector_norm(&terms);
                Some(IndexedPassage {
                    text,
                    source: source.into(),
                    terms,
                    norm,
                })
            })
            .collect();
        Self {
            passages,
            top_k: config.top_k,
            min_score: config.min_score,
        }
    }

    /// An index with no passages.
    pub fn empty(config: &RetrievalConfig) -> Self {
        Self::new(std::iter::empty::<(String, String)>(), config)
    }

    /// Load passages from a JSON array or JSON-lines file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path, config: &RetrievalConfig) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let records = parse_records(&content).map_err(|e| {
            KioskError::Retrieval(format!("cannot parse {}: {e}", path.display()))
        })?;
        let index = Self::new(
            records.into_iter().map(|r| {
                let source = r.source();
                (r.text, source)
            }),
            config,
        );
        info!(
            path = %path.display(),
            passages = index.len(),
            "knowledge index loaded"
        );
        Ok(index)
    }

    /// Load the configured index, or fall back to an empty one.
    ///
    /// A kiosk without knowledge still answers from the model alone, so a
    /// missing index is a warning rather than a startup failure.
    pub fn load_or_empty(config: &RetrievalConfig) -> Self {
        let Some(path) = config.index_path.as_deref() else {
            warn!("no knowledge index configured, answers will use no context");
            return Self::empty(config);
        };
        match Self::load(path, config) {
            Ok(index) => index,
            Err(e) => {
                warn!("knowledge index unavailable, continuing without context: {e}");
                Self::empty(config)
            }
        }
    }

    /// Number of indexed passages.
    pub fn len(&self) -> usize {
        self.passages.len()
    }

    /// Whether the index holds no passages.
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Rank passages against `query` synchronously.
    pub fn search(&self, query: &str) -> RetrievalContext {
        let query_terms = term_frequencies(query);
        if query_terms.is_empty() || self.passages.is_empty() {
            return RetrievalContext::empty();
        }
        let query_norm = vector_norm(&query_terms);

        let mut scored: Vec<(f32, &IndexedPassage)> = self
            .passages
            .iter()
            .filter_map(|p| {
                let dot: f32 = query_terms
                    .iter()
                    .filter_map(|(term, q)| p.terms.get(term).map(|d| q * d))
                    .sum();
                let denom = query_norm * p.norm;
                if denom < 1e-12 {
                    return None;
                }
                let score = (dot / denom).clamp(0.0, 1.0);
                (score >= self.min_score && score > 0.0).then_some((score, p))
            })
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(self.top_k);

        debug!(
            query,
            hits = scored.len(),
            best = scored.first().map(|s| s.0).unwrap_or(0.0),
            "knowledge search"
        );

        RetrievalContext {
            passages: scored
                .into_iter()
                .map(|(score, p)| Passage {
                    text: p.text.clone(),
                    score,
                    source: p.source.clone(),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl KnowledgeRetriever for PassageIndex {
    async fn retrieve(&self, query: &str) -> RetrievalContext {
        self.search(query)
    }
}

fn parse_records(content: &str) -> std::result::Result<Vec<PassageRecord>, serde_json::Error> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed);
    }
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(serde_json::from_str)
        .collect()
}

/// Lowercased word tokens of two or more characters.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|t| t.chars().count() > 1)
        .map(str::to_lowercase)
        .collect()
}

fn term_frequencies(text: &str) -> HashMap<String, f32> {
    let mut terms = HashMap::new();
    for token in tokenize(text) {
        *terms.entry(token).or_insert(0.0) += 1.0;
    }
    terms
}

fn vector_norm(terms: &HashMap<String, f32>) -> f32 {
    terms.values().map(|v| v * v).sum::<f32>().sqrt()
}
