//! Ordered provider fallback for reply generation.
//!
//! [`ResponseGenerator`] holds providers in preference order and makes at
//! most one attempt per provider per turn. A provider whose credential was
//! rejected earlier in the session is skipped without a request.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use concierge::llm::{GenerationProvider, GenerationRequest, ProviderError, ResponseGenerator};
//! use concierge::session::CredentialCache;
//!
//! struct Canned(&'static str);
//!
//! #[async_trait]
//! impl GenerationProvider for Canned {
//!     fn name(&self) -> &str {
//!         "canned"
//!     }
//!     async fn generate(&self, _request: &GenerationRequest) -> Result<String, ProviderError> {
//!         Ok(self.0.to_owned())
//!     }
//! }
//!
//! # tokio_test_block(async {
//! let generator = ResponseGenerator::new(vec![Box::new(Canned("The pool closes at 10pm"))]);
//! let mut credentials = CredentialCache::default();
//! let request = GenerationRequest {
//!     system_prompt: String::new(),
//!     history: Vec::new(),
//!     user_message: "what time does the pool close".into(),
//!     max_tokens: 64,
//!     temperature: 0.2,
//! };
//! let reply = generator.generate(&request, &mut credentials).await.unwrap();
//! assert_eq!(reply.provider, "canned");
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use crate::config::{GenerationConfig, ProviderKind};
use crate::llm::{GeminiProvider, GenerationError, GenerationProvider, GenerationRequest, OpenAiProvider};
use crate::session::CredentialCache;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// A reply and the provider that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedReply {
    /// Reply text.
    pub text: String,
    /// Name of the answering provider.
    pub provider: String,
    /// Time spent in the answering provider.
    pub elapsed: Duration,
}

/// Tries generation providers in order until one answers.
pub struct ResponseGenerator {
    providers: Vec<Box<dyn GenerationProvider>>,
}

impl ResponseGenerator {
    /// Create a generator; the first provider is preferred.
    pub fn new(providers: Vec<Box<dyn GenerationProvider>>) -> Self {
        Self { providers }
    }

    /// Build the configured providers in preference order.
    ///
    /// Providers without a credential are left out with a warning; the
    /// result may be empty. A provider listed twice is only tried once.
    pub fn from_config(config: &GenerationConfig) -> Self {
        let mut providers: Vec<Box<dyn GenerationProvider>> = Vec::new();
        for (i, kind) in config.providers.iter().enumerate() {
            if config.providers[..i].contains(kind) {
                warn!(provider = kind.as_str(), "provider listed more than once, ignoring repeat");
                continue;
            }
            let provider: Option<Box<dyn GenerationProvider>> = match kind {
                ProviderKind::Gemini => GeminiProvider::from_config(&config.gemini)
                    .map(|p| Box::new(p) as Box<dyn GenerationProvider>),
                ProviderKind::OpenAi => OpenAiProvider::from_config(&config.openai)
                    .map(|p| Box::new(p) as Box<dyn GenerationProvider>),
            };
            match provider {
                Some(p) => {
                    info!(provider = p.name(), "generation provider enabled");
                    providers.push(p);
                }
                None => warn!(provider = kind.as_str(), "no credential configured, provider disabled"),
            }
        }
        Self::new(providers)
    }

    /// Provider names in preference order.
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Number of providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether there are no providers at all.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Produce a reply from the first provider that succeeds.
    ///
    /// Credential rejections are recorded in `credentials` so later turns
    /// skip that provider. Empty replies count as failures.
    ///
    /// # Errors
    ///
    /// Returns [`GenerationError`] only when every provider failed or was
    /// skipped.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        credentials: &mut CredentialCache,
    ) -> Result<GeneratedReply, GenerationError> {
        if self.providers.is_empty() {
            return Err(GenerationError::NoProviders);
        }

        let mut failures = Vec::new();
        for provider in &self.providers {
            let name = provider.name();
            if credentials.is_invalid(name) {
                info!(provider = name, "skipping provider with rejected credential");
                failures.push((name.to_owned(), "credential rejected earlier".to_owned()));
                continue;
            }

            let started = Instant::now();
            match provider.generate(request).await {
                Ok(text) if !text.trim().is_empty() => {
                    credentials.mark_valid(name);
                    let elapsed = started.elapsed();
                    info!(
                        provider = name,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "provider request succeeded"
                    );
                    return Ok(GeneratedReply {
                        text: text.trim().to_owned(),
                        provider: name.to_owned(),
                        elapsed,
                    });
                }
                Ok(_) => {
                    warn!(provider = name, "provider returned an empty reply");
                    failures.push((name.to_owned(), "empty reply".to_owned()));
                }
                Err(e) => {
                    if e.invalidates_credential() {
                        credentials.mark_invalid(name);
                    }
                    warn!(
                        provider = name,
                        error = %e,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "provider failed, trying next"
                    );
                    failures.push((name.to_owned(), e.to_string()));
                }
            }
        }

        Err(GenerationError::AllProvidersFailed { failures })
    }
}
