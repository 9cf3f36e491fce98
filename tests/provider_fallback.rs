//! Generation provider fallback against mock HTTP servers.
//!
//! These tests exercise the real reqwest clients with wiremock:
//! - status mapping (credential rejection vs. quota vs. backend error)
//! - ordered fallback between Gemini and OpenAI
//! - session-scoped skipping of rejected credentials

use concierge::KioskConfig;
use concierge::config::{GenerationConfig, ProviderKind, RemoteModelConfig};
use concierge::llm::{
    GeminiProvider, GenerationError, GenerationProvider, GenerationRequest, OpenAiProvider,
    ProviderError, ResponseGenerator,
};
use concierge::session::{CredentialCache, CredentialStatus};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request() -> GenerationRequest {
    GenerationRequest {
        system_prompt: "You are a virtual hotel concierge.".into(),
        history: Vec::new(),
        user_message: "what time does the pool close".into(),
        max_tokens: 150,
        temperature: 0.7,
    }
}

fn openai_completion(text: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": "stop"
        }]
    })
}

fn gemini_completion(text: &str) -> serde_json::Value {
    json!({
        "candidates": [{
            "content": { "role": "model", "parts": [{ "text": text }] },
            "finishReason": "STOP"
        }]
    })
}

fn remote(server: &MockServer, model: &str) -> RemoteModelConfig {
    RemoteModelConfig {
        api_key: Some("test-key".into()),
        model: model.into(),
        base_url: server.uri(),
        timeout_ms: 2_000,
    }
}

#[tokio::test]
async fn openai_success_parses_first_choice() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_completion("La piscina cierra a las 22:00.")))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("sk-test", "gpt-4o-mini", &server.uri(), 2_000);
    let text = provider.generate(&request()).await.unwrap();
    assert_eq!(text, "La piscina cierra a las 22:00.");
}

#[tokio::test]
async fn openai_status_codes_map_to_provider_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "message": "Rate limit reached", "type": "requests" }
        })))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("sk-test", "gpt-4o-mini", &server.uri(), 2_000);
    let err = provider.generate(&request()).await.unwrap_err();
    assert!(matches!(err, ProviderError::QuotaExhausted(ref m) if m.contains("Rate limit")));
    assert!(!err.invalidates_credential());
}

#[tokio::test]
async fn gemini_sends_key_header_and_joins_parts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-1.5-flash:generateContent"))
        .and(header("x-goog-api-key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": "The pool " }, { "text": "closes at 10pm" }] }
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = GeminiProvider::from_config(&remote(&server, "gemini-1.5-flash")).unwrap();
    let text = provider.generate(&request()).await.unwrap();
    assert_eq!(text, "The pool closes at 10pm");
}

#[tokio::test]
async fn rejected_primary_falls_back_and_is_skipped_next_turn() {
    let gemini = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-1.5-flash:generateContent"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "code": 400,
                "message": "API key not valid. Please pass a valid API key.",
                "status": "INVALID_ARGUMENT",
                "details": [{ "reason": "API_KEY_INVALID" }]
            }
        })))
        .expect(1)
        .mount(&gemini)
        .await;

    let openai = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_completion("The pool closes at 10pm")))
        .expect(2)
        .mount(&openai)
        .await;

    let config = GenerationConfig {
        providers: vec![ProviderKind::Gemini, ProviderKind::OpenAi],
        gemini: remote(&gemini, "gemini-1.5-flash"),
        openai: remote(&openai, "gpt-4o-mini"),
        ..GenerationConfig::default()
    };
    let generator = ResponseGenerator::from_config(&config);
    let mut credentials = CredentialCache::default();

    let first = generator.generate(&request(), &mut credentials).await.unwrap();
    assert_eq!(first.text, "The pool closes at 10pm");
    assert_eq!(first.provider, "openai");
    assert_eq!(credentials.status("gemini"), CredentialStatus::Invalid);
    assert_eq!(credentials.status("openai"), CredentialStatus::Valid);

    let second = generator.generate(&request(), &mut credentials).await.unwrap();
    assert_eq!(second.provider, "openai");
    // `expect(1)` on the Gemini mock is verified when the server drops.
}

#[tokio::test]
async fn quota_errors_do_not_disable_a_provider() {
    let gemini = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-1.5-flash:generateContent"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "code": 429, "message": "Resource has been exhausted" }
        })))
        .expect(2)
        .mount(&gemini)
        .await;

    let openai = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_completion("ok")))
        .mount(&openai)
        .await;

    let config = GenerationConfig {
        gemini: remote(&gemini, "gemini-1.5-flash"),
        openai: remote(&openai, "gpt-4o-mini"),
        ..GenerationConfig::default()
    };
    let generator = ResponseGenerator::from_config(&config);
    let mut credentials = CredentialCache::default();

    for _ in 0..2 {
        let reply = generator.generate(&request(), &mut credentials).await.unwrap();
        assert_eq!(reply.provider, "openai");
    }
    assert_eq!(credentials.status("gemini"), CredentialStatus::Unknown);
}

#[tokio::test]
async fn every_provider_failing_is_a_generation_error() {
    let gemini = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&gemini)
        .await;
    let openai = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "Incorrect API key provided" }
        })))
        .mount(&openai)
        .await;

    let config = GenerationConfig {
        gemini: remote(&gemini, "gemini-1.5-flash"),
        openai: remote(&openai, "gpt-4o-mini"),
        ..GenerationConfig::default()
    };
    let generator = ResponseGenerator::from_config(&config);
    let mut credentials = CredentialCache::default();

    let err = generator.generate(&request(), &mut credentials).await.unwrap_err();
    match err {
        GenerationError::AllProvidersFailed { failures } => {
            let names: Vec<_> = failures.iter().map(|(n, _)| n.as_str()).collect();
            assert_eq!(names, vec!["gemini", "openai"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(credentials.invalid_providers(), vec!["openai"]);
}

#[tokio::test]
async fn provider_listed_twice_is_attempted_once_per_turn() {
    let openai = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .expect(1)
        .mount(&openai)
        .await;

    let mut config = KioskConfig::default();
    config.generation.openai = remote(&openai, "gpt-4o-mini");
    config
        .apply_env_from([("LLM_PROVIDERS", "openai,openai")])
        .unwrap();
    let generator = ResponseGenerator::from_config(&config.generation);
    let mut credentials = CredentialCache::default();

    let err = generator.generate(&request(), &mut credentials).await.unwrap_err();
    match err {
        GenerationError::AllProvidersFailed { failures } => assert_eq!(failures.len(), 1),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unreachable_provider_is_a_network_error() {
    // Nothing listens on port 9 in the test environment.
    let provider = OpenAiProvider::new("sk", "gpt-4o-mini", "http://127.0.0.1:9", 500);
    let err = provider.generate(&request()).await.unwrap_err();
    assert!(matches!(err, ProviderError::Network(_)));
}

#[tokio::test]
async fn gemini_completion_helper_matches_parser() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_completion("hola")))
        .mount(&server)
        .await;
    let provider = GeminiProvider::new("k", "gemini-1.5-flash", &server.uri(), 2_000);
    assert_eq!(provider.generate(&request()).await.unwrap(), "hola");
}
