//! Google Gemini `generateContent` provider.

use crate::config::RemoteModelConfig;
use crate::llm::{GenerationProvider, GenerationRequest, ProviderError, Role, extract_error_message};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Generation via `POST {base_url}/v1beta/models/{model}:generateContent`.
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

impl GeminiProvider {
    /// Create a provider, or `None` when no API key is configured.
    pub fn from_config(config: &RemoteModelConfig) -> Option<Self> {
        let api_key = config.credential()?;
        Some(Self::new(api_key, &config.model, &config.base_url, config.timeout_ms))
    }

    /// Create a provider with explicit settings.
    pub fn new(api_key: &str, model: &str, base_url: &str, timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.to_owned(),
            model: model.to_owned(),
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    fn build_body(request: &GenerationRequest) -> serde_json::Value {
        let mut contents: Vec<serde_json::Value> = request
            .history
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                };
                serde_json::json!({ "role": role, "parts": [{ "text": msg.content }] })
            })
            .collect();
        contents.push(serde_json::json!({
            "role": "user",
            "parts": [{ "text": request.user_message }],
        }));

        serde_json::json!({
            "systemInstruction": { "parts": [{ "text": request.system_prompt }] },
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": request.max_tokens,
                "temperature": request.temperature,
            },
        })
    }

    /// Gemini reports a bad key as HTTP 400 `API_KEY_INVALID`, not 401.
    fn map_http_error(&self, status: reqwest::StatusCode, body: &str) -> ProviderError {
        let message = extract_error_message(body);
        if status == reqwest::StatusCode::BAD_REQUEST
            && (body.contains("API_KEY_INVALID") || message.contains("API key not valid"))
        {
            return ProviderError::CredentialRejected(format!("gemini HTTP 400: {message}"));
        }
        ProviderError::from_status(self.name(), status, &message)
    }
}

#[async_trait]
impl GenerationProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&Self::build_body(request))
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(self.name(), &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.map_http_error(status, &body));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Backend(format!("gemini response unreadable: {e}")))?;

        if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(ProviderError::Backend(format!("gemini blocked the prompt: {reason}")));
        }

        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ProviderError::Backend("gemini response had no text".into()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::llm::ChatMessage;

    #[test]
    fn body_maps_assistant_to_model_role() {
        let body = GeminiProvider::build_body(&GenerationRequest {
            system_prompt: "sys".into(),
            history: vec![ChatMessage::user("u1"), ChatMessage::assistant("a1")],
            user_message: "now".into(),
            max_tokens: 80,
            temperature: 0.3,
        });
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][2]["parts"][0]["text"], "now");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 80);
    }

    #[test]
    fn invalid_key_400_is_credential_rejection() {
        let provider = GeminiProvider::new("k", "gemini-1.5-flash", "http://x", 1_000);
        let body = r#"{"error":{"code":400,"message":"API key not valid. Please pass a valid API key.","status":"INVALID_ARGUMENT","details":[{"reason":"API_KEY_INVALID"}]}}"#;
        let err = provider.map_http_error(reqwest::StatusCode::BAD_REQUEST, body);
        assert!(err.invalidates_credential());
    }

    #[test]
    fn other_400_is_backend_error() {
        let provider = GeminiProvider::new("k", "gemini-1.5-flash", "http://x", 1_000);
        let err = provider.map_http_error(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"contents is empty"}}"#,
        );
        assert!(matches!(err, ProviderError::Backend(_)));
    }
}
