//! OpenAI-compatible chat completions client.

use std::time::Duration;

use async_trait::async_trait;
use pipeline_core::{Error, ProviderErrorCode, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{missing_credentials, request_error, status_error, Completion, CompletionRequest, LlmProvider};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [Message<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

pub struct OpenAiProvider {
    name: String,
    model: String,
    base_url: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        base_url: Option<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let name = name.into();
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("{name}: failed to build HTTP client: {e}")))?;

        Ok(Self {
            name,
            model: model.into(),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            http_client,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let api_key = self.api_key.as_deref().ok_or_else(|| missing_credentials(&self.name))?;

        let body = ChatRequest {
            model: &self.model,
            messages: [
                Message {
                    role: "system",
                    content: &request.system,
                },
                Message {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: 0.2,
        };

        debug!(provider = %self.name, model = %self.model, "Sending chat completion");

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(&self.name, e))?;

        if !response.status().is_success() {
            return Err(status_error(&self.name, response).await);
        }

        let text = response.text().await.map_err(|e| request_error(&self.name, e))?;
        parse_response(&self.name, &self.model, &text)
    }
}

fn parse_response(provider: &str, model: &str, body: &str) -> Result<Completion> {
    let parsed: ChatResponse = serde_json::from_str(body).map_err(|e| {
        Error::provider(ProviderErrorCode::InvalidResponse, provider, e.to_string())
    })?;

    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| {
            Error::provider(ProviderErrorCode::InvalidResponse, provider, "empty completion")
        })?;

    Ok(Completion {
        text,
        model: parsed.model.unwrap_or_else(|| model.to_string()),
        prompt_tokens: parsed.usage.as_ref().and_then(|u| u.prompt_tokens),
        completion_tokens: parsed.usage.as_ref().and_then(|u| u.completion_tokens),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response() {
        let body = r#"{
            "model": "gpt-4o-mini-2024",
            "choices": [{"message": {"role": "assistant", "content": "{\"executive_summary\":\"ok\"}"}}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 40}
        }"#;
        let completion = parse_response("openai", "gpt-4o-mini", body).unwrap();
        assert_eq!(completion.model, "gpt-4o-mini-2024");
        assert_eq!(completion.prompt_tokens, Some(120));
        assert_eq!(completion.total_tokens(), 160);
    }

    #[test]
    fn test_empty_choices_is_invalid() {
        let err = parse_response("openai", "m", r#"{"choices": []}"#).unwrap_err();
        assert_eq!(err.error_code(), Some("LLM_004"));

        let err = parse_response("openai", "m", "<html>").unwrap_err();
        assert_eq!(err.error_code(), Some("LLM_004"));
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_request() {
        let provider =
            OpenAiProvider::new("openai", "m", None, Some(String::new()), Duration::from_secs(1)).unwrap();
        assert!(!provider.has_credentials());

        let request = CompletionRequest {
            system: "s".into(),
            prompt: "p".into(),
            max_tokens: 10,
        };
        let err = provider.complete(&request).await.unwrap_err();
        assert_eq!(err.error_code(), Some("LLM_001"));
    }
}
