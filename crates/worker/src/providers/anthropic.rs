//! Anthropic messages API client.

use std::time::Duration;

use async_trait::async_trait;
use pipeline_core::{Error, ProviderErrorCode, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{missing_credentials, request_error, status_error, Completion, CompletionRequest, LlmProvider};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: [Message<'a>; 1],
    max_tokens: u32,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

pub struct AnthropicProvider {
    name: String,
    model: String,
    base_url: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl AnthropicProvider {
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
impl LlmProvider for AnthropicProvider {
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

        let body = MessagesRequest {
            model: &self.model,
            system: &request.system,
            messages: [Message {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: request.max_tokens,
        };

        debug!(provider = %self.name, model = %self.model, "Sending messages request");

        let response = self
            .http_client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
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
    let parsed: MessagesResponse = serde_json::from_str(body).map_err(|e| {
        Error::provider(ProviderErrorCode::InvalidResponse, provider, e.to_string())
    })?;

    let text: String = parsed
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text.as_deref())
        .collect();
    if text.trim().is_empty() {
        return Err(Error::provider(
            ProviderErrorCode::InvalidResponse,
            provider,
            "no text content",
        ));
    }

    Ok(Completion {
        text,
        model: parsed.model.unwrap_or_else(|| model.to_string()),
        prompt_tokens: parsed.usage.as_ref().and_then(|u| u.input_tokens),
        completion_tokens: parsed.usage.as_ref().and_then(|u| u.output_tokens),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_joins_text_blocks() {
        let body = r#"{
            "model": "claude-x",
            "content": [
                {"type": "text", "text": "{\"executive_summary\":"},
                {"type": "text", "text": "\"ok\"}"}
            ],
            "usage": {"input_tokens": 300, "output_tokens": 90}
        }"#;
        let completion = parse_response("anthropic", "m", body).unwrap();
        assert_eq!(completion.text, r#"{"executive_summary":"ok"}"#);
        assert_eq!(completion.model, "claude-x");
        assert_eq!(completion.completion_tokens, Some(90));
    }

    #[test]
    fn test_no_text_is_invalid() {
        let err = parse_response("anthropic", "m", r#"{"content": []}"#).unwrap_err();
        assert_eq!(err.error_code(), Some("LLM_004"));
    }
}
