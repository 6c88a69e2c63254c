//! LLM provider clients and per-layer routing.

mod anthropic;
mod openai;
pub mod registry;

use async_trait::async_trait;
use pipeline_core::{Error, ProviderErrorCode, Result};
use serde::{Deserialize, Serialize};

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;
pub use registry::{ProviderConfig, ProviderKind, ProviderRegistry, RouteConfig, RoutedCompletion};

/// One prompt sent to a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
}

/// Text and token usage returned by a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

impl Completion {
    pub fn total_tokens(&self) -> u64 {
        u64::from(self.prompt_tokens.unwrap_or(0)) + u64::from(self.completion_tokens.unwrap_or(0))
    }
}

/// A chat-completion backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Name used in routes, logs and stored insights.
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    /// False when no API key is configured; the registry skips such providers.
    fn has_credentials(&self) -> bool;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

/// Map a transport error to a provider error code.
pub(crate) fn request_error(provider: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::provider(ProviderErrorCode::Timeout, provider, err.to_string())
    } else if err.is_decode() {
        Error::provider(ProviderErrorCode::InvalidResponse, provider, err.to_string())
    } else {
        Error::provider(ProviderErrorCode::RequestFailed, provider, err.to_string())
    }
}

/// Turn a non-success HTTP response into a provider error.
pub(crate) async fn status_error(provider: &str, response: reqwest::Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(512).collect();
    Error::provider(
        ProviderErrorCode::RequestFailed,
        provider,
        format!("HTTP {}: {}", status.as_u16(), body),
    )
}

pub(crate) fn missing_credentials(provider: &str) -> Error {
    Error::provider(
        ProviderErrorCode::MissingCredentials,
        provider,
        "no API key configured",
    )
}
