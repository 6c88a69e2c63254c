//! Mock implementations for testing.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pipeline_core::{Error, Geo, ProviderErrorCode, Result};
use worker::{Completion, CompletionRequest, GeoResolver, LlmProvider};

/// One scripted provider answer.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(ProviderErrorCode),
}

/// LLM provider that answers from a script.
///
/// Replies are consumed in order; the last one repeats once the script runs
/// out. Every prompt is captured for inspection.
pub struct ScriptedProvider {
    name: String,
    credentials: bool,
    script: Mutex<VecDeque<Reply>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicU32,
}

impl ScriptedProvider {
    pub fn new(name: &str, replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            credentials: true,
            script: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        })
    }

    /// Always answers with `text`.
    pub fn replying(name: &str, text: impl Into<String>) -> Arc<Self> {
        Self::new(name, vec![Reply::Text(text.into())])
    }

    /// Always fails with a request error.
    pub fn failing(name: &str) -> Arc<Self> {
        Self::new(name, vec![Reply::Fail(ProviderErrorCode::RequestFailed)])
    }

    /// Configured without an API key; must never be called.
    pub fn without_credentials(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            credentials: false,
            script: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    fn next_reply(&self) -> Option<Reply> {
        let mut script = self.script.lock();
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    fn has_credentials(&self) -> bool {
        self.credentials
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(request.prompt.clone());

        match self.next_reply() {
            Some(Reply::Text(text)) => Ok(Completion {
                text,
                model: "scripted-1".to_string(),
                prompt_tokens: Some(120),
                completion_tokens: Some(80),
            }),
            Some(Reply::Fail(code)) => Err(Error::provider(code, &self.name, "scripted failure")),
            None => Err(Error::provider(
                ProviderErrorCode::RequestFailed,
                &self.name,
                "script is empty",
            )),
        }
    }
}

/// Geo resolver that knows one answer for every public address.
pub struct StaticGeoResolver {
    geo: Geo,
    lookups: AtomicU32,
}

impl StaticGeoResolver {
    pub fn new(country: &str, city: &str) -> Arc<Self> {
        Arc::new(Self {
            geo: Geo {
                country: Some(country.to_string()),
                region: None,
                city: Some(city.to_string()),
            },
            lookups: AtomicU32::new(0),
        })
    }

    pub fn lookups(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeoResolver for StaticGeoResolver {
    async fn resolve(&self, _ip: IpAddr) -> Result<Option<Geo>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(Some(self.geo.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CompletionRequest {
        CompletionRequest {
            system: "system".into(),
            prompt: "prompt".into(),
            max_tokens: 100,
        }
    }

    #[tokio::test]
    async fn test_script_repeats_last_reply() {
        let provider = ScriptedProvider::new(
            "scripted",
            vec![
                Reply::Fail(ProviderErrorCode::Timeout),
                Reply::Text("{}".into()),
            ],
        );

        let err = provider.complete(&request()).await.unwrap_err();
        assert_eq!(err.error_code(), Some("LLM_003"));
        assert_eq!(provider.complete(&request()).await.unwrap().text, "{}");
        assert_eq!(provider.complete(&request()).await.unwrap().text, "{}");
        assert_eq!(provider.calls(), 3);
        assert_eq!(provider.prompts().len(), 3);
    }
}
