//! Provider registry: per-layer routing, fallbacks and concurrency limits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pipeline_core::{Error, Layer, ProviderErrorCode, Result};
use serde::{Deserialize, Serialize};
use telemetry::{health, metrics};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use validator::Validate;

use super::{AnthropicProvider, Completion, CompletionRequest, LlmProvider, OpenAiProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Any OpenAI-compatible chat completions endpoint
    OpenAi,
    Anthropic,
}

/// One configured provider.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProviderConfig {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    pub kind: ProviderKind,
    #[validate(length(min = 1))]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Inline key; the environment variable wins when both are set
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    #[validate(range(min = 1, max = 600))]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrency")]
    #[validate(range(min = 1, max = 64))]
    pub max_concurrency: usize,
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_concurrency() -> usize {
    2
}

impl ProviderConfig {
    fn resolve_api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty())
            .or_else(|| self.api_key.clone())
    }

    pub fn build(&self) -> Result<Arc<dyn LlmProvider>> {
        self.validate()
            .map_err(|e| Error::config(format!("provider {}: {e}", self.name)))?;
        let timeout = Duration::from_secs(self.timeout_secs);
        let provider: Arc<dyn LlmProvider> = match self.kind {
            ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(
                &self.name,
                &self.model,
                self.base_url.clone(),
                self.resolve_api_key(),
                timeout,
            )?),
            ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(
                &self.name,
                &self.model,
                self.base_url.clone(),
                self.resolve_api_key(),
                timeout,
            )?),
        };
        Ok(provider)
    }
}

/// Preferred provider and ordered fallbacks for one layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub layer: Layer,
    pub preferred: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

/// A completion together with the provider that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedCompletion {
    pub provider: String,
    pub completion: Completion,
}

struct Entry {
    provider: Arc<dyn LlmProvider>,
    permits: Arc<Semaphore>,
}

/// Registered providers and layer routes.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    entries: Arc<HashMap<String, Entry>>,
    routes: Arc<HashMap<Layer, Vec<String>>>,
}

impl ProviderRegistry {
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    /// Build from configuration. Routes must name registered providers.
    pub fn from_config(providers: &[ProviderConfig], routes: &[RouteConfig]) -> Result<Self> {
        let mut builder = Self::builder();
        for config in providers {
            builder = builder.provider(config.build()?, config.max_concurrency);
        }
        for route in routes {
            builder = builder.route(route.layer, &route.preferred, &route.fallbacks);
        }
        builder.build()
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Provider names tried for a layer, in order.
    pub fn chain(&self, layer: Layer) -> &[String] {
        self.routes.get(&layer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Try the layer's providers in order until one returns a completion.
    pub async fn complete_for_layer(
        &self,
        layer: Layer,
        request: &CompletionRequest,
    ) -> Result<RoutedCompletion> {
        self.complete_with(layer, request, |_| Ok(()))
            .await
            .map(|(routed, ())| routed)
    }

    /// Like [`complete_for_layer`](Self::complete_for_layer), but a completion
    /// only counts once `parse` accepts it.
    ///
    /// Providers without credentials are skipped. Any call error, including
    /// timeouts and output `parse` rejects, moves on to the next provider.
    pub async fn complete_with<T, F>(
        &self,
        layer: Layer,
        request: &CompletionRequest,
        parse: F,
    ) -> Result<(RoutedCompletion, T)>
    where
        F: Fn(&Completion) -> Result<T> + Send + Sync,
        T: Send,
    {
        let chain = self.chain(layer);
        if chain.is_empty() {
            return Err(Error::provider(
                ProviderErrorCode::Exhausted,
                layer.as_str(),
                "no providers routed for layer",
            ));
        }

        let mut failures = Vec::with_capacity(chain.len());
        for name in chain {
            let Some(entry) = self.entries.get(name) else {
                continue;
            };
            let provider = &entry.provider;
            if !provider.has_credentials() {
                debug!(provider = %name, layer = %layer.as_str(), "Skipping provider without credentials");
                failures.push(format!("{name}: missing credentials"));
                continue;
            }

            let result = {
                let _permit = entry
                    .permits
                    .acquire()
                    .await
                    .map_err(|e| Error::internal(format!("provider semaphore closed: {e}")))?;

                metrics().provider_calls.inc();
                let start = Instant::now();
                let result = provider.complete(request).await;
                metrics()
                    .provider_latency_ms
                    .observe(start.elapsed().as_millis() as u64);
                result
            };

            let parsed = result.and_then(|completion| {
                metrics().tokens_used.inc_by(completion.total_tokens());
                let value = parse(&completion)?;
                Ok((completion, value))
            });

            match parsed {
                Ok((completion, value)) => {
                    info!(
                        provider = %name,
                        model = %completion.model,
                        layer = %layer.as_str(),
                        prompt_tokens = ?completion.prompt_tokens,
                        completion_tokens = ?completion.completion_tokens,
                        "Provider call succeeded"
                    );
                    let routed = RoutedCompletion {
                        provider: name.clone(),
                        completion,
                    };
                    return Ok((routed, value));
                }
                Err(e) => {
                    metrics().provider_errors.inc();
                    warn!(provider = %name, layer = %layer.as_str(), error = %e, "Provider call failed, trying next");
                    failures.push(format!("{name}: {e}"));
                }
            }
        }

        Err(Error::provider(
            ProviderErrorCode::Exhausted,
            layer.as_str(),
            format!("all providers failed: {}", failures.join("; ")),
        ))
    }
}

#[derive(Default)]
pub struct ProviderRegistryBuilder {
    entries: HashMap<String, Entry>,
    routes: HashMap<Layer, Vec<String>>,
}

impl ProviderRegistryBuilder {
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>, max_concurrency: usize) -> Self {
        let name = provider.name().to_string();
        self.entries.insert(
            name,
            Entry {
                provider,
                permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            },
        );
        self
    }

    pub fn route(mut self, layer: Layer, preferred: &str, fallbacks: &[String]) -> Self {
        let chain = std::iter::once(preferred.to_string())
            .chain(fallbacks.iter().cloned())
            .collect();
        self.routes.insert(layer, chain);
        self
    }

    pub fn build(self) -> Result<ProviderRegistry> {
        for (layer, chain) in &self.routes {
            if let Some(unknown) = chain.iter().find(|name| !self.entries.contains_key(*name)) {
                return Err(Error::config(format!(
                    "route for layer {} names unknown provider {unknown}",
                    layer.as_str()
                )));
            }
        }

        if self.entries.values().any(|e| e.provider.has_credentials()) {
            health().providers.set_healthy();
        } else {
            health().providers.set_unhealthy("no provider has credentials");
        }

        Ok(ProviderRegistry {
            entries: Arc::new(self.entries),
            routes: Arc::new(self.routes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fake {
        name: &'static str,
        credentials: bool,
        fail: bool,
        calls: AtomicU32,
    }

    impl Fake {
        fn new(name: &'static str, credentials: bool, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                credentials,
                fail,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for Fake {
        fn name(&self) -> &str {
            self.name
        }

        fn model(&self) -> &str {
            "fake-model"
        }

        fn has_credentials(&self) -> bool {
            self.credentials
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::provider(ProviderErrorCode::Timeout, self.name, "timed out"));
            }
            Ok(Completion {
                text: "{}".into(),
                model: "fake-model".into(),
                prompt_tokens: Some(10),
                completion_tokens: Some(5),
            })
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            system: "s".into(),
            prompt: "p".into(),
            max_tokens: 100,
        }
    }

    #[tokio::test]
    async fn test_missing_credentials_falls_back() {
        let primary = Fake::new("primary", false, false);
        let backup = Fake::new("backup", true, false);
        let registry = ProviderRegistry::builder()
            .provider(primary.clone(), 1)
            .provider(backup.clone(), 1)
            .route(Layer::Unified, "primary", &["backup".to_string()])
            .build()
            .unwrap();

        let routed = registry.complete_for_layer(Layer::Unified, &request()).await.unwrap();
        assert_eq!(routed.provider, "backup");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_error_falls_back() {
        let primary = Fake::new("primary", true, true);
        let backup = Fake::new("backup", true, false);
        let registry = ProviderRegistry::builder()
            .provider(primary.clone(), 1)
            .provider(backup, 1)
            .route(Layer::Unified, "primary", &["backup".to_string()])
            .build()
            .unwrap();

        let routed = registry.complete_for_layer(Layer::Unified, &request()).await.unwrap();
        assert_eq!(routed.provider, "backup");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_output_falls_back() {
        let primary = Fake::new("primary", true, false);
        let backup = Fake::new("backup", true, false);
        let registry = ProviderRegistry::builder()
            .provider(primary.clone(), 1)
            .provider(backup.clone(), 1)
            .route(Layer::Unified, "primary", &["backup".to_string()])
            .build()
            .unwrap();

        let calls = AtomicU32::new(0);
        let (routed, attempt) = registry
            .complete_with(Layer::Unified, &request(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(Error::provider(ProviderErrorCode::InvalidResponse, "primary", "not json"))
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();
        assert_eq!(routed.provider, "backup");
        assert_eq!(attempt, 1);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_failing_is_exhausted() {
        let registry = ProviderRegistry::builder()
            .provider(Fake::new("a", true, true), 1)
            .provider(Fake::new("b", false, false), 1)
            .route(Layer::Unified, "a", &["b".to_string()])
            .build()
            .unwrap();

        let err = registry
            .complete_for_layer(Layer::Unified, &request())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), Some("LLM_005"));
        assert!(err.to_string().contains("timed out"));
        assert!(err.to_string().contains("b: missing credentials"));
    }

    #[tokio::test]
    async fn test_unrouted_layer_is_exhausted() {
        let registry = ProviderRegistry::builder().build().unwrap();
        let err = registry
            .complete_for_layer(Layer::Feature, &request())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), Some("LLM_005"));
    }

    #[test]
    fn test_route_to_unknown_provider_rejected() {
        let result = ProviderRegistry::builder()
            .route(Layer::Unified, "ghost", &[])
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_env_key_wins() {
        std::env::set_var("REGISTRY_TEST_KEY", "from-env");
        let config = ProviderConfig {
            name: "openai".into(),
            kind: ProviderKind::OpenAi,
            model: "m".into(),
            base_url: None,
            api_key_env: Some("REGISTRY_TEST_KEY".into()),
            api_key: Some("inline".into()),
            timeout_secs: 5,
            max_concurrency: 1,
        };
        assert_eq!(config.resolve_api_key().as_deref(), Some("from-env"));
        assert!(config.build().unwrap().has_credentials());
    }
}
