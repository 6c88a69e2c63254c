//! Common test setup functions.

use std::sync::Arc;

use api::{router, state::AppState};
use axum::Router;
use chrono::NaiveDate;
use pipeline_core::{DateRange, Layer, RawEvent, RequestMetadata, Result};
use store::Store;
use worker::{
    GeoResolver, LlmProvider, Pipeline, PipelineConfig, ProviderRegistry, QueueConfig, TaskRun,
};

/// Test context around a private in-memory store.
///
/// The pipeline and router are the production types; only the LLM
/// providers and geo lookup are replaced. Retries are immediate so a queue
/// drain runs every attempt in one call.
pub struct TestContext {
    pub store: Store,
    pub pipeline: Pipeline,
    pub router: Router,
}

/// Builder for [`TestContext`].
pub struct TestContextBuilder {
    config: PipelineConfig,
    providers: Vec<Arc<dyn LlmProvider>>,
    geo: Option<Arc<dyn GeoResolver>>,
}

impl TestContextBuilder {
    /// Add a provider to the analysis route, in preference order.
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn geo_resolver(mut self, geo: Arc<dyn GeoResolver>) -> Self {
        self.config.normalizer.geo_lookup = true;
        self.geo = Some(geo);
        self
    }

    pub fn config(mut self, update: impl FnOnce(&mut PipelineConfig)) -> Self {
        update(&mut self.config);
        self
    }

    pub async fn build(self) -> TestContext {
        let store = Store::in_memory().await.expect("in-memory store");

        let mut registry = ProviderRegistry::builder();
        let names: Vec<String> = self.providers.iter().map(|p| p.name().to_string()).collect();
        for provider in self.providers {
            registry = registry.provider(provider, 1);
        }
        if let Some((preferred, fallbacks)) = names.split_first() {
            registry = registry.route(Layer::Unified, preferred, fallbacks);
        }
        let registry = registry.build().expect("provider registry");

        let mut builder = Pipeline::builder(store.clone(), self.config).registry(registry);
        if let Some(geo) = self.geo {
            builder = builder.geo_resolver(geo);
        }
        let pipeline = builder.build().expect("pipeline");
        let router = router(AppState::new(pipeline.clone()));

        TestContext {
            store,
            pipeline,
            router,
        }
    }
}

impl TestContext {
    pub fn builder() -> TestContextBuilder {
        TestContextBuilder {
            config: PipelineConfig {
                queue: QueueConfig {
                    retry_backoff_ms: 0,
                    ..Default::default()
                },
                ..Default::default()
            },
            providers: Vec::new(),
            geo: None,
        }
    }

    /// Context with a single analysis provider.
    pub async fn with_provider(provider: Arc<dyn LlmProvider>) -> Self {
        Self::builder().provider(provider).build().await
    }

    /// Archive a payload declared to cover one day.
    pub async fn ingest_for_day(&self, source: &str, payload: String, day: NaiveDate) -> RawEvent {
        self.pipeline
            .ingest(
                source,
                payload,
                RequestMetadata::default(),
                Some(DateRange::day(day)),
            )
            .await
            .expect("ingest")
    }

    /// Run queued tasks until the queue is idle.
    pub async fn drain(&self) -> Result<Vec<TaskRun>> {
        self.pipeline.orchestrator().drain().await
    }
}
