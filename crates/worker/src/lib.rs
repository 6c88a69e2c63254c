//! Pipeline stages and background workers for the lead pipeline.
//!
//! - Event store (verbatim raw intake)
//! - Normalizer (source payloads → sessions, enrichment)
//! - Feature engine (scores, segments, per-identity aggregates)
//! - Reconciler (cross-source daily metrics)
//! - Orchestrator (work queue, LLM insights)
//! - Scheduler (worker pool, stale sweep, metrics and ledger mirror)

pub mod classify;
pub mod enrichment;
pub mod event_store;
pub mod features;
pub mod insight;
pub mod ledger;
pub mod normalizer;
pub mod orchestrator;
pub mod pipeline;
pub mod providers;
pub mod reconciler;
pub mod scheduler;

pub use enrichment::{CachedGeoResolver, EnrichmentWorker, GeoResolver, IpApiResolver, NoopGeoResolver};
pub use event_store::EventStore;
pub use features::{FeatureEngine, ScoringConfig};
pub use insight::{InsightConfig, InsightGenerator};
pub use ledger::{mirror_channel, LedgerMirror, LedgerMirrorConfig, LedgerSink};
pub use normalizer::{NormalizeOutcome, Normalizer, NormalizerConfig};
pub use orchestrator::{Orchestrator, QueueConfig, TaskOutcome, TaskRun};
pub use pipeline::{GeoConfig, Pipeline, PipelineBuilder, PipelineConfig, TriggerResult};
pub use providers::{
    Completion, CompletionRequest, LlmProvider, ProviderConfig, ProviderRegistry, RouteConfig,
};
pub use reconciler::{ReconcileOutcome, Reconciler, ReconcilerConfig};
pub use scheduler::*;
