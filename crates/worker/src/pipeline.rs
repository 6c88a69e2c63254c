//! Control surface over the pipeline stages.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use pipeline_core::{
    DateRange, Error, HotLead, Insight, NewTask, ProcessingStatus, QueueStatus, QueueTask,
    RangeStatus, RawEvent, RequestMetadata, Result, TaskType,
};
use serde::{Deserialize, Serialize};
use store::Store;
use telemetry::metrics;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::enrichment::{CachedGeoResolver, GeoResolver, IpApiResolver};
use crate::event_store::EventStore;
use crate::features::{FeatureEngine, ScoringConfig};
use crate::insight::{InsightConfig, InsightGenerator};
use crate::ledger::LedgerSink;
use crate::normalizer::{Normalizer, NormalizerConfig};
use crate::orchestrator::{run_params, Orchestrator, QueueConfig};
use crate::providers::{ProviderConfig, ProviderRegistry, RouteConfig};
use crate::reconciler::{Reconciler, ReconcilerConfig};

const MAX_INSIGHTS_LIMIT: u32 = 100;
const MAX_HOT_LEADS_LIMIT: u32 = 500;

/// Geo lookup service used when `normalizer.geo_lookup` is on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoConfig {
    #[serde(default = "default_geo_url")]
    pub base_url: String,
    #[serde(default = "default_geo_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_geo_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_geo_url() -> String {
    "http://ip-api.com".to_string()
}

fn default_geo_timeout_ms() -> u64 {
    2_000
}

fn default_geo_cache_ttl_secs() -> u64 {
    24 * 3600
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            base_url: default_geo_url(),
            timeout_ms: default_geo_timeout_ms(),
            cache_ttl_secs: default_geo_cache_ttl_secs(),
        }
    }
}

/// Stage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub geo: GeoConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub insight: InsightConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.queue
            .validate()
            .map_err(|e| Error::config(format!("queue: {e}")))?;
        self.insight
            .validate()
            .map_err(|e| Error::config(format!("insight: {e}")))?;
        self.scoring.check()?;
        if self.normalizer.batch_size == 0 {
            return Err(Error::config("normalizer.batch_size must be positive"));
        }
        Ok(())
    }
}

/// Tasks enqueued by one trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerResult {
    pub run_id: Uuid,
    pub date_range: DateRange,
    pub status: RangeStatus,
    pub raw_events: usize,
    pub task_ids: Vec<Uuid>,
}

pub struct PipelineBuilder {
    store: Store,
    config: PipelineConfig,
    ledger: Option<LedgerSink>,
    geo: Option<Arc<dyn GeoResolver>>,
    registry: Option<ProviderRegistry>,
}

impl PipelineBuilder {
    pub fn ledger(mut self, ledger: LedgerSink) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn geo_resolver(mut self, geo: Arc<dyn GeoResolver>) -> Self {
        self.geo = Some(geo);
        self
    }

    /// Use a prebuilt registry instead of `config.providers`.
    pub fn registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let config = self.config;
        config.validate()?;

        let store = self.store;
        let ledger = self.ledger.unwrap_or_else(|| LedgerSink::new(store.clone()));

        let registry = match self.registry {
            Some(registry) => registry,
            None => ProviderRegistry::from_config(&config.providers, &config.routes)?,
        };

        let mut normalizer = Normalizer::new(store.clone(), ledger.clone(), config.normalizer.clone());
        let geo = match self.geo {
            Some(geo) => Some(geo),
            None if config.normalizer.geo_lookup => {
                let upstream = IpApiResolver::new(
                    config.geo.base_url.clone(),
                    Duration::from_millis(config.geo.timeout_ms),
                )?;
                Some(Arc::new(CachedGeoResolver::with_ttl(
                    Arc::new(upstream),
                    Duration::from_secs(config.geo.cache_ttl_secs),
                )) as Arc<dyn GeoResolver>)
            }
            None => None,
        };
        if let Some(geo) = geo {
            normalizer = normalizer.with_geo_resolver(geo);
        }

        let features = FeatureEngine::new(store.clone(), ledger.clone(), config.scoring.clone())?;
        let reconciler = Reconciler::new(store.clone(), ledger.clone(), config.reconciler.clone());
        let insights = InsightGenerator::new(
            store.clone(),
            ledger.clone(),
            registry,
            config.insight.clone(),
        );
        let orchestrator = Orchestrator::new(
            store.clone(),
            ledger.clone(),
            normalizer,
            features,
            reconciler,
            insights,
            config.queue.clone(),
        );

        Ok(Pipeline {
            events: EventStore::new(store.clone(), ledger),
            store,
            orchestrator,
        })
    }
}

/// Entry point for collaborators: intake, triggers and read models.
#[derive(Clone)]
pub struct Pipeline {
    store: Store,
    events: EventStore,
    orchestrator: Orchestrator,
}

impl Pipeline {
    pub fn builder(store: Store, config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            store,
            config,
            ledger: None,
            geo: None,
            registry: None,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Archive a payload as received.
    pub async fn ingest(
        &self,
        source: &str,
        payload: impl Into<Vec<u8>>,
        request_metadata: RequestMetadata,
        date_range: Option<DateRange>,
    ) -> Result<RawEvent> {
        self.events
            .ingest(source, payload, request_metadata, date_range)
            .await
    }

    /// Enqueue a pipeline run over a date range.
    ///
    /// Pending raw events are normalized in batches and flow forward through
    /// features and reconciliation; analysis follows when `run_insights` is set.
    /// A range that was already fully normalized is reconciled directly.
    pub async fn trigger_pipeline(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
        run_insights: bool,
    ) -> Result<TriggerResult> {
        let range = DateRange::new(date_from, date_to)?;
        let status = self.range_status(range).await?;
        if status == RangeStatus::NoData {
            return Err(Error::no_data(format!("no raw events for {range}")));
        }

        let params = run_params(range, run_insights);
        let run_id = params.run_id.unwrap_or_else(Uuid::new_v4);
        let pending = self.events.pending_in_range(range).await?;
        let mut task_ids = Vec::new();

        if pending.is_empty() {
            let dates = range.dates().iter().map(NaiveDate::to_string).collect();
            let task = self
                .orchestrator
                .task(TaskType::Reconcile, dates)
                .with_params(params)
                .once_per_run();
            task_ids.push(self.orchestrator.enqueue(task).await?.id);
        } else {
            // Every batch fans in to one reconcile, and one analysis, for the run.
            let batch_size = self.orchestrator.normalizer().config().batch_size.max(1) as usize;
            let tasks: Vec<NewTask> = pending
                .chunks(batch_size)
                .map(|chunk| {
                    self.orchestrator
                        .task(TaskType::Normalize, chunk.iter().map(Uuid::to_string).collect())
                        .with_params(params.clone())
                })
                .collect();
            let queued = self.orchestrator.enqueue_all(&tasks).await?;
            task_ids.extend(queued.iter().map(|t| t.id));
        }

        info!(
            run_id = %run_id,
            range = %range,
            raw_events = pending.len(),
            tasks = task_ids.len(),
            run_insights = run_insights,
            "Pipeline triggered"
        );

        Ok(TriggerResult {
            run_id,
            date_range: range,
            status,
            raw_events: pending.len(),
            task_ids,
        })
    }

    pub async fn get_queue_status(&self) -> Result<QueueStatus> {
        let status = self.store.queue_status(Utc::now()).await?;
        metrics().queue_depth.set(status.pending);
        Ok(status)
    }

    pub async fn get_latest_insights(&self, limit: u32) -> Result<Vec<Insight>> {
        self.store
            .latest_insights(limit.clamp(1, MAX_INSIGHTS_LIMIT))
            .await
    }

    /// Identities whose current hot score is at least `min_score`, hottest first.
    pub async fn get_hot_leads(&self, min_score: u8, limit: u32) -> Result<Vec<HotLead>> {
        let aggregates = self
            .store
            .hot_aggregates(min_score, limit.clamp(1, MAX_HOT_LEADS_LIMIT))
            .await?;
        Ok(aggregates.iter().map(HotLead::from).collect())
    }

    /// Distinguish "nothing received" from "received but not yet normalized".
    pub async fn range_status(&self, range: DateRange) -> Result<RangeStatus> {
        let counts = self.events.status_counts_in_range(range).await?;
        if counts.is_empty() {
            return Ok(RangeStatus::NoData);
        }

        let pending: u64 = counts
            .iter()
            .filter(|c| c.status == ProcessingStatus::Pending)
            .map(|c| c.count)
            .sum();
        let normalized = self.store.normalized_ids_in_range(range).await?.len() as u64;

        Ok(if pending > 0 {
            RangeStatus::AwaitingNormalization {
                pending,
                normalized,
            }
        } else {
            RangeStatus::Ready { normalized }
        })
    }

    /// Enqueue a stage again for explicit inputs.
    pub async fn replay(&self, task_type: TaskType, input_ids: Vec<String>) -> Result<QueueTask> {
        if input_ids.is_empty() {
            return Err(Error::validation("replay needs at least one input id"));
        }
        let task = self.orchestrator.task(task_type, input_ids);
        let queued = self.orchestrator.enqueue(task).await?;
        info!(task_id = %queued.id, task_type = %task_type, "Replay enqueued");
        Ok(queued)
    }

    /// Reset failed or skipped raw events to pending.
    pub async fn requeue_raw(&self, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        self.events.requeue(ids).await
    }
}
