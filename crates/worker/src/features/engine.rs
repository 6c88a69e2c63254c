//! Feature computation and aggregate upsert.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use pipeline_core::{
    DbErrorCode, Error, Feature, Identity, LedgerEntry, NormalizedEvent, Operation, Result,
};
use serde::Serialize;
use serde_json::json;
use store::Store;
use telemetry::metrics;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::aggregate::merge;
use super::config::{KeyPageMatcher, ScoringConfig};
use super::scoring::{score, VisitHistory};
use super::segment::{classify, decision_stage};
use super::signals::extract;
use crate::ledger::LedgerSink;

/// Totals for a batch of normalized events.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureReport {
    pub processed: u32,
    pub failed: u32,
    pub feature_ids: Vec<Uuid>,
    /// Event dates touched by the batch
    pub dates: BTreeSet<NaiveDate>,
}

/// Computes features and keeps per-identity aggregates current.
#[derive(Clone)]
pub struct FeatureEngine {
    store: Store,
    ledger: LedgerSink,
    config: Arc<ScoringConfig>,
    matcher: Arc<KeyPageMatcher>,
}

impl FeatureEngine {
    pub fn new(store: Store, ledger: LedgerSink, config: ScoringConfig) -> Result<Self> {
        config.check()?;
        let matcher = KeyPageMatcher::new(&config.key_pages)?;
        Ok(Self {
            store,
            ledger,
            config: Arc::new(config),
            matcher: Arc::new(matcher),
        })
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Compute the next feature version for a stored normalized event.
    pub async fn compute(&self, normalized_event_id: Uuid) -> Result<Feature> {
        let event = self
            .store
            .get_normalized_event(normalized_event_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("normalized event {normalized_event_id}")))?;
        self.process_event(&event).await
    }

    /// Insert a feature for the event and fold it into the aggregate.
    ///
    /// A first computation writes version 1; later calls write the next version.
    pub async fn process_event(&self, event: &NormalizedEvent) -> Result<Feature> {
        let identity = Identity::resolve(event.user_id.as_deref(), event.client_id.as_deref())?;

        let previous = self.store.latest_feature_for_event(event.id).await?;
        let version = previous.as_ref().map_or(1, |f| f.feature_version + 1);

        let prior = self.store.get_aggregate(&identity).await?;
        let known_sessions = self.store.count_feature_sessions(&identity).await?;
        let previous_sessions = known_sessions.saturating_sub(u64::from(previous.is_some())) as u32;
        // Sessions processed out of order only see visits that precede them.
        let previous_visit_at = prior.as_ref().and_then(|agg| {
            [agg.last_visit_at, agg.first_visit_at]
                .into_iter()
                .find(|visit| *visit < event.occurred_at)
        });
        let history = VisitHistory {
            previous_sessions,
            previous_visit_at,
        };

        let now = Utc::now();
        let signals = extract(event, &self.config, &self.matcher);
        let scores = score(&signals, history, event.occurred_at, now, &self.config);

        for (name, raw) in scores.violations() {
            metrics().score_clamps.inc();
            warn!(
                event_id = %event.id,
                score = name,
                raw = raw,
                "Score outside [0,100], clamped"
            );
        }

        let segment = classify(&signals, &self.config.segments);
        let feature = Feature {
            id: Uuid::new_v4(),
            normalized_event_id: event.id,
            feature_version: version,
            event_date: event.event_date,
            occurred_at: event.occurred_at,
            identity,
            source: event.source.clone(),
            device_type: event.device.device_type.clone(),
            traffic_source_type: event.traffic_source_type,
            active_time_sec: signals.active_time_sec,
            idle_time_sec: signals.idle_time_sec,
            page_depth: signals.page_depth,
            distinct_pages: signals.distinct_pages,
            max_scroll_depth: signals.max_scroll_depth,
            click_count: signals.click_count,
            form_interactions: signals.form_interactions,
            form_submits: signals.form_submits,
            cta_clicks: signals.cta_clicks,
            search_queries: signals.search_queries,
            goals_count: signals.goals_count,
            key_pages: signals.key_pages.clone(),
            is_bounce: event.is_bounce,
            is_return: scores.is_return,
            conversion_rate_proxy: signals.conversion_rate_proxy,
            engagement_ratio: signals.engagement_ratio,
            engagement_score: scores.engagement.value,
            intent_score: scores.intent.value,
            hot_score_base: scores.hot.value,
            score_breakdown: scores.breakdown,
            segment,
            decision_stage: decision_stage(segment, scores.intent.value, &self.config.segments),
            computed_at: now,
        };

        self.write_feature(&feature, previous.as_ref()).await?;

        metrics().features_computed.inc();
        debug!(
            event_id = %event.id,
            version = version,
            hot = feature.hot_score_base,
            segment = %feature.segment,
            "Feature computed"
        );
        Ok(feature)
    }

    /// Feature row and aggregate fold commit together, so a stored feature
    /// always means its session is counted. Version conflicts are retried.
    async fn write_feature(&self, feature: &Feature, previous: Option<&Feature>) -> Result<()> {
        for attempt in 1..=self.config.max_cas_retries {
            let written = self
                .store
                .insert_feature_with_aggregate(feature, |prior| {
                    merge(prior, feature, previous, Utc::now())
                })
                .await?;
            if written.is_some() {
                return Ok(());
            }

            metrics().aggregate_conflicts.inc();
            debug!(
                identity = %feature.identity.key(),
                attempt = attempt,
                "Aggregate version conflict, retrying"
            );
        }

        Err(Error::database(
            DbErrorCode::Conflict,
            format!(
                "aggregate for {} changed on every one of {} attempts",
                feature.identity.key(),
                self.config.max_cas_retries
            ),
        ))
    }

    /// Process events in (occurred_at, id) order. Failed records are counted, not fatal.
    pub async fn process_batch(&self, event_ids: &[Uuid], task_id: Option<Uuid>) -> Result<FeatureReport> {
        let start = Instant::now();
        let events = self.store.normalized_events_by_ids(event_ids).await?;
        let mut report = FeatureReport::default();
        let mut last_error = None;

        let missing = event_ids.len().saturating_sub(events.len());
        if missing > 0 {
            warn!(missing = missing, "Feature batch references unknown normalized events");
            report.failed += missing as u32;
        }

        for event in &events {
            match self.process_event(event).await {
                Ok(feature) => {
                    report.processed += 1;
                    report.feature_ids.push(feature.id);
                    report.dates.insert(feature.event_date);
                }
                Err(e) => {
                    metrics().feature_failures.inc();
                    warn!(event_id = %event.id, error = %e, "Feature computation failed");
                    report.failed += 1;
                    last_error = Some(e.to_string());
                }
            }
        }

        info!(
            processed = report.processed,
            failed = report.failed,
            dates = report.dates.len(),
            "Feature batch complete"
        );

        let mut entry = LedgerEntry::new(Operation::Feature, "normalized_events")
            .counts(report.processed, report.failed)
            .elapsed(start.elapsed())
            .details(json!({ "dates": report.dates }));
        if let Some(error) = last_error {
            entry = entry.error(error);
        }
        if let Some(task_id) = task_id {
            entry = entry.task(task_id);
        }
        self.ledger.record(entry).await;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration};
    use pipeline_core::{Device, Geo, Hit, HitKind, RawEvent, RequestMetadata, Segment, TrafficSourceType, Utm};
    use pipeline_core::ProcessingStatus;

    async fn setup() -> (FeatureEngine, Store) {
        let store = Store::in_memory().await.unwrap();
        let engine = FeatureEngine::new(
            store.clone(),
            LedgerSink::new(store.clone()),
            ScoringConfig::default(),
        )
        .unwrap();
        (engine, store)
    }

    async fn stored_event(
        store: &Store,
        user_id: Option<&str>,
        client_id: Option<&str>,
        occurred_at: DateTime<Utc>,
        hits: Vec<Hit>,
    ) -> NormalizedEvent {
        let raw = RawEvent {
            id: Uuid::new_v4(),
            source: "tracker".into(),
            raw_data: "{}".into(),
            request_metadata: RequestMetadata::default(),
            status: ProcessingStatus::Processed,
            date_range: None,
            batch_id: None,
            fetched_at: occurred_at,
            error: None,
            processed_at: None,
        };
        store.insert_raw_event(&raw).await.unwrap();

        let event = NormalizedEvent {
            id: Uuid::new_v4(),
            raw_event_id: raw.id,
            source: "tracker".into(),
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.map(String::from),
            client_id: client_id.map(String::from),
            occurred_at,
            event_date: occurred_at.date_naive(),
            url: Some("https://shop.example/pricing".into()),
            referrer: None,
            utm: Utm::default(),
            traffic_source_type: TrafficSourceType::Direct,
            device: Device {
                device_type: Some("desktop".into()),
                ..Default::default()
            },
            geo: Geo::default(),
            page_views: hits.iter().filter(|h| h.kind == HitKind::Pageview).count().max(1) as u32,
            raw_visit_duration: None,
            is_bounce: false,
            hits,
            goals: Vec::new(),
            created_at: occurred_at,
        };
        store.insert_normalized_event(&event).await.unwrap().0
    }

    fn hit(kind: HitKind, at: DateTime<Utc>) -> Hit {
        Hit {
            kind,
            url: None,
            timestamp: Some(at),
            scroll_depth: None,
            query: None,
        }
    }

    #[tokio::test]
    async fn test_missing_identity_writes_nothing() {
        let (engine, store) = setup().await;
        let event = stored_event(&store, None, None, Utc::now(), Vec::new()).await;

        let err = engine.compute(event.id).await.unwrap_err();
        assert_eq!(err.error_code(), Some("VALID_003"));
        assert!(store.latest_feature_for_event(event.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recompute_bumps_version_without_double_counting() {
        let (engine, store) = setup().await;
        let event = stored_event(&store, Some("u1"), Some("c1"), Utc::now(), Vec::new()).await;

        let v1 = engine.compute(event.id).await.unwrap();
        let v2 = engine.compute(event.id).await.unwrap();
        assert_eq!(v1.feature_version, 1);
        assert_eq!(v2.feature_version, 2);

        let agg = store.get_aggregate(&Identity::User("u1".into())).await.unwrap().unwrap();
        assert_eq!(agg.total_sessions, 1);
        assert_eq!(agg.version, 2);
        assert_eq!(agg.key_pages.get("pricing"), Some(&1));
    }

    #[tokio::test]
    async fn test_failed_aggregate_write_leaves_no_feature() {
        let (engine, store) = setup().await;
        let event = stored_event(&store, None, Some("c7"), Utc::now(), Vec::new()).await;

        sqlx::query(
            "CREATE TRIGGER block_aggregates BEFORE INSERT ON user_feature_aggregates \
             BEGIN SELECT RAISE(ABORT, 'aggregate write blocked'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();
        assert!(engine.compute(event.id).await.is_err());
        assert!(store.latest_feature_for_event(event.id).await.unwrap().is_none());

        sqlx::query("DROP TRIGGER block_aggregates")
            .execute(store.pool())
            .await
            .unwrap();
        let feature = engine.compute(event.id).await.unwrap();
        assert_eq!(feature.feature_version, 1);

        let identity = Identity::Client("c7".into());
        let agg = store.get_aggregate(&identity).await.unwrap().unwrap();
        assert_eq!(agg.total_sessions, 1);
        assert_eq!(
            u64::from(agg.total_sessions),
            store.count_feature_sessions(&identity).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_user_id_wins_over_client_id() {
        let (engine, store) = setup().await;
        let event = stored_event(&store, Some("u9"), Some("c9"), Utc::now(), Vec::new()).await;
        engine.compute(event.id).await.unwrap();

        assert!(store.get_aggregate(&Identity::User("u9".into())).await.unwrap().is_some());
        assert!(store.get_aggregate(&Identity::Client("c9".into())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_session_is_return_visit() {
        let (engine, store) = setup().await;
        let now = Utc::now();
        let first = stored_event(&store, None, Some("c1"), now - Duration::days(2), Vec::new()).await;
        let second = stored_event(&store, None, Some("c1"), now - Duration::hours(1), Vec::new()).await;

        let report = engine.process_batch(&[second.id, first.id], None).await.unwrap();
        assert_eq!(report.processed, 2);

        let f2 = store.latest_feature_for_event(second.id).await.unwrap().unwrap();
        assert!(f2.is_return);
        let agg = store.get_aggregate(&Identity::Client("c1".into())).await.unwrap().unwrap();
        assert_eq!(agg.total_sessions, 2);
        assert_eq!(agg.current_hot_score, f2.hot_score_base);
    }

    #[tokio::test]
    async fn test_urgency_session_end_to_end() {
        let (engine, store) = setup().await;
        let start = Utc::now() - Duration::minutes(10);
        // 200s of activity in 20s steps, 12 page views, one form submit.
        let mut hits: Vec<Hit> = (0..=10)
            .map(|i| hit(HitKind::Pageview, start + Duration::seconds(i * 20)))
            .collect();
        hits.push(hit(HitKind::Pageview, start + Duration::seconds(200)));
        hits.push(hit(HitKind::FormSubmit, start + Duration::seconds(200)));
        let event = stored_event(&store, Some("u2"), None, start, hits).await;

        let feature = engine.compute(event.id).await.unwrap();
        assert_eq!(feature.active_time_sec, Some(200.0));
        assert!((feature.conversion_rate_proxy - 1.0 / 12.0).abs() < 1e-9);
        assert_eq!(feature.segment, Segment::Urgency);
        assert!(feature.hot_score_base <= 100);
    }

    #[tokio::test]
    async fn test_batch_continues_after_record_failure() {
        let (engine, store) = setup().await;
        let bad = stored_event(&store, None, None, Utc::now(), Vec::new()).await;
        let good = stored_event(&store, None, Some("c2"), Utc::now(), Vec::new()).await;

        let report = engine.process_batch(&[bad.id, good.id], None).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);

        let ledger = store.recent_ledger(Some(Operation::Feature), 1).await.unwrap();
        assert_eq!(ledger[0].records_failed, 1);
    }
}
