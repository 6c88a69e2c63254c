//! Cross-source daily reconciliation.
//!
//! GA4 and Metrika each report their own view of a day. The reconciler merges
//! them into one [`UnifiedMetric`] row per date, keeps both raw values next to
//! the merged one, and scores how far the sources agree.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use pipeline_core::{
    DateRange, Discrepancy, Feature, FeatureSummary, LedgerEntry, LedgerStatus, MergePolicy,
    NormalizedEvent, Operation, ProcessingStatus, Result, Segment, SourceAvailability, SourceKind,
    SourceMetrics, TrafficBreakdown, TrafficSourceType, UnifiedMetric,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use store::Store;
use telemetry::metrics;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ledger::LedgerSink;

const QUALITY_BOTH_SOURCES: f64 = 100.0;
const QUALITY_ONE_SOURCE: f64 = 70.0;

/// Reconciler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// How to combine a metric both sources report
    #[serde(default)]
    pub merge_policy: MergePolicy,
    /// Relative divergence above which a warning is logged
    #[serde(default = "default_divergence_threshold")]
    pub divergence_threshold: f64,
    /// Cap on the quality points lost to divergence
    #[serde(default = "default_max_divergence_penalty")]
    pub max_divergence_penalty: f64,
}

fn default_divergence_threshold() -> f64 {
    0.15
}

fn default_max_divergence_penalty() -> f64 {
    60.0
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            merge_policy: MergePolicy::default(),
            divergence_threshold: default_divergence_threshold(),
            max_divergence_penalty: default_max_divergence_penalty(),
        }
    }
}

/// Result of reconciling one date.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Written(Box<UnifiedMetric>),
    /// Inputs matched the stored row; nothing written
    Unchanged,
    /// Some raw events for the date still await normalization
    Deferred { pending: u64 },
    /// No source and no feature data for the date
    NoData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub written: Vec<NaiveDate>,
    pub unchanged: Vec<NaiveDate>,
    pub deferred: Vec<NaiveDate>,
    pub no_data: Vec<NaiveDate>,
}

/// Produces unified daily metrics.
#[derive(Clone)]
pub struct Reconciler {
    store: Store,
    ledger: LedgerSink,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(store: Store, ledger: LedgerSink, config: ReconcilerConfig) -> Self {
        Self {
            store,
            ledger,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Reconcile one date from stored normalized events and features.
    pub async fn reconcile_date(&self, date: NaiveDate, task_id: Option<Uuid>) -> Result<ReconcileOutcome> {
        let start = Instant::now();
        let scope = date.to_string();

        let pending: u64 = self
            .store
            .raw_status_by_source(DateRange::day(date))
            .await?
            .iter()
            .filter(|c| c.status == ProcessingStatus::Pending)
            .map(|c| c.count)
            .sum();
        if pending > 0 {
            debug!(date = %date, pending = pending, "Deferring reconciliation, raw events pending");
            return Ok(ReconcileOutcome::Deferred { pending });
        }

        let events = self.store.normalized_events_for_date(date, None).await?;
        let features = self.store.features_for_date(date).await?;

        let ga4 = source_availability(&events, SourceKind::Ga4);
        let metrika = source_availability(&events, SourceKind::Metrika);
        if !ga4.is_available() && !metrika.is_available() && features.is_empty() {
            return Ok(ReconcileOutcome::NoData);
        }

        let summary = summarize_features(&features);
        let metric = reconcile(date, &ga4, &metrika, &summary, &self.config, Utc::now());

        let divergent: Vec<&Discrepancy> = metric
            .discrepancies
            .iter()
            .filter(|d| d.relative_divergence > self.config.divergence_threshold)
            .collect();

        let mut entry = LedgerEntry::new(Operation::Reconcile, scope).counts(1, 0);
        if !divergent.is_empty() {
            metrics().divergence_warnings.inc();
            for d in &divergent {
                warn!(
                    date = %date,
                    metric = %d.metric,
                    ga4 = d.ga4,
                    metrika = d.metrika,
                    divergence = d.relative_divergence,
                    "Sources diverge"
                );
            }
            entry = entry.status(LedgerStatus::Warning).details(json!({
                "divergent": divergent,
                "data_quality_score": metric.data_quality_score,
            }));
        }
        if let Some(task_id) = task_id {
            entry = entry.task(task_id);
        }

        let existing = self.store.get_unified_metric(date).await?;
        let outcome = if existing.is_some_and(|e| e.same_content(&metric)) {
            metrics().reconcile_unchanged.inc();
            ReconcileOutcome::Unchanged
        } else {
            self.store.upsert_unified_metric(&metric).await?;
            metrics().days_reconciled.inc();
            ReconcileOutcome::Written(Box::new(metric))
        };

        self.ledger.record(entry.elapsed(start.elapsed())).await;
        Ok(outcome)
    }

    /// Reconcile every date of a range.
    pub async fn reconcile_range(&self, range: DateRange, task_id: Option<Uuid>) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for date in range.dates() {
            match self.reconcile_date(date, task_id).await? {
                ReconcileOutcome::Written(_) => report.written.push(date),
                ReconcileOutcome::Unchanged => report.unchanged.push(date),
                ReconcileOutcome::Deferred { .. } => report.deferred.push(date),
                ReconcileOutcome::NoData => report.no_data.push(date),
            }
        }
        info!(
            range = %range,
            written = report.written.len(),
            unchanged = report.unchanged.len(),
            deferred = report.deferred.len(),
            "Reconciled range"
        );
        Ok(report)
    }
}

/// Daily totals of one source. Unavailable when it has no sessions that day.
pub fn source_availability(events: &[NormalizedEvent], kind: SourceKind) -> SourceAvailability {
    let events: Vec<&NormalizedEvent> = events
        .iter()
        .filter(|e| SourceKind::from_source(&e.source) == kind)
        .collect();
    if events.is_empty() {
        return SourceAvailability::Unavailable;
    }

    let mut metrics = SourceMetrics::default();
    let mut users = HashSet::new();
    let mut durations = Vec::new();
    for event in &events {
        metrics.sessions += 1;
        metrics.pageviews += u64::from(event.page_views);
        if event.is_bounce {
            metrics.bounces += 1;
        }
        metrics.traffic.add(event.traffic_source_type);
        let user = event
            .user_id
            .as_deref()
            .or(event.client_id.as_deref())
            .unwrap_or(&event.session_id);
        users.insert(user);
        if let Some(d) = event.raw_visit_duration {
            durations.push(d);
        }
    }
    metrics.users = users.len() as u64;
    metrics.avg_duration_sec =
        (!durations.is_empty()).then(|| durations.iter().sum::<f64>() / durations.len() as f64);
    SourceAvailability::Available(metrics)
}

pub fn summarize_features(features: &[Feature]) -> FeatureSummary {
    let mut summary = FeatureSummary {
        feature_count: features.len() as u64,
        ..Default::default()
    };
    if features.is_empty() {
        return summary;
    }

    let n = features.len() as f64;
    let mean = |f: fn(&Feature) -> u8| features.iter().map(|x| f64::from(f(x))).sum::<f64>() / n;
    summary.avg_hot_score = mean(|f| f.hot_score_base);
    summary.avg_engagement_score = mean(|f| f.engagement_score);
    summary.avg_intent_score = mean(|f| f.intent_score);
    summary.engaged_sessions = features.iter().filter(|f| f.active_time_sec.is_some()).count() as u64;

    for feature in features {
        *summary.segment_distribution.entry(feature.segment).or_insert(0) += 1;
    }
    summary
}

/// Merge one date's source metrics into a unified row.
pub fn reconcile(
    date: NaiveDate,
    ga4: &SourceAvailability,
    metrika: &SourceAvailability,
    summary: &FeatureSummary,
    config: &ReconcilerConfig,
    now: DateTime<Utc>,
) -> UnifiedMetric {
    let policy = config.merge_policy;
    let mut discrepancies = Vec::new();

    let mut merge_count = |name: &str, get: fn(&SourceMetrics) -> u64| -> u64 {
        match (ga4.metrics(), metrika.metrics()) {
            (Some(g), Some(m)) => {
                let (a, b) = (get(g) as f64, get(m) as f64);
                let unified = policy.merge(a, b);
                discrepancies.push(discrepancy(name, a, b, unified));
                unified.round() as u64
            }
            (Some(only), None) | (None, Some(only)) => get(only),
            (None, None) => 0,
        }
    };

    let sessions = merge_count("sessions", |m| m.sessions);
    let users = merge_count("users", |m| m.users);
    let pageviews = merge_count("pageviews", |m| m.pageviews);
    let bounces = merge_count("bounces", |m| m.bounces);

    let avg_session_duration = match (
        ga4.metrics().and_then(|m| m.avg_duration_sec),
        metrika.metrics().and_then(|m| m.avg_duration_sec),
    ) {
        (Some(a), Some(b)) => {
            let unified = policy.merge(a, b);
            discrepancies.push(discrepancy("avg_session_duration", a, b, unified));
            Some(unified)
        }
        (a, b) => a.or(b),
    };

    let traffic_breakdown = match (ga4.metrics(), metrika.metrics()) {
        (Some(g), Some(m)) => {
            let mut merged = TrafficBreakdown::default();
            for kind in [
                TrafficSourceType::Organic,
                TrafficSourceType::Paid,
                TrafficSourceType::Social,
                TrafficSourceType::Direct,
                TrafficSourceType::Referral,
            ] {
                let value = policy
                    .merge(g.traffic.get(kind) as f64, m.traffic.get(kind) as f64)
                    .round() as u64;
                merged.set(kind, value);
            }
            merged
        }
        (Some(only), None) | (None, Some(only)) => only.traffic.clone(),
        (None, None) => TrafficBreakdown::default(),
    };

    let bounce_rate = if sessions > 0 {
        bounces.min(sessions) as f64 / sessions as f64
    } else {
        0.0
    };
    let engagement_rate = if sessions > 0 { 1.0 - bounce_rate } else { 0.0 };

    let data_quality_score = quality_score(
        u8::from(ga4.is_available()) + u8::from(metrika.is_available()),
        &discrepancies,
        config.max_divergence_penalty,
    );

    UnifiedMetric {
        date,
        ga4: ga4.metrics().cloned(),
        metrika: metrika.metrics().cloned(),
        ga4_available: ga4.is_available(),
        metrika_available: metrika.is_available(),
        merge_policy: policy,
        unified_sessions: sessions,
        unified_users: users,
        unified_pageviews: pageviews,
        unified_bounces: bounces,
        traffic_breakdown,
        engagement_rate,
        bounce_rate,
        avg_session_duration,
        avg_hot_score: summary.avg_hot_score,
        avg_engagement_score: summary.avg_engagement_score,
        avg_intent_score: summary.avg_intent_score,
        dominant_segment: dominant_segment(&summary.segment_distribution),
        segment_distribution: summary.segment_distribution.clone(),
        discrepancies,
        data_quality_score,
        updated_at: now,
    }
}

fn discrepancy(metric: &str, ga4: f64, metrika: f64, unified: f64) -> Discrepancy {
    let max = ga4.abs().max(metrika.abs());
    let relative_divergence = if max > 0.0 {
        (ga4 - metrika).abs() / max
    } else {
        0.0
    };
    Discrepancy {
        metric: metric.to_string(),
        ga4,
        metrika,
        unified,
        relative_divergence,
    }
}

/// Availability points minus a capped penalty for mean divergence.
fn quality_score(available_sources: u8, discrepancies: &[Discrepancy], max_penalty: f64) -> u8 {
    let base = match available_sources {
        2 => QUALITY_BOTH_SOURCES,
        1 => QUALITY_ONE_SOURCE,
        _ => return 0,
    };
    let penalty = if discrepancies.is_empty() {
        0.0
    } else {
        let mean = discrepancies.iter().map(|d| d.relative_divergence).sum::<f64>()
            / discrepancies.len() as f64;
        (mean * 100.0).min(max_penalty)
    };
    (base - penalty).round().clamp(0.0, 100.0) as u8
}

/// Largest segment; ties go to the earlier segment in rule order.
fn dominant_segment(distribution: &BTreeMap<Segment, u64>) -> Option<Segment> {
    distribution
        .iter()
        .filter(|(_, &count)| count > 0)
        .fold(None, |best: Option<(Segment, u64)>, (&segment, &count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((segment, count)),
        })
        .map(|(segment, _)| segment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn sessions(n: u64) -> SourceAvailability {
        SourceAvailability::Available(SourceMetrics {
            sessions: n,
            users: 50,
            pageviews: 300,
            bounces: 20,
            avg_duration_sec: None,
            traffic: TrafficBreakdown::default(),
        })
    }

    fn run(ga4: SourceAvailability, metrika: SourceAvailability) -> UnifiedMetric {
        reconcile(
            date(),
            &ga4,
            &metrika,
            &FeatureSummary::default(),
            &ReconcilerConfig::default(),
            Utc::now(),
        )
    }

    #[test]
    fn test_mean_policy_and_quality_penalty() {
        let divergent = run(sessions(100), sessions(120));
        let agreeing = run(sessions(110), sessions(110));

        assert_eq!(divergent.unified_sessions, 110);
        assert!(divergent.data_quality_score < agreeing.data_quality_score);
        assert_eq!(agreeing.data_quality_score, 100);

        let d = divergent
            .discrepancies
            .iter()
            .find(|d| d.metric == "sessions")
            .unwrap();
        assert_eq!((d.ga4, d.metrika, d.unified), (100.0, 120.0, 110.0));
    }

    #[test]
    fn test_single_source_passes_through() {
        let metric = run(sessions(80), SourceAvailability::Unavailable);
        assert_eq!(metric.unified_sessions, 80);
        assert!(metric.discrepancies.is_empty());
        assert_eq!(metric.data_quality_score, 70);
        assert!(!metric.metrika_available);
    }

    #[test]
    fn test_no_sources_scores_zero() {
        let metric = run(SourceAvailability::Unavailable, SourceAvailability::Unavailable);
        assert_eq!(metric.data_quality_score, 0);
        assert_eq!(metric.unified_sessions, 0);
    }

    #[test]
    fn test_other_policies() {
        let config = ReconcilerConfig {
            merge_policy: MergePolicy::PreferMetrika,
            ..Default::default()
        };
        let metric = reconcile(
            date(),
            &sessions(100),
            &sessions(120),
            &FeatureSummary::default(),
            &config,
            Utc::now(),
        );
        assert_eq!(metric.unified_sessions, 120);
        assert_eq!(metric.merge_policy, MergePolicy::PreferMetrika);
    }

    #[test]
    fn test_penalty_is_capped() {
        let metric = run(sessions(1), sessions(1_000_000));
        let capped = quality_score(
            2,
            &[discrepancy("sessions", 1.0, 1_000_000.0, 0.0)],
            ReconcilerConfig::default().max_divergence_penalty,
        );
        assert_eq!(capped, 40);
        assert!(metric.data_quality_score >= 40);
    }

    #[test]
    fn test_traffic_breakdown_merges_per_kind() {
        let with_traffic = |organic: u64, paid: u64| {
            SourceAvailability::Available(SourceMetrics {
                sessions: organic + paid,
                users: 50,
                pageviews: 300,
                bounces: 20,
                avg_duration_sec: None,
                traffic: TrafficBreakdown {
                    organic,
                    paid,
                    ..Default::default()
                },
            })
        };
        let metric = run(
            with_traffic(4_000_000_000, 10),
            with_traffic(4_000_000_002, 20),
        );
        assert_eq!(metric.traffic_breakdown.organic, 4_000_000_001);
        assert_eq!(metric.traffic_breakdown.paid, 15);
        assert_eq!(metric.traffic_breakdown.direct, 0);
    }

    #[test]
    fn test_dominant_segment_tie_uses_rule_order() {
        let distribution = BTreeMap::from([(Segment::Info, 3), (Segment::Decision, 3)]);
        assert_eq!(dominant_segment(&distribution), Some(Segment::Decision));
    }
}
