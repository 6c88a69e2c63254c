//! Insight generation over reconciled daily metrics.
//!
//! The model writes the narrative; segment performance is computed from stored
//! features and every citation the model makes is checked against the data.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use pipeline_core::{
    Citation, DateRange, Error, Feature, Insight, InsightStatus, InsightType, KeyFinding, Layer,
    LedgerEntry, LedgerStatus, Operation, ProviderErrorCode, QualityFlag, Recommendation, Result,
    Segment, SegmentPerformance, UnifiedMetric,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use store::Store;
use telemetry::metrics;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::ledger::LedgerSink;
use crate::providers::{Completion, CompletionRequest, ProviderRegistry};

const SYSTEM_PROMPT: &str = "You are a web analytics consultant. Answer with a single JSON object \
with the keys executive_summary (string), key_findings (array of {title, detail}), \
recommendations (array of {title, detail, priority}), citations (array of {date, metric, value}) \
and confidence (number between 0 and 1). Cite only dates and metrics present in the data.";

/// Metric names the model may cite.
const CITABLE_METRICS: &[&str] = &[
    "sessions",
    "users",
    "pageviews",
    "bounces",
    "bounce_rate",
    "engagement_rate",
    "avg_session_duration",
    "avg_hot_score",
    "avg_engagement_score",
    "avg_intent_score",
    "data_quality_score",
];

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InsightConfig {
    #[serde(default = "default_max_tokens")]
    #[validate(range(min = 64, max = 32000))]
    pub max_tokens: u32,
    /// Relative tolerance when comparing a cited value with the stored one
    #[serde(default = "default_citation_tolerance")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub citation_tolerance: f64,
    /// Used when the model reports no confidence
    #[serde(default = "default_confidence")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub default_confidence: f64,
    /// Confidence removed per quality flag
    #[serde(default = "default_flag_penalty")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub flag_penalty: f64,
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_citation_tolerance() -> f64 {
    0.01
}

fn default_confidence() -> f64 {
    0.5
}

fn default_flag_penalty() -> f64 {
    0.1
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            citation_tolerance: default_citation_tolerance(),
            default_confidence: default_confidence(),
            flag_penalty: default_flag_penalty(),
        }
    }
}

/// Model output after JSON extraction. Every section is optional so that a
/// partial answer still parses and its gaps become quality flags.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ModelOutput {
    #[serde(default)]
    pub executive_summary: Option<String>,
    #[serde(default)]
    key_findings: Vec<Item<KeyFinding>>,
    #[serde(default)]
    recommendations: Vec<Item<Recommendation>>,
    #[serde(default)]
    citations: Vec<serde_json::Value>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Sections may come back as plain strings or as objects.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum Item<T> {
    Text(String),
    Full(T),
}

impl ModelOutput {
    pub fn key_findings(&self) -> Vec<KeyFinding> {
        self.key_findings
            .iter()
            .map(|item| match item {
                Item::Text(title) => KeyFinding {
                    title: title.clone(),
                    detail: String::new(),
                },
                Item::Full(finding) => finding.clone(),
            })
            .collect()
    }

    pub fn recommendations(&self) -> Vec<Recommendation> {
        self.recommendations
            .iter()
            .map(|item| match item {
                Item::Text(title) => Recommendation {
                    title: title.clone(),
                    detail: String::new(),
                    priority: None,
                },
                Item::Full(rec) => rec.clone(),
            })
            .collect()
    }

    /// Well-formed citations; malformed entries are dropped.
    pub fn citations(&self) -> Vec<Citation> {
        self.citations
            .iter()
            .filter_map(|value| serde_json::from_value(value.clone()).ok())
            .collect()
    }
}

/// Parse a completion into [`ModelOutput`].
///
/// Accepts fenced code blocks and prose around the JSON object.
pub fn parse_output(provider: &str, text: &str) -> Result<ModelOutput> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => {
            return Err(Error::provider(
                ProviderErrorCode::InvalidResponse,
                provider,
                "no JSON object in completion",
            ))
        }
    };
    serde_json::from_str(json)
        .map_err(|e| Error::provider(ProviderErrorCode::InvalidResponse, provider, e.to_string()))
}

/// Check model output against the stored metrics.
pub fn quality_flags(
    output: &ModelOutput,
    range: &DateRange,
    metrics: &[UnifiedMetric],
    tolerance: f64,
) -> Vec<QualityFlag> {
    let mut flags = Vec::new();
    let missing = |section: &str| QualityFlag::MissingSection {
        section: section.to_string(),
    };

    if output
        .executive_summary
        .as_deref()
        .map_or(true, |s| s.trim().is_empty())
    {
        flags.push(missing("executive_summary"));
    }
    if output.key_findings.is_empty() {
        flags.push(missing("key_findings"));
    }
    if output.recommendations.is_empty() {
        flags.push(missing("recommendations"));
    }
    let citations = output.citations();
    if citations.is_empty() {
        flags.push(missing("citations"));
    }

    let by_date: BTreeMap<NaiveDate, &UnifiedMetric> = metrics.iter().map(|m| (m.date, m)).collect();
    for citation in citations {
        if !range.contains(citation.date) {
            flags.push(QualityFlag::CitationOutOfRange {
                date: citation.date,
                metric: citation.metric,
            });
            continue;
        }
        let actual = by_date
            .get(&citation.date)
            .and_then(|row| row.metric_value(&citation.metric));
        match actual {
            None => flags.push(QualityFlag::UnknownMetric {
                date: citation.date,
                metric: citation.metric,
            }),
            Some(actual) if (citation.value - actual).abs() > tolerance * actual.abs().max(1.0) => {
                flags.push(QualityFlag::CitationMismatch {
                    date: citation.date,
                    metric: citation.metric,
                    cited: citation.value,
                    actual,
                })
            }
            Some(_) => {}
        }
    }
    flags
}

/// Per-segment session counts and heat, from stored features.
pub fn segment_performance(features: &[Feature]) -> Vec<SegmentPerformance> {
    let total = features.len() as f64;
    let mut groups: BTreeMap<Segment, (u64, f64)> = BTreeMap::new();
    for feature in features {
        let entry = groups.entry(feature.segment).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += f64::from(feature.hot_score_base);
    }
    groups
        .into_iter()
        .map(|(segment, (sessions, hot_sum))| SegmentPerformance {
            segment,
            sessions,
            share: sessions as f64 / total,
            avg_hot_score: hot_sum / sessions as f64,
        })
        .collect()
}

/// Builds prompts, calls the routed provider and stores the insight.
#[derive(Clone)]
pub struct InsightGenerator {
    store: Store,
    ledger: LedgerSink,
    registry: ProviderRegistry,
    config: InsightConfig,
}

impl InsightGenerator {
    pub fn new(store: Store, ledger: LedgerSink, registry: ProviderRegistry, config: InsightConfig) -> Self {
        Self {
            store,
            ledger,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Generate and store a completed insight for a range.
    ///
    /// Fails with no-data when nothing has been reconciled for the range, and
    /// with a provider error when every routed provider failed. The caller
    /// decides whether a failure is final.
    pub async fn generate(&self, range: DateRange, task_id: Option<Uuid>) -> Result<Insight> {
        let start = Instant::now();
        let metrics_rows = self.store.unified_metrics_in_range(range).await?;
        if metrics_rows.is_empty() {
            return Err(Error::no_data(format!("no unified metrics for {range}")));
        }

        let mut features = Vec::new();
        for date in range.dates() {
            features.extend(self.store.features_for_date(date).await?);
        }
        let segments = segment_performance(&features);

        let request = self.build_request(&range, &metrics_rows, &segments)?;
        let result = self
            .registry
            .complete_with(Layer::Unified, &request, |completion: &Completion| {
                parse_output(&completion.model, &completion.text)
            })
            .await;

        let (routed, output) = match result {
            Ok(ok) => ok,
            Err(e) => {
                let mut entry = LedgerEntry::new(Operation::Analysis, range.to_string())
                    .counts(0, 1)
                    .error(e.to_string())
                    .elapsed(start.elapsed());
                if let Some(task_id) = task_id {
                    entry = entry.task(task_id);
                }
                self.ledger.record(entry).await;
                return Err(e);
            }
        };

        let flags = quality_flags(&output, &range, &metrics_rows, self.config.citation_tolerance);
        let confidence = output
            .confidence
            .filter(|c| c.is_finite())
            .map(|c| c.clamp(0.0, 1.0))
            .unwrap_or(self.config.default_confidence);
        let confidence = (confidence - self.config.flag_penalty * flags.len() as f64).clamp(0.0, 1.0);

        if !flags.is_empty() {
            warn!(range = %range, flags = flags.len(), provider = %routed.provider, "Insight has quality flags");
        }

        let insight = Insight {
            id: Uuid::new_v4(),
            date_range: range,
            insight_type: InsightType::for_range(&range),
            executive_summary: output.executive_summary.clone().filter(|s| !s.trim().is_empty()),
            key_findings: output.key_findings(),
            segment_performance: segments,
            recommendations: output.recommendations(),
            citations: output.citations(),
            quality_flags: flags,
            model_used: Some(routed.completion.model.clone()),
            provider: Some(routed.provider.clone()),
            prompt_tokens: routed.completion.prompt_tokens,
            completion_tokens: routed.completion.completion_tokens,
            confidence_score: confidence,
            status: InsightStatus::Completed,
            error: None,
            task_id,
            generated_at: Utc::now(),
        };
        self.store.insert_insight(&insight).await?;
        metrics().insights_generated.inc();

        let status = if insight.quality_flags.is_empty() {
            LedgerStatus::Success
        } else {
            LedgerStatus::Warning
        };
        let mut entry = LedgerEntry::new(Operation::Analysis, range.to_string())
            .counts(1, 0)
            .status(status)
            .elapsed(start.elapsed())
            .details(json!({
                "insight_id": insight.id,
                "provider": routed.provider,
                "quality_flags": insight.quality_flags.len(),
            }));
        if let Some(task_id) = task_id {
            entry = entry.task(task_id);
        }
        self.ledger.record(entry).await;

        info!(
            range = %range,
            insight_id = %insight.id,
            provider = %routed.provider,
            confidence = insight.confidence_score,
            "Insight generated"
        );
        Ok(insight)
    }

    /// Store the failed row for a range whose attempts are exhausted.
    pub async fn record_failure(&self, range: DateRange, task_id: Option<Uuid>, error: &str) -> Result<Insight> {
        let insight = Insight::failed(range, task_id, error, Utc::now());
        self.store.insert_insight(&insight).await?;
        metrics().insights_failed.inc();
        warn!(range = %range, error = %error, "Insight generation failed");
        Ok(insight)
    }

    fn build_request(
        &self,
        range: &DateRange,
        rows: &[UnifiedMetric],
        segments: &[SegmentPerformance],
    ) -> Result<CompletionRequest> {
        let days: Vec<serde_json::Value> = rows
            .iter()
            .map(|m| {
                json!({
                    "date": m.date,
                    "sessions": m.unified_sessions,
                    "users": m.unified_users,
                    "pageviews": m.unified_pageviews,
                    "bounces": m.unified_bounces,
                    "bounce_rate": m.bounce_rate,
                    "engagement_rate": m.engagement_rate,
                    "avg_session_duration": m.avg_session_duration,
                    "avg_hot_score": m.avg_hot_score,
                    "avg_engagement_score": m.avg_engagement_score,
                    "avg_intent_score": m.avg_intent_score,
                    "data_quality_score": m.data_quality_score,
                    "dominant_segment": m.dominant_segment,
                    "traffic": m.traffic_breakdown,
                })
            })
            .collect();

        let data = json!({
            "date_from": range.date_from,
            "date_to": range.date_to,
            "days": days,
            "segments": segments,
            "citable_metrics": CITABLE_METRICS,
        });

        Ok(CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt: format!(
                "Analyze website lead activity for {range}.\n\nData:\n{}",
                serde_json::to_string_pretty(&data)?
            ),
            max_tokens: self.config.max_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::{MergePolicy, TrafficBreakdown};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn metric(d: &str, sessions: u64) -> UnifiedMetric {
        UnifiedMetric {
            date: date(d),
            ga4: None,
            metrika: None,
            ga4_available: true,
            metrika_available: true,
            merge_policy: MergePolicy::Mean,
            unified_sessions: sessions,
            unified_users: 80,
            unified_pageviews: 400,
            unified_bounces: 30,
            traffic_breakdown: TrafficBreakdown::default(),
            engagement_rate: 0.7,
            bounce_rate: 0.3,
            avg_session_duration: None,
            avg_hot_score: 42.0,
            avg_engagement_score: 50.0,
            avg_intent_score: 20.0,
            dominant_segment: Some(Segment::Info),
            segment_distribution: BTreeMap::new(),
            discrepancies: Vec::new(),
            data_quality_score: 96,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_parse_fenced_output() {
        let text = "Here you go:\n```json\n{\"executive_summary\": \"Traffic grew\", \
                    \"key_findings\": [\"More organic\"], \
                    \"recommendations\": [{\"title\": \"Push pricing\", \"priority\": \"high\"}], \
                    \"citations\": [{\"date\": \"2024-03-01\", \"metric\": \"sessions\", \"value\": 110}], \
                    \"confidence\": 0.8}\n```";
        let output = parse_output("p", text).unwrap();
        assert_eq!(output.executive_summary.as_deref(), Some("Traffic grew"));
        assert_eq!(output.key_findings()[0].title, "More organic");
        assert_eq!(output.recommendations()[0].priority.as_deref(), Some("high"));
        assert_eq!(output.citations().len(), 1);
        assert_eq!(output.confidence, Some(0.8));
    }

    #[test]
    fn test_unparseable_output() {
        let err = parse_output("p", "I cannot help with that").unwrap_err();
        assert_eq!(err.error_code(), Some("LLM_004"));
    }

    #[test]
    fn test_quality_flags() {
        let range = DateRange::new(date("2024-03-01"), date("2024-03-02")).unwrap();
        let rows = vec![metric("2024-03-01", 110)];
        let output: ModelOutput = serde_json::from_value(json!({
            "executive_summary": "ok",
            "key_findings": ["a"],
            "citations": [
                {"date": "2024-03-01", "metric": "sessions", "value": 110.5},
                {"date": "2024-03-01", "metric": "users", "value": 95},
                {"date": "2024-02-20", "metric": "sessions", "value": 10},
                {"date": "2024-03-02", "metric": "sessions", "value": 10},
                {"date": "2024-03-01", "metric": "revenue", "value": 1}
            ]
        }))
        .unwrap();

        let flags = quality_flags(&output, &range, &rows, 0.01);
        assert!(flags.contains(&QualityFlag::MissingSection {
            section: "recommendations".into()
        }));
        assert!(flags.contains(&QualityFlag::CitationMismatch {
            date: date("2024-03-01"),
            metric: "users".into(),
            cited: 95.0,
            actual: 80.0,
        }));
        assert!(flags.contains(&QualityFlag::CitationOutOfRange {
            date: date("2024-02-20"),
            metric: "sessions".into(),
        }));
        assert!(flags.contains(&QualityFlag::UnknownMetric {
            date: date("2024-03-02"),
            metric: "sessions".into(),
        }));
        assert!(flags.contains(&QualityFlag::UnknownMetric {
            date: date("2024-03-01"),
            metric: "revenue".into(),
        }));
        // 110.5 vs 110 is inside the tolerance.
        assert_eq!(flags.len(), 5);
    }

    #[test]
    fn test_segment_performance() {
        let perf = segment_performance(&[]);
        assert!(perf.is_empty());
    }
}
