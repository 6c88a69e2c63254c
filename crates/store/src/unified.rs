//! Unified daily metric queries.

use chrono::NaiveDate;
use pipeline_core::{DateRange, Result, UnifiedMetric};
use sqlx::FromRow;

use crate::client::{date_str, db_err, from_json, from_ms, parse_date, parse_enum, to_json, to_ms, u8_col, Store};

const UNIFIED_COLUMNS: &str = "date, ga4_metrics, metrika_metrics, ga4_available, \
     metrika_available, merge_policy, unified_sessions, unified_users, unified_pageviews, \
     unified_bounces, traffic_breakdown, engagement_rate, bounce_rate, avg_session_duration, \
     avg_hot_score, avg_engagement_score, avg_intent_score, dominant_segment, \
     segment_distribution, discrepancies, data_quality_score, updated_at";

#[derive(Debug, FromRow)]
struct UnifiedRow {
    date: String,
    ga4_metrics: Option<String>,
    metrika_metrics: Option<String>,
    ga4_available: bool,
    metrika_available: bool,
    merge_policy: String,
    unified_sessions: i64,
    unified_users: i64,
    unified_pageviews: i64,
    unified_bounces: i64,
    traffic_breakdown: String,
    engagement_rate: f64,
    bounce_rate: f64,
    avg_session_duration: Option<f64>,
    avg_hot_score: f64,
    avg_engagement_score: f64,
    avg_intent_score: f64,
    dominant_segment: Option<String>,
    segment_distribution: String,
    discrepancies: String,
    data_quality_score: i64,
    updated_at: i64,
}

impl TryFrom<UnifiedRow> for UnifiedMetric {
    type Error = pipeline_core::Error;

    fn try_from(row: UnifiedRow) -> Result<Self> {
        Ok(UnifiedMetric {
            date: parse_date(&row.date)?,
            ga4: row
                .ga4_metrics
                .as_deref()
                .map(|s| from_json("ga4_metrics", s))
                .transpose()?,
            metrika: row
                .metrika_metrics
                .as_deref()
                .map(|s| from_json("metrika_metrics", s))
                .transpose()?,
            ga4_available: row.ga4_available,
            metrika_available: row.metrika_available,
            merge_policy: parse_enum(&row.merge_policy)?,
            unified_sessions: row.unified_sessions.max(0) as u64,
            unified_users: row.unified_users.max(0) as u64,
            unified_pageviews: row.unified_pageviews.max(0) as u64,
            unified_bounces: row.unified_bounces.max(0) as u64,
            traffic_breakdown: from_json("traffic_breakdown", &row.traffic_breakdown)?,
            engagement_rate: row.engagement_rate,
            bounce_rate: row.bounce_rate,
            avg_session_duration: row.avg_session_duration,
            avg_hot_score: row.avg_hot_score,
            avg_engagement_score: row.avg_engagement_score,
            avg_intent_score: row.avg_intent_score,
            dominant_segment: row
                .dominant_segment
                .as_deref()
                .map(parse_enum)
                .transpose()?,
            segment_distribution: from_json("segment_distribution", &row.segment_distribution)?,
            discrepancies: from_json("discrepancies", &row.discrepancies)?,
            data_quality_score: u8_col(row.data_quality_score),
            updated_at: from_ms(row.updated_at)?,
        })
    }
}

impl Store {
    pub async fn get_unified_metric(&self, date: NaiveDate) -> Result<Option<UnifiedMetric>> {
        let row = sqlx::query_as::<_, UnifiedRow>(&format!(
            "SELECT {UNIFIED_COLUMNS} FROM unified_metrics WHERE date = ?"
        ))
        .bind(date_str(date))
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;
        row.map(UnifiedMetric::try_from).transpose()
    }

    /// Insert or replace the row for `metric.date`.
    pub async fn upsert_unified_metric(&self, metric: &UnifiedMetric) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO unified_metrics ({UNIFIED_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (date) DO UPDATE SET
                ga4_metrics = excluded.ga4_metrics,
                metrika_metrics = excluded.metrika_metrics,
                ga4_available = excluded.ga4_available,
                metrika_available = excluded.metrika_available,
                merge_policy = excluded.merge_policy,
                unified_sessions = excluded.unified_sessions,
                unified_users = excluded.unified_users,
                unified_pageviews = excluded.unified_pageviews,
                unified_bounces = excluded.unified_bounces,
                traffic_breakdown = excluded.traffic_breakdown,
                engagement_rate = excluded.engagement_rate,
                bounce_rate = excluded.bounce_rate,
                avg_session_duration = excluded.avg_session_duration,
                avg_hot_score = excluded.avg_hot_score,
                avg_engagement_score = excluded.avg_engagement_score,
                avg_intent_score = excluded.avg_intent_score,
                dominant_segment = excluded.dominant_segment,
                segment_distribution = excluded.segment_distribution,
                discrepancies = excluded.discrepancies,
                data_quality_score = excluded.data_quality_score,
                updated_at = excluded.updated_at
            "#
        ))
        .bind(date_str(metric.date))
        .bind(metric.ga4.as_ref().map(to_json).transpose()?)
        .bind(metric.metrika.as_ref().map(to_json).transpose()?)
        .bind(metric.ga4_available)
        .bind(metric.metrika_available)
        .bind(metric.merge_policy.as_str())
        .bind(metric.unified_sessions as i64)
        .bind(metric.unified_users as i64)
        .bind(metric.unified_pageviews as i64)
        .bind(metric.unified_bounces as i64)
        .bind(to_json(&metric.traffic_breakdown)?)
        .bind(metric.engagement_rate)
        .bind(metric.bounce_rate)
        .bind(metric.avg_session_duration)
        .bind(metric.avg_hot_score)
        .bind(metric.avg_engagement_score)
        .bind(metric.avg_intent_score)
        .bind(metric.dominant_segment.map(|s| s.as_str()))
        .bind(to_json(&metric.segment_distribution)?)
        .bind(to_json(&metric.discrepancies)?)
        .bind(metric.data_quality_score as i64)
        .bind(to_ms(metric.updated_at))
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Rows for every date in the range that has one, ascending.
    pub async fn unified_metrics_in_range(&self, range: DateRange) -> Result<Vec<UnifiedMetric>> {
        let rows = sqlx::query_as::<_, UnifiedRow>(&format!(
            "SELECT {UNIFIED_COLUMNS} FROM unified_metrics WHERE date BETWEEN ? AND ? ORDER BY date ASC"
        ))
        .bind(date_str(range.date_from))
        .bind(date_str(range.date_to))
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(UnifiedMetric::try_from).collect()
    }
}
