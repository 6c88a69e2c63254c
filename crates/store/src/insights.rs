//! Insight queries. Rows are insert-only.

use pipeline_core::{DateRange, Insight, Result};
use sqlx::FromRow;
use uuid::Uuid;

use crate::client::{
    date_str, db_err, from_json, from_ms, parse_date, parse_enum, parse_uuid, to_json, to_ms,
    u32_col, Store,
};

const INSIGHT_COLUMNS: &str = "id, date_from, date_to, insight_type, executive_summary, \
     key_findings, segment_performance, recommendations, citations, quality_flags, model_used, \
     provider, prompt_tokens, completion_tokens, confidence_score, status, error, task_id, \
     generated_at";

#[derive(Debug, FromRow)]
struct InsightRow {
    id: String,
    date_from: String,
    date_to: String,
    insight_type: String,
    executive_summary: Option<String>,
    key_findings: String,
    segment_performance: String,
    recommendations: String,
    citations: String,
    quality_flags: String,
    model_used: Option<String>,
    provider: Option<String>,
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
    confidence_score: f64,
    status: String,
    error: Option<String>,
    task_id: Option<String>,
    generated_at: i64,
}

impl TryFrom<InsightRow> for Insight {
    type Error = pipeline_core::Error;

    fn try_from(row: InsightRow) -> Result<Self> {
        Ok(Insight {
            id: parse_uuid(&row.id)?,
            date_range: DateRange {
                date_from: parse_date(&row.date_from)?,
                date_to: parse_date(&row.date_to)?,
            },
            insight_type: parse_enum(&row.insight_type)?,
            executive_summary: row.executive_summary,
            key_findings: from_json("key_findings", &row.key_findings)?,
            segment_performance: from_json("segment_performance", &row.segment_performance)?,
            recommendations: from_json("recommendations", &row.recommendations)?,
            citations: from_json("citations", &row.citations)?,
            quality_flags: from_json("quality_flags", &row.quality_flags)?,
            model_used: row.model_used,
            provider: row.provider,
            prompt_tokens: row.prompt_tokens.map(u32_col),
            completion_tokens: row.completion_tokens.map(u32_col),
            confidence_score: row.confidence_score,
            status: parse_enum(&row.status)?,
            error: row.error,
            task_id: row.task_id.as_deref().map(parse_uuid).transpose()?,
            generated_at: from_ms(row.generated_at)?,
        })
    }
}

impl Store {
    pub async fn insert_insight(&self, insight: &Insight) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO analytics_insights ({INSIGHT_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(insight.id.to_string())
        .bind(date_str(insight.date_range.date_from))
        .bind(date_str(insight.date_range.date_to))
        .bind(insight.insight_type.as_str())
        .bind(&insight.executive_summary)
        .bind(to_json(&insight.key_findings)?)
        .bind(to_json(&insight.segment_performance)?)
        .bind(to_json(&insight.recommendations)?)
        .bind(to_json(&insight.citations)?)
        .bind(to_json(&insight.quality_flags)?)
        .bind(&insight.model_used)
        .bind(&insight.provider)
        .bind(insight.prompt_tokens.map(i64::from))
        .bind(insight.completion_tokens.map(i64::from))
        .bind(insight.confidence_score)
        .bind(insight.status.as_str())
        .bind(&insight.error)
        .bind(insight.task_id.map(|id| id.to_string()))
        .bind(to_ms(insight.generated_at))
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Most recent first.
    pub async fn latest_insights(&self, limit: u32) -> Result<Vec<Insight>> {
        let rows = sqlx::query_as::<_, InsightRow>(&format!(
            "SELECT {INSIGHT_COLUMNS} FROM analytics_insights \
             ORDER BY generated_at DESC, rowid DESC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(Insight::try_from).collect()
    }

    pub async fn insights_for_task(&self, task_id: Uuid) -> Result<Vec<Insight>> {
        let rows = sqlx::query_as::<_, InsightRow>(&format!(
            "SELECT {INSIGHT_COLUMNS} FROM analytics_insights WHERE task_id = ? \
             ORDER BY generated_at ASC, rowid ASC"
        ))
        .bind(task_id.to_string())
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(Insight::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use pipeline_core::InsightStatus;

    #[tokio::test]
    async fn test_insights_are_immutable() {
        let store = Store::in_memory().await.unwrap();
        let range = DateRange::day(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        let task_id = Uuid::new_v4();
        let insight = Insight::failed(range, Some(task_id), "all providers failed", Utc::now());
        store.insert_insight(&insight).await.unwrap();

        let loaded = store.insights_for_task(task_id).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, InsightStatus::Failed);
        assert_eq!(loaded[0].error.as_deref(), Some("all providers failed"));

        let update = sqlx::query("UPDATE analytics_insights SET status = 'completed'")
            .execute(store.pool())
            .await;
        assert!(update.is_err());
    }
}
