//! Feature store and per-identity aggregate queries.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use pipeline_core::{Feature, Identity, Result, ScoreBreakdown, UserAggregate};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use uuid::Uuid;

use crate::client::{
    date_str, db_err, from_json, from_ms, parse_date, parse_enum, parse_uuid, to_json, to_ms,
    u32_col, u8_col, Store,
};

const FEATURE_COLUMNS: &str = "id, normalized_event_id, feature_version, event_date, occurred_at, \
     user_id, client_id, source, device_type, traffic_source_type, active_time_sec, page_depth, \
     key_pages_visited, signals, is_bounce, is_return, engagement_score, intent_score, \
     hot_score_base, score_breakdown, segment_type, decision_stage, computed_at";

const AGGREGATE_COLUMNS: &str = "id, user_id, client_id, total_sessions, total_active_time_sec, \
     first_visit_at, last_visit_at, device_counts, source_counts, preferred_device, \
     preferred_source, key_pages, current_hot_score, current_segment_type, version, updated_at";

/// Feature counters kept in one JSON column.
#[derive(Debug, Serialize, Deserialize)]
struct Signals {
    idle_time_sec: Option<f64>,
    distinct_pages: u32,
    max_scroll_depth: Option<f64>,
    click_count: u32,
    form_interactions: u32,
    form_submits: u32,
    cta_clicks: u32,
    search_queries: u32,
    goals_count: u32,
    conversion_rate_proxy: f64,
    engagement_ratio: Option<f64>,
}

fn identity_from(user_id: Option<String>, client_id: Option<String>) -> Result<Identity> {
    match (user_id, client_id) {
        (Some(user), None) => Ok(Identity::User(user)),
        (None, Some(client)) => Ok(Identity::Client(client)),
        _ => Err(crate::client::corrupt(
            "identity",
            "expected exactly one of user_id/client_id",
        )),
    }
}

#[derive(Debug, FromRow)]
struct FeatureRow {
    id: String,
    normalized_event_id: String,
    feature_version: i64,
    event_date: String,
    occurred_at: i64,
    user_id: Option<String>,
    client_id: Option<String>,
    source: String,
    device_type: Option<String>,
    traffic_source_type: String,
    active_time_sec: Option<f64>,
    page_depth: i64,
    key_pages_visited: String,
    signals: String,
    is_bounce: bool,
    is_return: bool,
    engagement_score: i64,
    intent_score: i64,
    hot_score_base: i64,
    score_breakdown: String,
    segment_type: String,
    decision_stage: String,
    computed_at: i64,
}

impl TryFrom<FeatureRow> for Feature {
    type Error = pipeline_core::Error;

    fn try_from(row: FeatureRow) -> Result<Self> {
        let signals: Signals = from_json("signals", &row.signals)?;
        Ok(Feature {
            id: parse_uuid(&row.id)?,
            normalized_event_id: parse_uuid(&row.normalized_event_id)?,
            feature_version: u32_col(row.feature_version),
            event_date: parse_date(&row.event_date)?,
            occurred_at: from_ms(row.occurred_at)?,
            identity: identity_from(row.user_id, row.client_id)?,
            source: row.source,
            device_type: row.device_type,
            traffic_source_type: parse_enum(&row.traffic_source_type)?,
            active_time_sec: row.active_time_sec,
            idle_time_sec: signals.idle_time_sec,
            page_depth: u32_col(row.page_depth),
            distinct_pages: signals.distinct_pages,
            max_scroll_depth: signals.max_scroll_depth,
            click_count: signals.click_count,
            form_interactions: signals.form_interactions,
            form_submits: signals.form_submits,
            cta_clicks: signals.cta_clicks,
            search_queries: signals.search_queries,
            goals_count: signals.goals_count,
            key_pages: from_json::<BTreeMap<String, u32>>("key_pages_visited", &row.key_pages_visited)?,
            is_bounce: row.is_bounce,
            is_return: row.is_return,
            conversion_rate_proxy: signals.conversion_rate_proxy,
            engagement_ratio: signals.engagement_ratio,
            engagement_score: u8_col(row.engagement_score),
            intent_score: u8_col(row.intent_score),
            hot_score_base: u8_col(row.hot_score_base),
            score_breakdown: from_json::<ScoreBreakdown>("score_breakdown", &row.score_breakdown)?,
            segment: parse_enum(&row.segment_type)?,
            decision_stage: parse_enum(&row.decision_stage)?,
            computed_at: from_ms(row.computed_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct AggregateRow {
    id: String,
    user_id: Option<String>,
    client_id: Option<String>,
    total_sessions: i64,
    total_active_time_sec: f64,
    first_visit_at: i64,
    last_visit_at: i64,
    device_counts: String,
    source_counts: String,
    preferred_device: Option<String>,
    preferred_source: Option<String>,
    key_pages: String,
    current_hot_score: i64,
    current_segment_type: String,
    version: i64,
    updated_at: i64,
}

impl TryFrom<AggregateRow> for UserAggregate {
    type Error = pipeline_core::Error;

    fn try_from(row: AggregateRow) -> Result<Self> {
        Ok(UserAggregate {
            id: parse_uuid(&row.id)?,
            identity: identity_from(row.user_id, row.client_id)?,
            total_sessions: u32_col(row.total_sessions),
            total_active_time_sec: row.total_active_time_sec,
            first_visit_at: from_ms(row.first_visit_at)?,
            last_visit_at: from_ms(row.last_visit_at)?,
            device_counts: from_json("device_counts", &row.device_counts)?,
            source_counts: from_json("source_counts", &row.source_counts)?,
            preferred_device: row.preferred_device,
            preferred_source: row.preferred_source,
            key_pages: from_json("key_pages", &row.key_pages)?,
            current_hot_score: u8_col(row.current_hot_score),
            current_segment: parse_enum(&row.current_segment_type)?,
            version: row.version,
            updated_at: from_ms(row.updated_at)?,
        })
    }
}

impl Store {
    /// Insert one feature version. (normalized_event_id, feature_version) is unique.
    pub async fn insert_feature(&self, feature: &Feature) -> Result<()> {
        let mut conn = self.pool().acquire().await.map_err(db_err)?;
        insert_feature_on(&mut conn, feature).await
    }

    /// Insert a feature and fold it into its identity's aggregate in one transaction.
    ///
    /// `fold` receives the stored aggregate, if any, and returns the row to
    /// write. Returns `None`, with nothing written, when the aggregate version
    /// moved before the write.
    pub async fn insert_feature_with_aggregate<F>(
        &self,
        feature: &Feature,
        fold: F,
    ) -> Result<Option<UserAggregate>>
    where
        F: FnOnce(Option<&UserAggregate>) -> UserAggregate,
    {
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        // The insert takes the write lock before the aggregate is read.
        insert_feature_on(&mut tx, feature).await?;
        let prior = get_aggregate_on(&mut tx, &feature.identity).await?;
        let merged = fold(prior.as_ref());

        let written = match prior {
            None => insert_aggregate_on(&mut tx, &merged).await?,
            Some(ref prior) => update_aggregate_on(&mut tx, &merged, prior.version).await?,
        };
        if !written {
            tx.rollback().await.map_err(db_err)?;
            return Ok(None);
        }
        tx.commit().await.map_err(db_err)?;
        Ok(Some(merged))
    }

    /// Highest version for a normalized event.
    pub async fn latest_feature_for_event(&self, normalized_event_id: Uuid) -> Result<Option<Feature>> {
        let row = sqlx::query_as::<_, FeatureRow>(&format!(
            "SELECT {FEATURE_COLUMNS} FROM feature_store WHERE normalized_event_id = ? \
             ORDER BY feature_version DESC LIMIT 1"
        ))
        .bind(normalized_event_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;
        row.map(Feature::try_from).transpose()
    }

    /// Latest version of every feature for one date.
    pub async fn features_for_date(&self, date: NaiveDate) -> Result<Vec<Feature>> {
        let rows = sqlx::query_as::<_, FeatureRow>(&format!(
            "SELECT {FEATURE_COLUMNS} FROM feature_store f WHERE event_date = ? \
             AND feature_version = (SELECT MAX(g.feature_version) FROM feature_store g \
                                    WHERE g.normalized_event_id = f.normalized_event_id) \
             ORDER BY occurred_at ASC, id ASC"
        ))
        .bind(date_str(date))
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(Feature::try_from).collect()
    }

    /// Distinct sessions with at least one feature row for an identity.
    pub async fn count_feature_sessions(&self, identity: &Identity) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT normalized_event_id) FROM feature_store WHERE identity_key = ?",
        )
        .bind(identity.key())
        .fetch_one(self.pool())
        .await
        .map_err(db_err)?;
        Ok(count.max(0) as u64)
    }

    pub async fn get_aggregate(&self, identity: &Identity) -> Result<Option<UserAggregate>> {
        let mut conn = self.pool().acquire().await.map_err(db_err)?;
        get_aggregate_on(&mut conn, identity).await
    }

    /// Insert the first aggregate for an identity.
    ///
    /// Returns false when another writer created it first.
    pub async fn insert_aggregate(&self, agg: &UserAggregate) -> Result<bool> {
        let mut conn = self.pool().acquire().await.map_err(db_err)?;
        insert_aggregate_on(&mut conn, agg).await
    }

    /// Conditional write: applies only if the stored version still equals `expected_version`.
    pub async fn update_aggregate(&self, agg: &UserAggregate, expected_version: i64) -> Result<bool> {
        let mut conn = self.pool().acquire().await.map_err(db_err)?;
        update_aggregate_on(&mut conn, agg, expected_version).await
    }

    /// Aggregates at or above a score, hottest first.
    pub async fn hot_aggregates(&self, min_score: u8, limit: u32) -> Result<Vec<UserAggregate>> {
        let rows = sqlx::query_as::<_, AggregateRow>(&format!(
            "SELECT {AGGREGATE_COLUMNS} FROM user_feature_aggregates \
             WHERE current_hot_score >= ? \
             ORDER BY current_hot_score DESC, last_visit_at DESC LIMIT ?"
        ))
        .bind(min_score as i64)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(UserAggregate::try_from).collect()
    }
}

async fn insert_feature_on(conn: &mut SqliteConnection, feature: &Feature) -> Result<()> {
    let signals = Signals {
        idle_time_sec: feature.idle_time_sec,
        distinct_pages: feature.distinct_pages,
        max_scroll_depth: feature.max_scroll_depth,
        click_count: feature.click_count,
        form_interactions: feature.form_interactions,
        form_submits: feature.form_submits,
        cta_clicks: feature.cta_clicks,
        search_queries: feature.search_queries,
        goals_count: feature.goals_count,
        conversion_rate_proxy: feature.conversion_rate_proxy,
        engagement_ratio: feature.engagement_ratio,
    };

    sqlx::query(&format!(
        "INSERT INTO feature_store ({FEATURE_COLUMNS}, identity_key) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(feature.id.to_string())
    .bind(feature.normalized_event_id.to_string())
    .bind(feature.feature_version as i64)
    .bind(date_str(feature.event_date))
    .bind(to_ms(feature.occurred_at))
    .bind(feature.identity.user_id())
    .bind(feature.identity.client_id())
    .bind(&feature.source)
    .bind(&feature.device_type)
    .bind(feature.traffic_source_type.as_str())
    .bind(feature.active_time_sec)
    .bind(feature.page_depth as i64)
    .bind(to_json(&feature.key_pages)?)
    .bind(to_json(&signals)?)
    .bind(feature.is_bounce)
    .bind(feature.is_return)
    .bind(feature.engagement_score as i64)
    .bind(feature.intent_score as i64)
    .bind(feature.hot_score_base as i64)
    .bind(to_json(&feature.score_breakdown)?)
    .bind(feature.segment.as_str())
    .bind(feature.decision_stage.as_str())
    .bind(to_ms(feature.computed_at))
    .bind(feature.identity.key())
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn get_aggregate_on(
    conn: &mut SqliteConnection,
    identity: &Identity,
) -> Result<Option<UserAggregate>> {
    let row = sqlx::query_as::<_, AggregateRow>(&format!(
        "SELECT {AGGREGATE_COLUMNS} FROM user_feature_aggregates WHERE identity_key = ?"
    ))
    .bind(identity.key())
    .fetch_optional(conn)
    .await
    .map_err(db_err)?;
    row.map(UserAggregate::try_from).transpose()
}

async fn insert_aggregate_on(conn: &mut SqliteConnection, agg: &UserAggregate) -> Result<bool> {
    let result = sqlx::query(&format!(
        "INSERT INTO user_feature_aggregates ({AGGREGATE_COLUMNS}, identity_key) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (identity_key) DO NOTHING"
    ))
    .bind(agg.id.to_string())
    .bind(agg.identity.user_id())
    .bind(agg.identity.client_id())
    .bind(agg.total_sessions as i64)
    .bind(agg.total_active_time_sec)
    .bind(to_ms(agg.first_visit_at))
    .bind(to_ms(agg.last_visit_at))
    .bind(to_json(&agg.device_counts)?)
    .bind(to_json(&agg.source_counts)?)
    .bind(&agg.preferred_device)
    .bind(&agg.preferred_source)
    .bind(to_json(&agg.key_pages)?)
    .bind(agg.current_hot_score as i64)
    .bind(agg.current_segment.as_str())
    .bind(agg.version)
    .bind(to_ms(agg.updated_at))
    .bind(agg.identity.key())
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(result.rows_affected() == 1)
}

async fn update_aggregate_on(
    conn: &mut SqliteConnection,
    agg: &UserAggregate,
    expected_version: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE user_feature_aggregates
        SET total_sessions = ?, total_active_time_sec = ?, first_visit_at = ?,
            last_visit_at = ?, device_counts = ?, source_counts = ?, preferred_device = ?,
            preferred_source = ?, key_pages = ?, current_hot_score = ?,
            current_segment_type = ?, version = ?, updated_at = ?
        WHERE identity_key = ? AND version = ?
        "#,
    )
    .bind(agg.total_sessions as i64)
    .bind(agg.total_active_time_sec)
    .bind(to_ms(agg.first_visit_at))
    .bind(to_ms(agg.last_visit_at))
    .bind(to_json(&agg.device_counts)?)
    .bind(to_json(&agg.source_counts)?)
    .bind(&agg.preferred_device)
    .bind(&agg.preferred_source)
    .bind(to_json(&agg.key_pages)?)
    .bind(agg.current_hot_score as i64)
    .bind(agg.current_segment.as_str())
    .bind(agg.version)
    .bind(to_ms(agg.updated_at))
    .bind(agg.identity.key())
    .bind(expected_version)
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(result.rows_affected() == 1)
}
