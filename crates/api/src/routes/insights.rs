//! Read models: insights and hot leads.

use axum::{
    extract::{Query, State},
    Json,
};
use pipeline_core::{HotLead, Insight};
use serde::Deserialize;
use validator::Validate;

use crate::response::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct InsightsQuery {
    #[serde(default = "default_insights_limit")]
    #[validate(range(min = 1, max = 100))]
    pub limit: u32,
}

fn default_insights_limit() -> u32 {
    10
}

#[derive(Debug, Deserialize, Validate)]
pub struct HotLeadsQuery {
    #[serde(default = "default_min_score")]
    #[validate(range(max = 100))]
    pub min_score: u8,
    #[serde(default = "default_leads_limit")]
    #[validate(range(min = 1, max = 500))]
    pub limit: u32,
}

fn default_min_score() -> u8 {
    70
}

fn default_leads_limit() -> u32 {
    100
}

/// GET /insights - Most recent insights, newest first.
pub async fn insights_handler(
    State(state): State<AppState>,
    Query(query): Query<InsightsQuery>,
) -> Result<Json<Vec<Insight>>, ApiError> {
    query.validate()?;
    Ok(Json(state.pipeline.get_latest_insights(query.limit).await?))
}

/// GET /leads/hot - Identities at or above a hot score.
pub async fn hot_leads_handler(
    State(state): State<AppState>,
    Query(query): Query<HotLeadsQuery>,
) -> Result<Json<Vec<HotLead>>, ApiError> {
    query.validate()?;
    Ok(Json(
        state
            .pipeline
            .get_hot_leads(query.min_score, query.limit)
            .await?,
    ))
}
