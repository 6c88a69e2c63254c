//! Pipeline control endpoints.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use pipeline_core::{DateRange, QueueStatus};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::{Validate, ValidationError};
use worker::TriggerResult;

use crate::response::{ApiError, RangeStatusResponse};
use crate::state::AppState;

/// Body of `POST /pipeline/trigger`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_trigger_dates"))]
pub struct TriggerRequest {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    #[serde(default = "default_run_insights")]
    pub run_insights: bool,
}

fn default_run_insights() -> bool {
    true
}

fn validate_trigger_dates(req: &TriggerRequest) -> Result<(), ValidationError> {
    if req.date_to < req.date_from {
        return Err(ValidationError::new("date_to_before_date_from"));
    }
    Ok(())
}

/// Query of `GET /pipeline/range`.
#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
}

/// POST /pipeline/trigger - Enqueue a run over a date range.
pub async fn trigger_handler(
    State(state): State<AppState>,
    Json(req): Json<TriggerRequest>,
) -> Result<(StatusCode, Json<TriggerResult>), ApiError> {
    req.validate()?;

    let result = state
        .pipeline
        .trigger_pipeline(req.date_from, req.date_to, req.run_insights)
        .await?;

    info!(
        run_id = %result.run_id,
        tasks = result.task_ids.len(),
        "Trigger accepted"
    );
    Ok((StatusCode::ACCEPTED, Json(result)))
}

/// GET /pipeline/range - Whether a range has data and whether it is normalized.
pub async fn range_handler(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<RangeStatusResponse>, ApiError> {
    let date_range = DateRange::new(query.date_from, query.date_to)?;
    let status = state.pipeline.range_status(date_range).await?;
    Ok(Json(RangeStatusResponse { date_range, status }))
}

/// GET /queue/status - Work queue counters.
pub async fn queue_status_handler(
    State(state): State<AppState>,
) -> Result<Json<QueueStatus>, ApiError> {
    Ok(Json(state.pipeline.get_queue_status().await?))
}
