//! Raw intake endpoint.
//!
//! The body is archived verbatim for the named source. Nothing about its
//! content is checked here; normalization decides later whether it is usable.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use pipeline_core::{schema::validate_raw_size, DateRange};
use serde::Deserialize;
use tracing::{info, warn};

use crate::extractors::IntakeMetadata;
use crate::response::{ApiError, IngestResponse};
use crate::state::AppState;

/// Optional reporting window the payload covers.
#[derive(Debug, Default, Deserialize)]
pub struct IngestQuery {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl IngestQuery {
    fn date_range(&self) -> Result<Option<DateRange>, ApiError> {
        match (self.date_from, self.date_to) {
            (Some(from), Some(to)) => Ok(Some(DateRange::new(from, to)?)),
            (Some(day), None) | (None, Some(day)) => Ok(Some(DateRange::day(day))),
            (None, None) => Ok(None),
        }
    }
}

/// POST /ingest/{source} - Archive one source payload.
pub async fn ingest_handler(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Query(query): Query<IngestQuery>,
    IntakeMetadata(metadata): IntakeMetadata,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    validate_raw_size(&body)?;
    let date_range = query.date_range()?;

    // Bytes are archived as received, valid UTF-8 or not
    let raw = state
        .pipeline
        .ingest(&source, body.to_vec(), metadata, date_range)
        .await
        .map_err(|e| {
            warn!(source = %source, error = %e, "Intake rejected");
            ApiError::from(e)
        })?;

    info!(
        id = %raw.id,
        source = %raw.source,
        bytes = raw.raw_data.len(),
        "Raw payload accepted"
    );

    Ok((StatusCode::ACCEPTED, Json(IngestResponse::accepted(&raw))))
}
