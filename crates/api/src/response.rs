//! Standardized API responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pipeline_core::{DateRange, RangeStatus, RawEvent};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Success response for raw intake.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub success: bool,
    pub id: Uuid,
    pub source: String,
    pub received_bytes: usize,
    pub timestamp: i64,
}

impl IngestResponse {
    pub fn accepted(raw: &RawEvent) -> Self {
        Self {
            success: true,
            id: raw.id,
            source: raw.source.clone(),
            received_bytes: raw.raw_data.len(),
            timestamp: raw.fetched_at.timestamp_millis(),
        }
    }
}

/// Readiness of a date range.
#[derive(Debug, Serialize, Deserialize)]
pub struct RangeStatusResponse {
    pub date_range: DateRange,
    pub status: RangeStatus,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub store_connected: bool,
    pub clickhouse_connected: bool,
    pub providers_available: bool,
    pub queue_depth: u64,
}

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = Some(details);
        self
    }
}

/// API error carrying the pipeline error code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub response: ErrorResponse,
}

impl ApiError {
    pub fn with_code(status: StatusCode, code: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            status,
            response: ErrorResponse::new(msg, code),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::with_code(StatusCode::BAD_REQUEST, "VALID_001", msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::with_code(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", msg)
    }

    pub fn validation(code: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            response: ErrorResponse::new("Validation failed", code).with_details(errors),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.response)).into_response()
    }
}

impl From<pipeline_core::Error> for ApiError {
    fn from(err: pipeline_core::Error) -> Self {
        use pipeline_core::Error;

        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let code = match (&err, err.error_code()) {
            (_, Some(code)) => code,
            (Error::Validation(_) | Error::Serialization(_), None) => "VALID_001",
            (Error::NoData(_), None) => "NO_DATA",
            (Error::NotFound(_), None) => "NOT_FOUND",
            (Error::Config(_), None) => "CONFIG",
            _ => "INTERNAL",
        };
        ApiError::with_code(status, code, err.to_string())
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let details = errors
            .field_errors()
            .into_iter()
            .map(|(field, errs)| {
                let reasons: Vec<String> = errs.iter().map(|e| e.code.to_string()).collect();
                format!("{field}: {}", reasons.join(", "))
            })
            .collect();
        ApiError::validation("VALID_001", details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::{Error, ProviderErrorCode, ValidationErrorCode};

    #[test]
    fn test_error_mapping_keeps_codes() {
        let err: ApiError =
            Error::provider(ProviderErrorCode::Exhausted, "registry", "none left").into();
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert_eq!(err.response.code, "LLM_005");

        let err: ApiError =
            Error::validation_code(ValidationErrorCode::InvalidDateRange, "backwards").into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.response.code, "VALID_002");

        let err: ApiError = Error::no_data("2024-01-01..2024-01-02").into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.response.code, "NO_DATA");
    }
}
