//! Unified error types for the lead pipeline.
//!
//! Error codes:
//! - NORM_001-003: Normalization failures
//! - DB_001-003: Relational store errors
//! - LLM_001-005: Insight provider failures
//! - VALID_001-003: Input validation errors

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Normalization error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationErrorCode {
    /// NORM_001: Payload is not a JSON object
    InvalidPayload,
    /// NORM_002: No session identifier in payload
    MissingSessionId,
    /// NORM_003: Payload shape does not match the source field map
    UnsupportedShape,
}

impl NormalizationErrorCode {
    /// Get the error code string.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPayload => "NORM_001",
            Self::MissingSessionId => "NORM_002",
            Self::UnsupportedShape => "NORM_003",
        }
    }
}

/// Relational store error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorCode {
    /// DB_001: Query or write failed
    QueryFailed,
    /// DB_002: Stored row could not be decoded
    CorruptRow,
    /// DB_003: Conditional write lost every retry
    Conflict,
}

impl DbErrorCode {
    /// Get the error code string.
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueryFailed => "DB_001",
            Self::CorruptRow => "DB_002",
            Self::Conflict => "DB_003",
        }
    }

    /// Get the HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Conflict => 409,
            _ => 500,
        }
    }
}

/// Insight provider error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorCode {
    /// LLM_001: No credentials configured for the provider
    MissingCredentials,
    /// LLM_002: Provider request failed or returned an error status
    RequestFailed,
    /// LLM_003: Provider call exceeded its timeout
    Timeout,
    /// LLM_004: Provider output could not be parsed
    InvalidResponse,
    /// LLM_005: Every provider in the route failed
    Exhausted,
}

impl ProviderErrorCode {
    /// Get the error code string.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "LLM_001",
            Self::RequestFailed => "LLM_002",
            Self::Timeout => "LLM_003",
            Self::InvalidResponse => "LLM_004",
            Self::Exhausted => "LLM_005",
        }
    }
}

/// Validation error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorCode {
    /// VALID_001: Invalid request format
    InvalidFormat,
    /// VALID_002: Date range is inverted or too wide
    InvalidDateRange,
    /// VALID_003: Neither user_id nor client_id present
    MissingIdentity,
}

impl ValidationErrorCode {
    /// Get the error code string.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidFormat => "VALID_001",
            Self::InvalidDateRange => "VALID_002",
            Self::MissingIdentity => "VALID_003",
        }
    }
}

/// Unified error type for the lead pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Raw payload cannot be mapped to a session.
    #[error("[{code}] {message}")]
    Normalization { code: &'static str, message: String },

    /// Relational store failure.
    #[error("[{code}] {message}")]
    Database {
        code: &'static str,
        message: String,
        http_status: u16,
    },

    /// LLM provider failure.
    #[error("[{code}] {provider}: {message}")]
    Provider {
        code: &'static str,
        provider: String,
        message: String,
    },

    /// Validation error with code.
    #[error("[{code}] {message}")]
    ValidationWithCode { code: &'static str, message: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Requested date range has no data at any layer.
    #[error("no data for range: {0}")]
    NoData(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a normalization error.
    pub fn normalization(code: NormalizationErrorCode, msg: impl Into<String>) -> Self {
        Self::Normalization {
            code: code.code(),
            message: msg.into(),
        }
    }

    /// Create a database error.
    pub fn database(code: DbErrorCode, msg: impl Into<String>) -> Self {
        Self::Database {
            code: code.code(),
            message: msg.into(),
            http_status: code.http_status(),
        }
    }

    /// Create a provider error.
    pub fn provider(
        code: ProviderErrorCode,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            code: code.code(),
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with code.
    pub fn validation_code(code: ValidationErrorCode, msg: impl Into<String>) -> Self {
        Self::ValidationWithCode {
            code: code.code(),
            message: msg.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn no_data(msg: impl Into<String>) -> Self {
        Self::NoData(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether a queued task that failed with this error should be retried.
    ///
    /// Validation problems and empty ranges fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::ValidationWithCode { .. }
                | Self::Validation(_)
                | Self::NoData(_)
                | Self::Normalization { .. }
                | Self::Config(_)
        )
    }

    /// Get the HTTP status code for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Normalization { .. } => 422,
            Self::Database { http_status, .. } => *http_status,
            Self::Provider { .. } => 502,
            Self::ValidationWithCode { .. } => 400,
            Self::Validation(_) => 400,
            Self::Serialization(_) => 400,
            Self::NoData(_) => 404,
            Self::NotFound(_) => 404,
            Self::Config(_) => 500,
            Self::Internal(_) => 500,
        }
    }

    /// Get the error code if this is a coded error.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::Normalization { code, .. } => Some(code),
            Self::Database { code, .. } => Some(code),
            Self::Provider { code, .. } => Some(code),
            Self::ValidationWithCode { code, .. } => Some(code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coded_errors_render_code_prefix() {
        let err = Error::normalization(NormalizationErrorCode::MissingSessionId, "no sessionId");
        assert_eq!(err.to_string(), "[NORM_002] no sessionId");
        assert_eq!(err.error_code(), Some("NORM_002"));

        let err = Error::provider(ProviderErrorCode::Timeout, "openai", "took 60s");
        assert_eq!(err.to_string(), "[LLM_003] openai: took 60s");
        assert_eq!(err.http_status(), 502);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::provider(ProviderErrorCode::Exhausted, "all", "down").is_retryable());
        assert!(Error::database(DbErrorCode::QueryFailed, "locked").is_retryable());
        assert!(!Error::no_data("2024-01-01..2024-01-07").is_retryable());
        assert!(!Error::validation_code(ValidationErrorCode::MissingIdentity, "none").is_retryable());
    }
}
