//! Validation for intake input and score bounds.

use validator::Validate;

use crate::error::{Error, Result, ValidationErrorCode};
use crate::events::RequestMetadata;
use crate::limits::{MAX_RAW_PAYLOAD_BYTES, MAX_SOURCE_LEN, SCORE_MAX, SCORE_MIN};

/// Validates raw payload size before it is archived.
///
/// This is a transport limit only; content is never inspected at intake.
pub fn validate_raw_size(raw_bytes: &[u8]) -> Result<()> {
    if raw_bytes.len() > MAX_RAW_PAYLOAD_BYTES {
        return Err(Error::validation(format!(
            "payload {}KB exceeds {}KB limit",
            raw_bytes.len() / 1024,
            MAX_RAW_PAYLOAD_BYTES / 1024
        )));
    }
    Ok(())
}

/// Validates a source name: non-empty, bounded, `[A-Za-z0-9_.-]`.
pub fn validate_source_name(source: &str) -> Result<()> {
    if source.is_empty() || source.len() > MAX_SOURCE_LEN {
        return Err(Error::validation_code(
            ValidationErrorCode::InvalidFormat,
            format!("source name must be 1-{MAX_SOURCE_LEN} chars"),
        ));
    }
    if !source
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(Error::validation_code(
            ValidationErrorCode::InvalidFormat,
            format!("source name contains invalid characters: {source}"),
        ));
    }
    Ok(())
}

/// Validates intake transport metadata.
pub fn validate_request_metadata(meta: &RequestMetadata) -> Result<()> {
    meta.validate()
        .map_err(|e| Error::validation(format!("request metadata: {}", e)))
}

/// A score forced into the persisted range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClampedScore {
    pub value: u8,
    pub raw: f64,
    /// The raw value fell outside [0,100] or was not finite
    pub violated: bool,
}

/// Round and clamp a computed score into [0,100].
pub fn clamp_score(raw: f64) -> ClampedScore {
    let (min, max) = (SCORE_MIN as f64, SCORE_MAX as f64);
    if !raw.is_finite() {
        return ClampedScore {
            value: SCORE_MIN,
            raw,
            violated: true,
        };
    }
    let violated = raw < min || raw > max;
    ClampedScore {
        value: raw.round().clamp(min, max) as u8,
        raw,
        violated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_size_limit() {
        assert!(validate_raw_size(b"{}").is_ok());
        let big = vec![b'x'; MAX_RAW_PAYLOAD_BYTES + 1];
        assert!(validate_raw_size(&big).is_err());
    }

    #[test]
    fn test_source_names() {
        assert!(validate_source_name("metrika").is_ok());
        assert!(validate_source_name("site-tracker_v2").is_ok());
        assert!(validate_source_name("").is_err());
        assert!(validate_source_name("bad/source").is_err());
    }

    #[test]
    fn test_clamp_score() {
        assert_eq!(clamp_score(42.4).value, 42);
        assert!(!clamp_score(100.0).violated);

        let high = clamp_score(131.0);
        assert_eq!(high.value, 100);
        assert!(high.violated);

        let low = clamp_score(-3.0);
        assert_eq!(low.value, 0);
        assert!(low.violated);

        let nan = clamp_score(f64::NAN);
        assert_eq!(nan.value, 0);
        assert!(nan.violated);
    }

    #[test]
    fn test_metadata_length_limits() {
        let meta = RequestMetadata {
            ip: Some("x".repeat(65)),
            ..Default::default()
        };
        assert!(validate_request_metadata(&meta).is_err());
        assert!(validate_request_metadata(&RequestMetadata::default()).is_ok());
    }
}
