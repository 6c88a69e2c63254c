//! Bounds and defaults shared across the pipeline.
//!
//! The `#[validate]` derive macro requires literal values in attributes,
//! so identifier limits are duplicated there. Keep both in sync when modifying.

// === Scores ===

/// Lower bound for every persisted score.
pub const SCORE_MIN: u8 = 0;

/// Upper bound for every persisted score.
pub const SCORE_MAX: u8 = 100;

// === Identifiers ===

/// Session, user and client identifier max length.
/// Metrika client ids are ~20 chars, GA4 pseudo ids ~25, tracker UUIDs 36.
pub const MAX_IDENTIFIER_LEN: usize = 256;

/// Source name max length.
pub const MAX_SOURCE_LEN: usize = 64;

/// URL/referrer max length (matches HTTP Referer header limit).
pub const MAX_URL_LEN: usize = 2048;

// === Intake ===

/// Maximum raw payload accepted by the HTTP intake (10MB).
///
/// Metrika log exports for a busy day are a few MB; anything larger is a
/// transport problem, not a payload to archive.
pub const MAX_RAW_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Maximum number of days a single pipeline trigger may cover.
pub const MAX_TRIGGER_RANGE_DAYS: i64 = 366;

// === Bounce thresholds (seconds) ===

/// Yandex Metrika counts visits under 15 seconds as bounces.
pub const METRIKA_BOUNCE_THRESHOLD_SECS: f64 = 15.0;

/// GA4 treats sessions under 10 seconds as not engaged.
pub const GA4_BOUNCE_THRESHOLD_SECS: f64 = 10.0;

/// Site trackers and unknown sources.
pub const TRACKER_BOUNCE_THRESHOLD_SECS: f64 = 30.0;

// === Queue ===

/// Default attempt ceiling for queued tasks.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default task priority (higher runs first).
pub const DEFAULT_PRIORITY: i32 = 5;
