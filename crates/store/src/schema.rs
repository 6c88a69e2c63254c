//! SQLite table schemas.
//!
//! Conventions:
//! - timestamps are INTEGER epoch milliseconds
//! - calendar dates are TEXT `YYYY-MM-DD`
//! - structured fields are JSON text
//! - append-only tables are guarded by triggers

use tracing::debug;

use crate::client::{db_err, Store};
use pipeline_core::Result;

/// Verbatim source payloads.
pub const CREATE_RAW_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS raw_events (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    raw_data BLOB NOT NULL,
    request_metadata TEXT NOT NULL DEFAULT '{}',
    processing_status TEXT NOT NULL DEFAULT 'pending'
        CHECK (processing_status IN ('pending', 'processed', 'failed', 'skipped')),
    date_from TEXT,
    date_to TEXT,
    batch_id TEXT,
    fetched_at INTEGER NOT NULL,
    fetched_date TEXT NOT NULL,
    error TEXT,
    processed_at INTEGER
)
"#;

pub const CREATE_RAW_EVENTS_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_raw_events_status ON raw_events (processing_status, fetched_at);
CREATE INDEX IF NOT EXISTS idx_raw_events_source_date ON raw_events (source, fetched_date);
"#;

/// Only status, error and processed_at may change; rows are never deleted.
pub const CREATE_RAW_EVENTS_GUARDS: &str = r#"
CREATE TRIGGER IF NOT EXISTS raw_events_payload_immutable
BEFORE UPDATE OF id, source, raw_data, request_metadata, date_from, date_to, batch_id, fetched_at
ON raw_events
BEGIN
    SELECT RAISE(ABORT, 'raw_events payload columns are immutable');
END;
CREATE TRIGGER IF NOT EXISTS raw_events_no_delete
BEFORE DELETE ON raw_events
BEGIN
    SELECT RAISE(ABORT, 'raw_events is append-only');
END;
"#;

/// Canonical sessions, one per raw event.
pub const CREATE_NORMALIZED_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS normalized_events (
    id TEXT PRIMARY KEY,
    raw_event_id TEXT NOT NULL UNIQUE REFERENCES raw_events (id),
    source TEXT NOT NULL,
    session_id TEXT NOT NULL,
    user_id TEXT,
    client_id TEXT,
    occurred_at INTEGER NOT NULL,
    event_date TEXT NOT NULL,
    url TEXT,
    referrer TEXT,
    utm_source TEXT,
    utm_medium TEXT,
    utm_campaign TEXT,
    utm_content TEXT,
    utm_term TEXT,
    traffic_source_type TEXT NOT NULL,
    device_type TEXT,
    browser TEXT,
    os TEXT,
    country TEXT,
    region TEXT,
    city TEXT,
    page_views INTEGER NOT NULL,
    raw_visit_duration REAL,
    is_bounce INTEGER NOT NULL,
    hits TEXT NOT NULL DEFAULT '[]',
    goals_reached TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL
)
"#;

pub const CREATE_NORMALIZED_EVENTS_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_normalized_events_date ON normalized_events (event_date, source);
CREATE INDEX IF NOT EXISTS idx_normalized_events_session ON normalized_events (source, session_id);
"#;

/// Per-session features, versioned.
pub const CREATE_FEATURE_STORE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS feature_store (
    id TEXT PRIMARY KEY,
    normalized_event_id TEXT NOT NULL REFERENCES normalized_events (id),
    feature_version INTEGER NOT NULL CHECK (feature_version >= 1),
    event_date TEXT NOT NULL,
    occurred_at INTEGER NOT NULL,
    identity_key TEXT NOT NULL,
    user_id TEXT,
    client_id TEXT,
    source TEXT NOT NULL,
    device_type TEXT,
    traffic_source_type TEXT NOT NULL,
    active_time_sec REAL,
    page_depth INTEGER NOT NULL,
    key_pages_visited TEXT NOT NULL DEFAULT '{}',
    signals TEXT NOT NULL DEFAULT '{}',
    is_bounce INTEGER NOT NULL,
    is_return INTEGER NOT NULL,
    engagement_score INTEGER NOT NULL CHECK (engagement_score BETWEEN 0 AND 100),
    intent_score INTEGER NOT NULL CHECK (intent_score BETWEEN 0 AND 100),
    hot_score_base INTEGER NOT NULL CHECK (hot_score_base BETWEEN 0 AND 100),
    score_breakdown TEXT NOT NULL DEFAULT '{}',
    segment_type TEXT NOT NULL,
    decision_stage TEXT NOT NULL,
    computed_at INTEGER NOT NULL,
    UNIQUE (normalized_event_id, feature_version)
)
"#;

pub const CREATE_FEATURE_STORE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_feature_store_date ON feature_store (event_date);
CREATE INDEX IF NOT EXISTS idx_feature_store_identity ON feature_store (identity_key);
"#;

/// One row per identity; exactly one of user_id/client_id.
pub const CREATE_USER_AGGREGATES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS user_feature_aggregates (
    id TEXT PRIMARY KEY,
    identity_key TEXT NOT NULL UNIQUE,
    user_id TEXT,
    client_id TEXT,
    total_sessions INTEGER NOT NULL,
    total_active_time_sec REAL NOT NULL,
    first_visit_at INTEGER NOT NULL,
    last_visit_at INTEGER NOT NULL,
    device_counts TEXT NOT NULL DEFAULT '{}',
    source_counts TEXT NOT NULL DEFAULT '{}',
    preferred_device TEXT,
    preferred_source TEXT,
    key_pages TEXT NOT NULL DEFAULT '{}',
    current_hot_score INTEGER NOT NULL CHECK (current_hot_score BETWEEN 0 AND 100),
    current_segment_type TEXT NOT NULL,
    version INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    CHECK ((user_id IS NULL) <> (client_id IS NULL))
)
"#;

pub const CREATE_USER_AGGREGATES_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_user_aggregates_hot ON user_feature_aggregates (current_hot_score DESC);
"#;

/// Reconciled daily metrics.
pub const CREATE_UNIFIED_METRICS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS unified_metrics (
    date TEXT PRIMARY KEY,
    ga4_metrics TEXT,
    metrika_metrics TEXT,
    ga4_available INTEGER NOT NULL,
    metrika_available INTEGER NOT NULL,
    merge_policy TEXT NOT NULL,
    unified_sessions INTEGER NOT NULL,
    unified_users INTEGER NOT NULL,
    unified_pageviews INTEGER NOT NULL,
    unified_bounces INTEGER NOT NULL,
    traffic_breakdown TEXT NOT NULL,
    engagement_rate REAL NOT NULL,
    bounce_rate REAL NOT NULL,
    avg_session_duration REAL,
    avg_hot_score REAL NOT NULL,
    avg_engagement_score REAL NOT NULL,
    avg_intent_score REAL NOT NULL,
    dominant_segment TEXT,
    segment_distribution TEXT NOT NULL,
    discrepancies TEXT NOT NULL,
    data_quality_score INTEGER NOT NULL CHECK (data_quality_score BETWEEN 0 AND 100),
    updated_at INTEGER NOT NULL
)
"#;

/// Insert-only analysis rows.
pub const CREATE_INSIGHTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS analytics_insights (
    id TEXT PRIMARY KEY,
    date_from TEXT NOT NULL,
    date_to TEXT NOT NULL,
    insight_type TEXT NOT NULL,
    executive_summary TEXT,
    key_findings TEXT NOT NULL,
    segment_performance TEXT NOT NULL,
    recommendations TEXT NOT NULL,
    citations TEXT NOT NULL,
    quality_flags TEXT NOT NULL,
    model_used TEXT,
    provider TEXT,
    prompt_tokens INTEGER,
    completion_tokens INTEGER,
    confidence_score REAL NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('completed', 'failed')),
    error TEXT,
    task_id TEXT,
    generated_at INTEGER NOT NULL
)
"#;

pub const CREATE_INSIGHTS_GUARDS: &str = r#"
CREATE INDEX IF NOT EXISTS idx_insights_generated ON analytics_insights (generated_at DESC);
CREATE TRIGGER IF NOT EXISTS analytics_insights_immutable
BEFORE UPDATE ON analytics_insights
BEGIN
    SELECT RAISE(ABORT, 'analytics_insights rows are immutable');
END;
"#;

/// Claimable work table.
pub const CREATE_QUEUE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS llm_processing_queue (
    id TEXT PRIMARY KEY,
    task_type TEXT NOT NULL CHECK (task_type IN ('normalize', 'feature', 'reconcile', 'analysis')),
    layer TEXT NOT NULL,
    input_ids TEXT NOT NULL,
    params TEXT NOT NULL DEFAULT '{}',
    priority INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL CHECK (max_attempts >= 1),
    status TEXT NOT NULL
        CHECK (status IN ('pending', 'processing', 'completed', 'failed', 'cancelled')),
    output_ids TEXT NOT NULL DEFAULT '[]',
    last_error TEXT,
    scheduled_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    dedupe_key TEXT UNIQUE
)
"#;

pub const CREATE_QUEUE_GUARDS: &str = r#"
CREATE INDEX IF NOT EXISTS idx_queue_claim
    ON llm_processing_queue (status, priority DESC, created_at);
CREATE INDEX IF NOT EXISTS idx_queue_run
    ON llm_processing_queue (json_extract(params, '$.run_id'), task_type, status);
CREATE INDEX IF NOT EXISTS idx_queue_completed ON llm_processing_queue (status, completed_at);
CREATE TRIGGER IF NOT EXISTS llm_processing_queue_no_delete
BEFORE DELETE ON llm_processing_queue
BEGIN
    SELECT RAISE(ABORT, 'queue tasks are never deleted');
END;
"#;

/// Processing ledger.
pub const CREATE_PROCESSING_LOGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS processing_logs (
    id TEXT PRIMARY KEY,
    operation TEXT NOT NULL,
    scope TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('success', 'partial', 'warning', 'failed')),
    records_processed INTEGER NOT NULL,
    records_failed INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    error TEXT,
    task_id TEXT,
    details TEXT,
    created_at INTEGER NOT NULL
)
"#;

pub const CREATE_PROCESSING_LOGS_GUARDS: &str = r#"
CREATE INDEX IF NOT EXISTS idx_processing_logs_created ON processing_logs (created_at DESC);
CREATE TRIGGER IF NOT EXISTS processing_logs_no_update
BEFORE UPDATE ON processing_logs
BEGIN
    SELECT RAISE(ABORT, 'processing_logs is append-only');
END;
CREATE TRIGGER IF NOT EXISTS processing_logs_no_delete
BEFORE DELETE ON processing_logs
BEGIN
    SELECT RAISE(ABORT, 'processing_logs is append-only');
END;
"#;

/// Returns all DDL statements in dependency order.
pub fn all_tables() -> Vec<&'static str> {
    vec![
        CREATE_RAW_EVENTS_TABLE,
        CREATE_RAW_EVENTS_INDEXES,
        CREATE_RAW_EVENTS_GUARDS,
        CREATE_NORMALIZED_EVENTS_TABLE,
        CREATE_NORMALIZED_EVENTS_INDEXES,
        CREATE_FEATURE_STORE_TABLE,
        CREATE_FEATURE_STORE_INDEXES,
        CREATE_USER_AGGREGATES_TABLE,
        CREATE_USER_AGGREGATES_INDEXES,
        CREATE_UNIFIED_METRICS_TABLE,
        CREATE_INSIGHTS_TABLE,
        CREATE_INSIGHTS_GUARDS,
        CREATE_QUEUE_TABLE,
        CREATE_QUEUE_GUARDS,
        CREATE_PROCESSING_LOGS_TABLE,
        CREATE_PROCESSING_LOGS_GUARDS,
    ]
}

/// Apply every DDL statement. Idempotent.
pub async fn init_schema(store: &Store) -> Result<()> {
    for ddl in all_tables() {
        sqlx::raw_sql(ddl).execute(store.pool()).await.map_err(db_err)?;
    }
    debug!("Store schema initialized");
    Ok(())
}
