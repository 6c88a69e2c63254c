//! ClickHouse table schemas for the mirror.
//!
//! The relational store stays authoritative. These tables exist for
//! long-range operational queries over stage executions and counters.

pub const CREATE_DATABASE: &str = "CREATE DATABASE IF NOT EXISTS lead_pipeline";

/// Mirror of the processing ledger.
pub const CREATE_PROCESSING_LOGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS lead_pipeline.processing_logs (
    id String,
    operation LowCardinality(String),
    scope String,
    status LowCardinality(String),
    records_processed UInt32,
    records_failed UInt32,
    duration_ms UInt64,
    error Nullable(String),
    task_id Nullable(String),
    details Nullable(String),
    created_at DateTime64(3)
)
ENGINE = MergeTree()
PARTITION BY toYYYYMM(created_at)
ORDER BY (operation, created_at, id)
TTL toDateTime(created_at) + INTERVAL 365 DAY
"#;

/// Periodic snapshots of in-process counters.
pub const CREATE_METRICS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS lead_pipeline.pipeline_metrics (
    timestamp DateTime64(3),
    raw_events_received UInt64,
    raw_events_rejected UInt64,
    events_normalized UInt64,
    events_skipped UInt64,
    normalization_failures UInt64,
    features_computed UInt64,
    feature_failures UInt64,
    score_clamps UInt64,
    days_reconciled UInt64,
    divergence_warnings UInt64,
    insights_generated UInt64,
    insights_failed UInt64,
    provider_errors UInt64,
    tokens_used UInt64,
    tasks_completed UInt64,
    tasks_failed UInt64,
    store_errors UInt64,
    task_latency_mean_ms Float64,
    provider_latency_mean_ms Float64,
    queue_depth UInt64
)
ENGINE = MergeTree()
ORDER BY timestamp
TTL toDateTime(timestamp) + INTERVAL 90 DAY
"#;

/// Returns all DDL statements in dependency order.
pub fn all_tables() -> Vec<&'static str> {
    vec![
        CREATE_DATABASE,
        CREATE_PROCESSING_LOGS_TABLE,
        CREATE_METRICS_TABLE,
    ]
}
