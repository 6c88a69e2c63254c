//! Batch insert helpers for the ClickHouse mirror.

use crate::client::ClickHouseClient;
use clickhouse::Row;
use pipeline_core::{Error, LedgerEntry, Result};
use serde::Serialize;
use telemetry::{metrics, MetricsSnapshot};
use tracing::debug;

/// Flattened ledger row.
#[derive(Debug, Clone, Row, Serialize)]
pub struct LedgerRow {
    pub id: String,
    pub operation: String,
    pub scope: String,
    pub status: String,
    pub records_processed: u32,
    pub records_failed: u32,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub task_id: Option<String>,
    pub details: Option<String>,
    pub created_at: i64, // DateTime64(3) as milliseconds
}

impl From<&LedgerEntry> for LedgerRow {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            operation: entry.operation.as_str().to_string(),
            scope: entry.scope.clone(),
            status: entry.status.as_str().to_string(),
            records_processed: entry.records_processed,
            records_failed: entry.records_failed,
            duration_ms: entry.duration_ms,
            error: entry.error.clone(),
            task_id: entry.task_id.map(|id| id.to_string()),
            details: entry.details.as_ref().map(|d| d.to_string()),
            created_at: entry.created_at.timestamp_millis(),
        }
    }
}

/// Insert a batch of ledger entries.
pub async fn insert_ledger_entries(
    client: &ClickHouseClient,
    entries: &[LedgerEntry],
) -> Result<usize> {
    if entries.is_empty() {
        return Ok(0);
    }

    let count = entries.len();
    let start = std::time::Instant::now();

    let mut insert = client
        .inner()
        .insert("lead_pipeline.processing_logs")
        .map_err(|e| {
            metrics().clickhouse_insert_errors.inc();
            Error::internal(format!("Insert error: {}", e))
        })?;

    for entry in entries {
        insert.write(&LedgerRow::from(entry)).await.map_err(|e| {
            metrics().clickhouse_insert_errors.inc();
            Error::internal(format!("Write error: {}", e))
        })?;
    }

    insert.end().await.map_err(|e| {
        metrics().clickhouse_insert_errors.inc();
        Error::internal(format!("End error: {}", e))
    })?;

    let elapsed = start.elapsed();
    metrics().clickhouse_latency_ms.observe(elapsed.as_millis() as u64);
    metrics().clickhouse_inserts.inc();

    debug!(
        count = count,
        latency_ms = %elapsed.as_millis(),
        "Mirrored ledger entries to ClickHouse"
    );

    Ok(count)
}

/// Pipeline metrics row.
#[derive(Debug, Clone, Row, Serialize)]
pub struct MetricsRow {
    pub timestamp: i64,
    pub raw_events_received: u64,
    pub raw_events_rejected: u64,
    pub events_normalized: u64,
    pub events_skipped: u64,
    pub normalization_failures: u64,
    pub features_computed: u64,
    pub feature_failures: u64,
    pub score_clamps: u64,
    pub days_reconciled: u64,
    pub divergence_warnings: u64,
    pub insights_generated: u64,
    pub insights_failed: u64,
    pub provider_errors: u64,
    pub tokens_used: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub store_errors: u64,
    pub task_latency_mean_ms: f64,
    pub provider_latency_mean_ms: f64,
    pub queue_depth: u64,
}

impl From<MetricsSnapshot> for MetricsRow {
    fn from(snapshot: MetricsSnapshot) -> Self {
        Self {
            timestamp: snapshot.timestamp.timestamp_millis(),
            raw_events_received: snapshot.raw_events_received,
            raw_events_rejected: snapshot.raw_events_rejected,
            events_normalized: snapshot.events_normalized,
            events_skipped: snapshot.events_skipped,
            normalization_failures: snapshot.normalization_failures,
            features_computed: snapshot.features_computed,
            feature_failures: snapshot.feature_failures,
            score_clamps: snapshot.score_clamps,
            days_reconciled: snapshot.days_reconciled,
            divergence_warnings: snapshot.divergence_warnings,
            insights_generated: snapshot.insights_generated,
            insights_failed: snapshot.insights_failed,
            provider_errors: snapshot.provider_errors,
            tokens_used: snapshot.tokens_used,
            tasks_completed: snapshot.tasks_completed,
            tasks_failed: snapshot.tasks_failed,
            store_errors: snapshot.store_errors,
            task_latency_mean_ms: snapshot.task_latency_mean_ms,
            provider_latency_mean_ms: snapshot.provider_latency_mean_ms,
            queue_depth: snapshot.queue_depth,
        }
    }
}

/// Insert a metrics snapshot.
pub async fn insert_metrics(client: &ClickHouseClient, snapshot: MetricsSnapshot) -> Result<()> {
    let row = MetricsRow::from(snapshot);

    let mut insert = client
        .inner()
        .insert("lead_pipeline.pipeline_metrics")
        .map_err(|e| Error::internal(format!("Insert error: {}", e)))?;

    insert
        .write(&row)
        .await
        .map_err(|e| Error::internal(format!("Write error: {}", e)))?;

    insert
        .end()
        .await
        .map_err(|e| Error::internal(format!("End error: {}", e)))?;

    Ok(())
}
