//! Processing ledger. Append-only.

use pipeline_core::{LedgerEntry, Operation, Result};
use sqlx::FromRow;
use uuid::Uuid;

use crate::client::{db_err, from_json, from_ms, parse_enum, parse_uuid, to_json, to_ms, u32_col, Store};

const LEDGER_COLUMNS: &str = "id, operation, scope, status, records_processed, records_failed, \
     duration_ms, error, task_id, details, created_at";

#[derive(Debug, FromRow)]
struct LedgerRow {
    id: String,
    operation: String,
    scope: String,
    status: String,
    records_processed: i64,
    records_failed: i64,
    duration_ms: i64,
    error: Option<String>,
    task_id: Option<String>,
    details: Option<String>,
    created_at: i64,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = pipeline_core::Error;

    fn try_from(row: LedgerRow) -> Result<Self> {
        Ok(LedgerEntry {
            id: parse_uuid(&row.id)?,
            operation: parse_enum(&row.operation)?,
            scope: row.scope,
            status: parse_enum(&row.status)?,
            records_processed: u32_col(row.records_processed),
            records_failed: u32_col(row.records_failed),
            duration_ms: row.duration_ms.max(0) as u64,
            error: row.error,
            task_id: row.task_id.as_deref().map(parse_uuid).transpose()?,
            details: row
                .details
                .as_deref()
                .map(|s| from_json("details", s))
                .transpose()?,
            created_at: from_ms(row.created_at)?,
        })
    }
}

impl Store {
    pub async fn append_ledger(&self, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO processing_logs ({LEDGER_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(entry.id.to_string())
        .bind(entry.operation.as_str())
        .bind(&entry.scope)
        .bind(entry.status.as_str())
        .bind(entry.records_processed as i64)
        .bind(entry.records_failed as i64)
        .bind(entry.duration_ms as i64)
        .bind(&entry.error)
        .bind(entry.task_id.map(|id| id.to_string()))
        .bind(entry.details.as_ref().map(to_json).transpose()?)
        .bind(to_ms(entry.created_at))
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Newest first, optionally filtered by operation.
    pub async fn recent_ledger(
        &self,
        operation: Option<Operation>,
        limit: u32,
    ) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {LEDGER_COLUMNS} FROM processing_logs \
             WHERE ?1 IS NULL OR operation = ?1 \
             ORDER BY created_at DESC, rowid DESC LIMIT ?2"
        ))
        .bind(operation.map(|op| op.as_str()))
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    pub async fn ledger_for_task(&self, task_id: Uuid) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {LEDGER_COLUMNS} FROM processing_logs WHERE task_id = ? \
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(task_id.to_string())
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(LedgerEntry::try_from).collect()
    }
}
