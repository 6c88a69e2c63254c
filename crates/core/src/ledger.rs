//! Processing ledger entries.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Stage that produced a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Ingest,
    Normalize,
    Feature,
    Reconcile,
    Analysis,
    QueueSweep,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Normalize => "normalize",
            Self::Feature => "feature",
            Self::Reconcile => "reconcile",
            Self::Analysis => "analysis",
            Self::QueueSweep => "queue_sweep",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ingest" => Ok(Self::Ingest),
            "normalize" => Ok(Self::Normalize),
            "feature" => Ok(Self::Feature),
            "reconcile" => Ok(Self::Reconcile),
            "analysis" => Ok(Self::Analysis),
            "queue_sweep" => Ok(Self::QueueSweep),
            other => Err(Error::validation(format!("unknown operation: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Success,
    /// Some records failed, the rest went through
    Partial,
    /// Completed but with a condition operators should see
    Warning,
    Failed,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Warning => "warning",
            Self::Failed => "failed",
        }
    }

    /// Status derived from record counts.
    pub fn from_counts(processed: u32, failed: u32) -> Self {
        match (processed, failed) {
            (_, 0) => Self::Success,
            (0, _) => Self::Failed,
            _ => Self::Partial,
        }
    }
}

impl FromStr for LedgerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "warning" => Ok(Self::Warning),
            "failed" => Ok(Self::Failed),
            other => Err(Error::validation(format!("unknown ledger status: {other}"))),
        }
    }
}

/// One stage execution record. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub operation: Operation,
    /// Source name, layer, or date the execution covered
    pub scope: String,
    pub status: LedgerStatus,
    pub records_processed: u32,
    pub records_failed: u32,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub task_id: Option<Uuid>,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(operation: Operation, scope: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            scope: scope.into(),
            status: LedgerStatus::Success,
            records_processed: 0,
            records_failed: 0,
            duration_ms: 0,
            error: None,
            task_id: None,
            details: None,
            created_at: Utc::now(),
        }
    }

    /// Set counts and derive status from them.
    pub fn counts(mut self, processed: u32, failed: u32) -> Self {
        self.records_processed = processed;
        self.records_failed = failed;
        self.status = LedgerStatus::from_counts(processed, failed);
        self
    }

    pub fn status(mut self, status: LedgerStatus) -> Self {
        self.status = status;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.duration_ms = elapsed.as_millis() as u64;
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_counts() {
        assert_eq!(LedgerStatus::from_counts(5, 0), LedgerStatus::Success);
        assert_eq!(LedgerStatus::from_counts(0, 0), LedgerStatus::Success);
        assert_eq!(LedgerStatus::from_counts(4, 1), LedgerStatus::Partial);
        assert_eq!(LedgerStatus::from_counts(0, 3), LedgerStatus::Failed);
    }

    #[test]
    fn test_builder_overrides_status() {
        let entry = LedgerEntry::new(Operation::Reconcile, "2024-03-01")
            .counts(1, 0)
            .status(LedgerStatus::Warning)
            .error("sessions diverge by 16.7%");
        assert_eq!(entry.status, LedgerStatus::Warning);
        assert_eq!(entry.scope, "2024-03-01");
    }
}
