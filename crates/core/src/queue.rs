//! Work queue task types and state machine.
//!
//! `pending -> processing -> {completed | pending (retry) | failed}`.
//! Tasks are never deleted.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::DateRange;
use crate::limits::{DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Normalize,
    Feature,
    Reconcile,
    Analysis,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normalize => "normalize",
            Self::Feature => "feature",
            Self::Reconcile => "reconcile",
            Self::Analysis => "analysis",
        }
    }

    /// Layer the task reads from.
    pub fn input_layer(&self) -> Layer {
        match self {
            Self::Normalize => Layer::Raw,
            Self::Feature => Layer::Normalized,
            Self::Reconcile => Layer::Feature,
            Self::Analysis => Layer::Unified,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normalize" => Ok(Self::Normalize),
            "feature" => Ok(Self::Feature),
            "reconcile" => Ok(Self::Reconcile),
            "analysis" => Ok(Self::Analysis),
            other => Err(Error::validation(format!("unknown task type: {other}"))),
        }
    }
}

/// Pipeline layer. Also used to route providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Raw,
    Normalized,
    Feature,
    Unified,
}

impl Layer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Normalized => "normalized",
            Self::Feature => "feature",
            Self::Unified => "unified",
        }
    }
}

impl FromStr for Layer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(Self::Raw),
            "normalized" => Ok(Self::Normalized),
            "feature" => Ok(Self::Feature),
            "unified" => Ok(Self::Unified),
            other => Err(Error::validation(format!("unknown layer: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::validation(format!("unknown task status: {other}"))),
        }
    }
}

/// Run-level parameters carried by every task of one pipeline trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    /// Range the triggering run covers
    pub date_range: Option<DateRange>,
    /// Enqueue analysis once reconciliation completes
    #[serde(default)]
    pub run_insights: bool,
    /// Groups tasks of one trigger
    pub run_id: Option<Uuid>,
}

/// Request to enqueue a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: TaskType,
    pub layer: Layer,
    pub input_ids: Vec<String>,
    pub params: TaskParams,
    pub priority: i32,
    pub max_attempts: u32,
    /// At most one task is ever enqueued per key
    pub dedupe_key: Option<String>,
    /// Held back while normalize or feature tasks of the same run are
    /// pending or processing; the last of them to settle enqueues it.
    pub fan_in: bool,
}

impl NewTask {
    pub fn new(task_type: TaskType, input_ids: Vec<String>) -> Self {
        Self {
            task_type,
            layer: task_type.input_layer(),
            input_ids,
            params: TaskParams::default(),
            priority: DEFAULT_PRIORITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            dedupe_key: None,
            fan_in: false,
        }
    }

    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layer = layer;
        self
    }

    pub fn with_params(mut self, params: TaskParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Make this the single task of its type for the run, enqueued once the
    /// run's normalize and feature tasks have all settled. No effect without
    /// a run id.
    pub fn once_per_run(mut self) -> Self {
        if let Some(run_id) = self.params.run_id {
            self.dedupe_key = Some(format!("{run_id}:{}", self.task_type));
            self.fan_in = true;
        }
        self
    }
}

/// One unit of orchestrated work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueTask {
    pub id: Uuid,
    pub task_type: TaskType,
    pub layer: Layer,
    /// Raw/normalized event ids, feature ids or dates, by task type
    pub input_ids: Vec<String>,
    pub params: TaskParams,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: TaskStatus,
    pub output_ids: Vec<String>,
    pub last_error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueTask {
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Queue counters. Always answerable, even when every recent task failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: u64,
    pub processing: u64,
    pub completed_today: u64,
    pub failed_today: u64,
}
