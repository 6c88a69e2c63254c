//! Work queue execution.
//!
//! Tasks are claimed with a conditional update, executed by the stage their
//! type names, and completed or failed back into the queue. A completed stage
//! enqueues the next one: normalize, feature, reconcile, then analysis when
//! the run asked for insights.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use pipeline_core::{
    DateRange, Error, Layer, LedgerEntry, NewTask, Operation, QueueTask, Result, TaskParams,
    TaskStatus, TaskType,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use store::Store;
use telemetry::metrics;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::features::FeatureEngine;
use crate::insight::InsightGenerator;
use crate::ledger::LedgerSink;
use crate::normalizer::Normalizer;
use crate::reconciler::{ReconcileOutcome, Reconciler};

/// Queue worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct QueueConfig {
    /// Size of the worker pool
    #[serde(default = "default_workers")]
    #[validate(range(min = 1, max = 64))]
    pub workers: usize,
    /// Idle wait between claims when the queue is empty
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 10))]
    pub poll_interval_ms: u64,
    /// Retry delay, multiplied by the attempt count
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Processing time after which a task is considered abandoned
    #[serde(default = "default_stale_timeout_secs")]
    #[validate(range(min = 1))]
    pub stale_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    #[validate(range(min = 1))]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
}

fn default_workers() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_retry_backoff_ms() -> u64 {
    5_000
}

fn default_stale_timeout_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    pipeline_core::limits::DEFAULT_MAX_ATTEMPTS
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            stale_timeout_secs: default_stale_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// What happened to a claimed task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed { output_ids: Vec<String> },
    /// Back to pending for another attempt
    Retrying { error: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskRun {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub attempt: u32,
    pub outcome: TaskOutcome,
}

/// Stage outputs plus the follow-up task, if any.
struct Executed {
    output_ids: Vec<String>,
    next: Option<NewTask>,
}

/// Claims and executes queue tasks.
#[derive(Clone)]
pub struct Orchestrator {
    store: Store,
    ledger: LedgerSink,
    normalizer: Normalizer,
    features: FeatureEngine,
    reconciler: Reconciler,
    insights: InsightGenerator,
    config: QueueConfig,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        ledger: LedgerSink,
        normalizer: Normalizer,
        features: FeatureEngine,
        reconciler: Reconciler,
        insights: InsightGenerator,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            normalizer,
            features,
            reconciler,
            insights,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// A task with the configured attempt ceiling.
    pub fn task(&self, task_type: TaskType, input_ids: Vec<String>) -> NewTask {
        NewTask::new(task_type, input_ids).with_max_attempts(self.config.max_attempts)
    }

    /// Insert a pending task. Returns without waiting for execution.
    pub async fn enqueue(&self, task: NewTask) -> Result<QueueTask> {
        let queued = self.store.enqueue_task(&task, Utc::now()).await?;
        debug!(
            task_id = %queued.id,
            task_type = %queued.task_type,
            inputs = queued.input_ids.len(),
            priority = queued.priority,
            "Task enqueued"
        );
        Ok(queued)
    }

    /// Insert the first tasks of a run in one transaction.
    pub async fn enqueue_all(&self, tasks: &[NewTask]) -> Result<Vec<QueueTask>> {
        let queued = self.store.enqueue_tasks(tasks, Utc::now()).await?;
        debug!(tasks = queued.len(), "Tasks enqueued");
        Ok(queued)
    }

    /// Claim and run the next runnable task. `None` when the queue is idle.
    pub async fn process_next(&self) -> Result<Option<TaskRun>> {
        let Some(task) = self.store.claim_next_task(Utc::now()).await? else {
            return Ok(None);
        };
        metrics().tasks_claimed.inc();
        metrics().workers_busy.inc();
        let start = Instant::now();

        let result = self.execute(&task).await;
        let outcome = self.settle(&task, result).await;

        metrics().task_latency_ms.observe(start.elapsed().as_millis() as u64);
        metrics().workers_busy.dec();

        Ok(Some(TaskRun {
            task_id: task.id,
            task_type: task.task_type,
            attempt: task.attempts,
            outcome: outcome?,
        }))
    }

    /// Run queued tasks until none is runnable. Returns the runs in order.
    pub async fn drain(&self) -> Result<Vec<TaskRun>> {
        let mut runs = Vec::new();
        while let Some(run) = self.process_next().await? {
            runs.push(run);
        }
        Ok(runs)
    }

    async fn settle(&self, task: &QueueTask, result: Result<Executed>) -> Result<TaskOutcome> {
        let now = Utc::now();
        match result {
            Ok(executed) => {
                let completion = self
                    .store
                    .complete_task_with_follow_up(
                        task.id,
                        &executed.output_ids,
                        executed.next.as_ref(),
                        now,
                    )
                    .await?;
                if !completion.completed {
                    warn!(task_id = %task.id, "Task was reclaimed before completion, follow-up dropped");
                    return Ok(TaskOutcome::Retrying {
                        error: "reclaimed before completion".to_string(),
                    });
                }
                if let Some(next) = &completion.enqueued {
                    debug!(
                        task_id = %next.id,
                        task_type = %next.task_type,
                        inputs = next.input_ids.len(),
                        "Follow-up task enqueued"
                    );
                }

                metrics().tasks_completed.inc();
                info!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    outputs = executed.output_ids.len(),
                    "Task completed"
                );
                Ok(TaskOutcome::Completed {
                    output_ids: executed.output_ids,
                })
            }
            Err(e) => {
                let error = e.to_string();
                let retryable = e.is_retryable();
                let updated = self
                    .store
                    .fail_task(task.id, &error, retryable, self.config.retry_backoff(), now)
                    .await?;

                match updated {
                    Some(updated) if updated.status == TaskStatus::Failed => {
                        metrics().tasks_failed.inc();
                        warn!(
                            task_id = %task.id,
                            task_type = %task.task_type,
                            attempts = updated.attempts,
                            error = %error,
                            "Task failed"
                        );
                        self.on_final_failure(&updated).await;
                        Ok(TaskOutcome::Failed { error })
                    }
                    Some(_) => {
                        metrics().tasks_retried.inc();
                        warn!(
                            task_id = %task.id,
                            task_type = %task.task_type,
                            attempt = task.attempts,
                            error = %error,
                            "Task failed, will retry"
                        );
                        Ok(TaskOutcome::Retrying { error })
                    }
                    None => {
                        warn!(task_id = %task.id, error = %error, "Task was reclaimed before failure was recorded");
                        Ok(TaskOutcome::Retrying { error })
                    }
                }
            }
        }
    }

    /// Analysis tasks leave a failed insight behind when they give up. A run
    /// whose last normalize or feature task gives up still reconciles.
    async fn on_final_failure(&self, task: &QueueTask) {
        match task.task_type {
            TaskType::Analysis => {
                let error = task.last_error.as_deref().unwrap_or("analysis failed");
                let recorded = match analysis_range(task) {
                    Ok(range) => self.insights.record_failure(range, Some(task.id), error).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = recorded {
                    warn!(task_id = %task.id, error = %e, "Failed to record failed insight");
                }
            }
            TaskType::Normalize | TaskType::Feature => {
                let Some(next) = self.reconcile_follow_up(task, BTreeSet::new()) else {
                    return;
                };
                match self.store.enqueue_follow_up(&next, Utc::now()).await {
                    Ok(Some(queued)) => {
                        debug!(task_id = %queued.id, "Run reconcile enqueued after failure")
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "Failed to enqueue run reconcile")
                    }
                }
            }
            TaskType::Reconcile => {}
        }
    }

    async fn execute(&self, task: &QueueTask) -> Result<Executed> {
        match task.task_type {
            TaskType::Normalize => self.run_normalize(task).await,
            TaskType::Feature => self.run_feature(task).await,
            TaskType::Reconcile => self.run_reconcile(task).await,
            TaskType::Analysis => self.run_analysis(task).await,
        }
    }

    async fn run_normalize(&self, task: &QueueTask) -> Result<Executed> {
        let raw_ids = parse_uuids(&task.input_ids)?;
        let report = self.normalizer.normalize_batch(&raw_ids, Some(task.id)).await;

        let output_ids: Vec<String> = report.event_ids.iter().map(Uuid::to_string).collect();
        let next = self.follow_up(task, TaskType::Feature, output_ids.clone(), Layer::Normalized);
        Ok(Executed {
            output_ids,
            next: Some(next),
        })
    }

    async fn run_feature(&self, task: &QueueTask) -> Result<Executed> {
        let event_ids = parse_uuids(&task.input_ids)?;
        let report = self.features.process_batch(&event_ids, Some(task.id)).await?;

        Ok(Executed {
            output_ids: report.feature_ids.iter().map(Uuid::to_string).collect(),
            next: self.reconcile_follow_up(task, report.dates),
        })
    }

    /// Reconcile over the run's range plus the event dates seen. A run gets a
    /// single reconcile once all of its normalize and feature tasks settle.
    fn reconcile_follow_up(&self, task: &QueueTask, event_dates: BTreeSet<NaiveDate>) -> Option<NewTask> {
        // Days without events are still reconciled so they are marked unavailable.
        let mut dates = event_dates;
        if let Some(range) = task.params.date_range {
            dates.extend(range.dates());
        }
        if dates.is_empty() {
            return None;
        }
        let date_ids = dates.iter().map(NaiveDate::to_string).collect();
        Some(
            self.follow_up(task, TaskType::Reconcile, date_ids, Layer::Feature)
                .once_per_run(),
        )
    }

    async fn run_reconcile(&self, task: &QueueTask) -> Result<Executed> {
        let mut dates: BTreeSet<NaiveDate> = parse_dates(&task.input_ids)?.into_iter().collect();
        // Sessions of the run can fall outside its range when their raw event
        // had no declared range.
        if let Some(run_id) = task.params.run_id {
            dates.extend(self.store.run_event_dates(run_id).await?);
        }
        let mut output_ids = Vec::new();
        let mut deferred = Vec::new();

        for date in dates {
            match self.reconciler.reconcile_date(date, Some(task.id)).await? {
                ReconcileOutcome::Written(_) | ReconcileOutcome::Unchanged => {
                    output_ids.push(date.to_string())
                }
                ReconcileOutcome::Deferred { pending } => deferred.push((date, pending)),
                ReconcileOutcome::NoData => {}
            }
        }

        if !deferred.is_empty() {
            let dates: Vec<String> = deferred.iter().map(|(d, _)| d.to_string()).collect();
            return Err(Error::internal(format!(
                "raw events still pending for {}",
                dates.join(", ")
            )));
        }

        let next = match task.params.date_range {
            Some(range) if task.params.run_insights && !output_ids.is_empty() => {
                let ids = vec![range.date_from.to_string(), range.date_to.to_string()];
                Some(self.follow_up(task, TaskType::Analysis, ids, Layer::Unified).once_per_run())
            }
            _ => None,
        };
        Ok(Executed { output_ids, next })
    }

    async fn run_analysis(&self, task: &QueueTask) -> Result<Executed> {
        let range = analysis_range(task)?;
        let insight = self.insights.generate(range, Some(task.id)).await?;
        Ok(Executed {
            output_ids: vec![insight.id.to_string()],
            next: None,
        })
    }

    fn follow_up(
        &self,
        task: &QueueTask,
        task_type: TaskType,
        input_ids: Vec<String>,
        layer: Layer,
    ) -> NewTask {
        self.task(task_type, input_ids)
            .with_layer(layer)
            .with_priority(task.priority)
            .with_params(task.params.clone())
    }

    /// Return abandoned `processing` tasks to the queue.
    pub async fn sweep_stale(&self) -> Result<Vec<QueueTask>> {
        let start = Instant::now();
        let reclaimed = self
            .store
            .reclaim_stale_tasks(self.config.stale_timeout(), Utc::now())
            .await?;
        if reclaimed.is_empty() {
            return Ok(reclaimed);
        }

        let failed: Vec<&QueueTask> = reclaimed
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .collect();
        metrics().tasks_reclaimed.inc_by(reclaimed.len() as u64);
        metrics().tasks_failed.inc_by(failed.len() as u64);
        for task in &failed {
            self.on_final_failure(task).await;
        }

        warn!(
            reclaimed = reclaimed.len(),
            failed = failed.len(),
            timeout_secs = self.config.stale_timeout_secs,
            "Reclaimed stale tasks"
        );

        let ids: Vec<String> = reclaimed.iter().map(|t| t.id.to_string()).collect();
        let entry = LedgerEntry::new(Operation::QueueSweep, "llm_processing_queue")
            .counts((reclaimed.len() - failed.len()) as u32, failed.len() as u32)
            .elapsed(start.elapsed())
            .details(json!({ "task_ids": ids }));
        self.ledger.record(entry).await;

        Ok(reclaimed)
    }
}

fn parse_uuids(ids: &[String]) -> Result<Vec<Uuid>> {
    ids.iter()
        .map(|id| Uuid::from_str(id).map_err(|e| Error::validation(format!("invalid id {id}: {e}"))))
        .collect()
}

fn parse_dates(ids: &[String]) -> Result<Vec<NaiveDate>> {
    ids.iter()
        .map(|id| {
            NaiveDate::parse_from_str(id, "%Y-%m-%d")
                .map_err(|e| Error::validation(format!("invalid date {id}: {e}")))
        })
        .collect()
}

/// The run's range, else the span of the task's input dates.
fn analysis_range(task: &QueueTask) -> Result<DateRange> {
    if let Some(range) = task.params.date_range {
        return Ok(range);
    }
    let dates = parse_dates(&task.input_ids)?;
    match (dates.iter().min(), dates.iter().max()) {
        (Some(from), Some(to)) => DateRange::new(*from, *to),
        _ => Err(Error::validation("analysis task has no date range")),
    }
}

/// Parameters for the first task of a pipeline run.
pub fn run_params(range: DateRange, run_insights: bool) -> TaskParams {
    TaskParams {
        date_range: Some(range),
        run_insights,
        run_id: Some(Uuid::new_v4()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn queued(input_ids: &[&str], params: TaskParams) -> QueueTask {
        let store = Store::in_memory().await.unwrap();
        let task = NewTask::new(
            TaskType::Analysis,
            input_ids.iter().map(|s| s.to_string()).collect(),
        )
        .with_params(params);
        store.enqueue_task(&task, Utc::now()).await.unwrap()
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn test_analysis_range_prefers_run_range() {
        let range = DateRange::new(day("2024-01-01"), day("2024-01-31")).unwrap();
        let task = queued(&["2024-01-05"], run_params(range, true)).await;
        assert_eq!(analysis_range(&task).unwrap(), range);
    }

    #[tokio::test]
    async fn test_analysis_range_spans_input_dates() {
        let task = queued(
            &["2024-02-10", "2024-02-03", "2024-02-07"],
            TaskParams::default(),
        )
        .await;
        let range = analysis_range(&task).unwrap();
        assert_eq!(range.date_from, day("2024-02-03"));
        assert_eq!(range.date_to, day("2024-02-10"));
    }

    #[tokio::test]
    async fn test_analysis_range_rejects_bad_inputs() {
        let empty = queued(&[], TaskParams::default()).await;
        assert_eq!(analysis_range(&empty).unwrap_err().http_status(), 400);

        let garbage = queued(&["yesterday"], TaskParams::default()).await;
        assert_eq!(analysis_range(&garbage).unwrap_err().http_status(), 400);
    }

    #[test]
    fn test_parse_uuids() {
        let id = Uuid::new_v4();
        assert_eq!(parse_uuids(&[id.to_string()]).unwrap(), vec![id]);
        assert!(parse_uuids(&["not-a-uuid".to_string()]).is_err());
    }

    #[test]
    fn test_run_params_groups_run() {
        let range = DateRange::day(day("2024-03-01"));
        let a = run_params(range, false);
        let b = run_params(range, false);
        assert_eq!(a.date_range, Some(range));
        assert!(!a.run_insights);
        assert_ne!(a.run_id, b.run_id);
    }
}
