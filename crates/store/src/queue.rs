//! Claimable work queue.
//!
//! Every transition is a conditional UPDATE on the current status, so any
//! number of workers can poll the same table without double-processing.
//! Follow-up tasks are inserted in the same transaction that completes their
//! parent, so a reclaimed parent never leaves a duplicate chain behind.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use pipeline_core::{
    DbErrorCode, Error, NewTask, QueueStatus, QueueTask, Result, TaskParams, TaskStatus,
};
use sqlx::{FromRow, SqliteConnection};
use uuid::Uuid;

use crate::client::{
    day_start_ms, db_err, from_json, from_ms, opt_from_ms, parse_date, parse_enum, parse_uuid,
    to_json, to_ms, u32_col, Store,
};

const TASK_COLUMNS: &str = "id, task_type, layer, input_ids, params, priority, attempts, \
     max_attempts, status, output_ids, last_error, scheduled_at, started_at, completed_at, \
     created_at, updated_at";

#[derive(Debug, FromRow)]
struct TaskRow {
    id: String,
    task_type: String,
    layer: String,
    input_ids: String,
    params: String,
    priority: i64,
    attempts: i64,
    max_attempts: i64,
    status: String,
    output_ids: String,
    last_error: Option<String>,
    scheduled_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<TaskRow> for QueueTask {
    type Error = pipeline_core::Error;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(QueueTask {
            id: parse_uuid(&row.id)?,
            task_type: parse_enum(&row.task_type)?,
            layer: parse_enum(&row.layer)?,
            input_ids: from_json("input_ids", &row.input_ids)?,
            params: from_json::<TaskParams>("params", &row.params)?,
            priority: row.priority as i32,
            attempts: u32_col(row.attempts),
            max_attempts: u32_col(row.max_attempts),
            status: parse_enum(&row.status)?,
            output_ids: from_json("output_ids", &row.output_ids)?,
            last_error: row.last_error,
            scheduled_at: from_ms(row.scheduled_at)?,
            started_at: opt_from_ms(row.started_at)?,
            completed_at: opt_from_ms(row.completed_at)?,
            created_at: from_ms(row.created_at)?,
            updated_at: from_ms(row.updated_at)?,
        })
    }
}

impl Store {
    /// Insert a pending task runnable immediately.
    ///
    /// Fails with a conflict when the task's dedupe key was already used.
    pub async fn enqueue_task(&self, task: &NewTask, now: DateTime<Utc>) -> Result<QueueTask> {
        let mut conn = self.pool().acquire().await.map_err(db_err)?;
        insert_task_on(&mut conn, task, now).await?.ok_or_else(|| {
            Error::database(
                DbErrorCode::Conflict,
                format!("task {} already enqueued", task.dedupe_key.as_deref().unwrap_or("")),
            )
        })
    }

    /// Insert several tasks atomically, so no worker sees part of a run.
    pub async fn enqueue_tasks(&self, tasks: &[NewTask], now: DateTime<Utc>) -> Result<Vec<QueueTask>> {
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        let mut queued = Vec::with_capacity(tasks.len());
        for task in tasks {
            let inserted = insert_task_on(&mut tx, task, now).await?.ok_or_else(|| {
                Error::database(
                    DbErrorCode::Conflict,
                    format!("task {} already enqueued", task.dedupe_key.as_deref().unwrap_or("")),
                )
            })?;
            queued.push(inserted);
        }
        tx.commit().await.map_err(db_err)?;
        Ok(queued)
    }

    /// Insert a follow-up task unless its dedupe key was already used or,
    /// for a fan-in task, its run still has outstanding stage tasks.
    pub async fn enqueue_follow_up(
        &self,
        task: &NewTask,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueTask>> {
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        // The insert takes the write lock before the run is inspected.
        let Some(queued) = insert_task_on(&mut tx, task, now).await? else {
            return Ok(None);
        };
        if fan_in_blocked(&mut tx, task).await? {
            tx.rollback().await.map_err(db_err)?;
            return Ok(None);
        }
        tx.commit().await.map_err(db_err)?;
        Ok(Some(queued))
    }

    /// Atomically claim the oldest highest-priority runnable task.
    ///
    /// The claim increments `attempts`. Returns `None` when nothing is runnable.
    pub async fn claim_next_task(&self, now: DateTime<Utc>) -> Result<Option<QueueTask>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            UPDATE llm_processing_queue
            SET status = 'processing', attempts = attempts + 1, started_at = ?1, updated_at = ?1
            WHERE id = (
                SELECT id FROM llm_processing_queue
                WHERE status = 'pending' AND scheduled_at <= ?1
                ORDER BY priority DESC, created_at ASC, rowid ASC
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(to_ms(now))
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;
        row.map(QueueTask::try_from).transpose()
    }

    /// `processing -> completed`, enqueueing the follow-up in the same transaction.
    ///
    /// The follow-up is only inserted when the completion applied, its dedupe
    /// key is unused and, for a fan-in task, the run has nothing outstanding.
    pub async fn complete_task_with_follow_up(
        &self,
        id: Uuid,
        output_ids: &[String],
        next: Option<&NewTask>,
        now: DateTime<Utc>,
    ) -> Result<Completion> {
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        if !complete_task_on(&mut tx, id, output_ids, now).await? {
            tx.rollback().await.map_err(db_err)?;
            return Ok(Completion::default());
        }

        let mut enqueued = None;
        if let Some(next) = next {
            if !fan_in_blocked(&mut tx, next).await? {
                enqueued = insert_task_on(&mut tx, next, now).await?;
            }
        }
        tx.commit().await.map_err(db_err)?;
        Ok(Completion {
            completed: true,
            enqueued,
        })
    }

    /// Event dates of the normalized events the run's feature tasks were given.
    pub async fn run_event_dates(&self, run_id: Uuid) -> Result<Vec<NaiveDate>> {
        let dates: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT n.event_date
            FROM llm_processing_queue q, json_each(q.input_ids) j
            JOIN normalized_events n ON n.id = j.value
            WHERE q.task_type = 'feature' AND json_extract(q.params, '$.run_id') = ?
            ORDER BY n.event_date
            "#,
        )
        .bind(run_id.to_string())
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        dates.iter().map(|d| parse_date(d)).collect()
    }

    /// `processing -> pending` below the attempt ceiling, else `processing -> failed`.
    ///
    /// Non-retryable failures go straight to `failed`. Retries are scheduled
    /// `backoff * attempts` into the future. Returns the updated task, or
    /// `None` if it was no longer processing.
    pub async fn fail_task(
        &self,
        id: Uuid,
        error: &str,
        retryable: bool,
        backoff: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueTask>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            UPDATE llm_processing_queue
            SET status = CASE WHEN ?1 = 0 OR attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                completed_at = CASE WHEN ?1 = 0 OR attempts >= max_attempts THEN ?3 ELSE NULL END,
                scheduled_at = ?3 + ?4 * attempts,
                last_error = ?2,
                updated_at = ?3
            WHERE id = ?5 AND status = 'processing'
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(retryable)
        .bind(error)
        .bind(to_ms(now))
        .bind(backoff.as_millis() as i64)
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;
        row.map(QueueTask::try_from).transpose()
    }

    /// Return tasks stuck in `processing` since before `now - timeout` to `pending`,
    /// or to `failed` when their attempts are exhausted.
    pub async fn reclaim_stale_tasks(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueTask>> {
        let cutoff = to_ms(now) - timeout.as_millis() as i64;
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            UPDATE llm_processing_queue
            SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                completed_at = CASE WHEN attempts >= max_attempts THEN ?1 ELSE NULL END,
                last_error = 'processing timed out after ' || ?3 || 's',
                scheduled_at = ?1,
                updated_at = ?1
            WHERE status = 'processing' AND started_at <= ?2
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(to_ms(now))
        .bind(cutoff)
        .bind(timeout.as_secs() as i64)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(QueueTask::try_from).collect()
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Option<QueueTask>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM llm_processing_queue WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;
        row.map(QueueTask::try_from).transpose()
    }

    /// Tasks with a status, newest first.
    pub async fn tasks_with_status(&self, status: TaskStatus, limit: u32) -> Result<Vec<QueueTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM llm_processing_queue WHERE status = ? \
             ORDER BY updated_at DESC, rowid DESC LIMIT ?"
        ))
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(QueueTask::try_from).collect()
    }

    /// Counters for the current UTC day.
    pub async fn queue_status(&self, now: DateTime<Utc>) -> Result<QueueStatus> {
        let (pending, processing, completed_today, failed_today): (i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COALESCE(SUM(status = 'pending'), 0),
                    COALESCE(SUM(status = 'processing'), 0),
                    COALESCE(SUM(status = 'completed' AND completed_at >= ?1), 0),
                    COALESCE(SUM(status = 'failed' AND completed_at >= ?1), 0)
                FROM llm_processing_queue
                "#,
            )
            .bind(day_start_ms(now))
            .fetch_one(self.pool())
            .await
            .map_err(db_err)?;

        Ok(QueueStatus {
            pending: pending.max(0) as u64,
            processing: processing.max(0) as u64,
            completed_today: completed_today.max(0) as u64,
            failed_today: failed_today.max(0) as u64,
        })
    }
}

/// Outcome of [`Store::complete_task_with_follow_up`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    /// False when the task was no longer processing
    pub completed: bool,
    pub enqueued: Option<QueueTask>,
}

async fn complete_task_on(
    conn: &mut SqliteConnection,
    id: Uuid,
    output_ids: &[String],
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE llm_processing_queue
        SET status = 'completed', output_ids = ?1, last_error = NULL,
            completed_at = ?2, updated_at = ?2
        WHERE id = ?3 AND status = 'processing'
        "#,
    )
    .bind(to_json(&output_ids)?)
    .bind(to_ms(now))
    .bind(id.to_string())
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(result.rows_affected() == 1)
}

/// Insert a pending task. `None` when its dedupe key is taken.
async fn insert_task_on(
    conn: &mut SqliteConnection,
    task: &NewTask,
    now: DateTime<Utc>,
) -> Result<Option<QueueTask>> {
    let queued = QueueTask {
        id: Uuid::new_v4(),
        task_type: task.task_type,
        layer: task.layer,
        input_ids: task.input_ids.clone(),
        params: task.params.clone(),
        priority: task.priority,
        attempts: 0,
        max_attempts: task.max_attempts.max(1),
        status: TaskStatus::Pending,
        output_ids: Vec::new(),
        last_error: None,
        scheduled_at: now,
        started_at: None,
        completed_at: None,
        created_at: now,
        updated_at: now,
    };

    let result = sqlx::query(&format!(
        "INSERT INTO llm_processing_queue ({TASK_COLUMNS}, dedupe_key) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (dedupe_key) DO NOTHING"
    ))
    .bind(queued.id.to_string())
    .bind(queued.task_type.as_str())
    .bind(queued.layer.as_str())
    .bind(to_json(&queued.input_ids)?)
    .bind(to_json(&queued.params)?)
    .bind(queued.priority as i64)
    .bind(0_i64)
    .bind(queued.max_attempts as i64)
    .bind(queued.status.as_str())
    .bind("[]")
    .bind(None::<String>)
    .bind(to_ms(now))
    .bind(None::<i64>)
    .bind(None::<i64>)
    .bind(to_ms(now))
    .bind(to_ms(now))
    .bind(task.dedupe_key.as_deref())
    .execute(conn)
    .await
    .map_err(db_err)?;

    Ok((result.rows_affected() == 1).then_some(queued))
}

/// Whether a fan-in task must wait for other normalize or feature tasks of its run.
async fn fan_in_blocked(conn: &mut SqliteConnection, task: &NewTask) -> Result<bool> {
    let Some(run_id) = task.params.run_id.filter(|_| task.fan_in) else {
        return Ok(false);
    };
    let outstanding: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM llm_processing_queue
        WHERE json_extract(params, '$.run_id') = ?
          AND task_type IN ('normalize', 'feature')
          AND status IN ('pending', 'processing')
        "#,
    )
    .bind(run_id.to_string())
    .fetch_one(conn)
    .await
    .map_err(db_err)?;
    Ok(outstanding > 0)
}
