//! SQLite implementation of the TaskRepository.
//!
//! The claim and requeue paths are the correctness core: both are
//! single transactions whose status updates are conditional on the
//! current status, so concurrent pulls, cancels, results, and janitor
//! sweeps serialise without any in-process locking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    ExecutionRecord, Payload, Task, TaskEvent, TaskStatistics, TaskStatus,
};
use crate::domain::ports::{TaskCasUpdate, TaskRepository};

use super::util::{parse_datetime, parse_opt_datetime, parse_uuid};

#[derive(Clone)]
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    endpoint: String,
    input: String,
    status: String,
    output: Option<String>,
    error_message: Option<String>,
    worker_id: Option<String>,
    webhook_url: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    execution_history: String,
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> DomainResult<Task> {
        let status = TaskStatus::from_str(&row.status).ok_or_else(|| {
            DomainError::SerializationError(format!("unknown task status '{}'", row.status))
        })?;
        let execution_history: Vec<ExecutionRecord> =
            serde_json::from_str(&row.execution_history)?;
        Ok(Task {
            id: parse_uuid(&row.id)?,
            endpoint: row.endpoint,
            input: Payload::from_string(row.input)?,
            status,
            output: row.output.map(Payload::from_string).transpose()?,
            error_message: row.error_message,
            worker_id: row.worker_id,
            webhook_url: row.webhook_url,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
            started_at: parse_opt_datetime(row.started_at.as_deref())?,
            completed_at: parse_opt_datetime(row.completed_at.as_deref())?,
            execution_history,
        })
    }
}

/// Close the open execution-history record of one row, inside `tx`.
async fn close_history_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    task_id: &str,
    ended_at: DateTime<Utc>,
) -> DomainResult<()> {
    let (history,): (String,) =
        sqlx::query_as("SELECT execution_history FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_one(&mut **tx)
            .await?;
    let mut records: Vec<ExecutionRecord> = serde_json::from_str(&history)?;
    if let Some(record) = records.iter_mut().rev().find(|r| r.ended_at.is_none()) {
        record.ended_at = Some(ended_at);
    }
    sqlx::query("UPDATE tasks SET execution_history = ? WHERE id = ?")
        .bind(serde_json::to_string(&records)?)
        .bind(task_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: &Task) -> DomainResult<()> {
        let history_json = serde_json::to_string(&task.execution_history)?;
        sqlx::query(
            r#"INSERT INTO tasks (id, endpoint, input, status, output, error_message,
               worker_id, webhook_url, created_at, updated_at, started_at, completed_at,
               execution_history)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task.id.to_string())
        .bind(&task.endpoint)
        .bind(task.input.as_str())
        .bind(task.status.as_str())
        .bind(task.output.as_ref().map(Payload::as_str))
        .bind(&task.error_message)
        .bind(&task.worker_id)
        .bind(&task.webhook_url)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .bind(task.started_at.map(|t| t.to_rfc3339()))
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(&history_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Task::try_from).transpose()
    }

    async fn update_if_status(
        &self,
        id: Uuid,
        expected: TaskStatus,
        update: TaskCasUpdate,
    ) -> DomainResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"UPDATE tasks SET status = ?, worker_id = ?, started_at = ?,
               completed_at = ?, output = ?, error_message = ?, updated_at = ?
               WHERE id = ? AND status = ?"#,
        )
        .bind(update.status.as_str())
        .bind(&update.worker_id)
        .bind(update.started_at.map(|t| t.to_rfc3339()))
        .bind(update.completed_at.map(|t| t.to_rfc3339()))
        .bind(update.output.as_ref().map(Payload::as_str))
        .bind(&update.error_message)
        .bind(update.updated_at.to_rfc3339())
        .bind(id.to_string())
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(ended_at) = update.close_history_at {
            close_history_in_tx(&mut tx, &id.to_string(), ended_at).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn assign_pending(
        &self,
        endpoint: &str,
        worker_id: &str,
        batch_size: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<Task>> {
        let mut tx = self.pool.begin().await?;

        // The pre-pull draining checks happen outside this transaction;
        // this re-read closes the window between them and the claim.
        let worker_status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM workers WHERE id = ?")
                .bind(worker_id)
                .fetch_optional(&mut *tx)
                .await?;
        if let Some((status,)) = &worker_status {
            if status == "DRAINING" {
                tx.rollback().await?;
                return Ok(Vec::new());
            }
        }

        let candidates: Vec<(String,)> = sqlx::query_as(
            r#"SELECT id FROM tasks WHERE endpoint = ? AND status = 'PENDING'
               ORDER BY created_at, id LIMIT ?"#,
        )
        .bind(endpoint)
        .bind(i64::from(batch_size))
        .fetch_all(&mut *tx)
        .await?;

        let now_str = now.to_rfc3339();
        let mut claimed: Vec<String> = Vec::new();
        for (candidate_id,) in candidates {
            let result = sqlx::query(
                r#"UPDATE tasks SET status = 'IN_PROGRESS', worker_id = ?,
                   started_at = ?, updated_at = ?
                   WHERE id = ? AND status = 'PENDING'"#,
            )
            .bind(worker_id)
            .bind(&now_str)
            .bind(&now_str)
            .bind(&candidate_id)
            .execute(&mut *tx)
            .await?;

            // Raced to another worker or cancelled: drop silently.
            if result.rows_affected() == 0 {
                continue;
            }

            let (history,): (String,) =
                sqlx::query_as("SELECT execution_history FROM tasks WHERE id = ?")
                    .bind(&candidate_id)
                    .fetch_one(&mut *tx)
                    .await?;
            let mut records: Vec<ExecutionRecord> = serde_json::from_str(&history)?;
            records.push(ExecutionRecord {
                worker_id: worker_id.to_string(),
                started_at: now,
                ended_at: None,
            });
            sqlx::query("UPDATE tasks SET execution_history = ? WHERE id = ?")
                .bind(serde_json::to_string(&records)?)
                .bind(&candidate_id)
                .execute(&mut *tx)
                .await?;

            claimed.push(candidate_id);
        }

        let mut tasks = Vec::with_capacity(claimed.len());
        for id in &claimed {
            let row: TaskRow = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
            tasks.push(row.try_into()?);
        }

        tx.commit().await?;
        Ok(tasks)
    }

    async fn requeue_in_progress(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        event: &TaskEvent,
    ) -> DomainResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"UPDATE tasks SET status = 'PENDING', worker_id = NULL, started_at = NULL,
               completed_at = NULL, updated_at = ?
               WHERE id = ? AND status = 'IN_PROGRESS'"#,
        )
        .bind(now.to_rfc3339())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        close_history_in_tx(&mut tx, &id.to_string(), now).await?;

        // The requeue event shares the transaction: orphan detection
        // reads the journal and must never see it disagree with state.
        sqlx::query(
            r#"INSERT INTO task_events (id, task_id, endpoint, worker_id, event_type,
               event_time, queue_wait_ms, execution_ms, total_ms, detail)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(event.id.to_string())
        .bind(event.task_id.to_string())
        .bind(&event.endpoint)
        .bind(&event.worker_id)
        .bind(event.event_type.as_str())
        .bind(event.event_time.to_rfc3339())
        .bind(event.queue_wait_ms)
        .bind(event.execution_ms)
        .bind(event.total_ms)
        .bind(&event.detail)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn list_by_status(
        &self,
        status: TaskStatus,
        endpoint: Option<&str>,
    ) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = match endpoint {
            Some(endpoint) => {
                sqlx::query_as(
                    r#"SELECT * FROM tasks WHERE endpoint = ? AND status = ?
                       ORDER BY created_at, id"#,
                )
                .bind(endpoint)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM tasks WHERE status = ? ORDER BY created_at, id")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(Task::try_from).collect()
    }

    async fn in_progress_by_worker(&self, worker_id: &str) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"SELECT * FROM tasks WHERE worker_id = ? AND status = 'IN_PROGRESS'
               ORDER BY created_at, id"#,
        )
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Task::try_from).collect()
    }

    async fn count_pending(&self, endpoint: &str) -> DomainResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks WHERE endpoint = ? AND status = 'PENDING'",
        )
        .bind(endpoint)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn oldest_pending_created_at(
        &self,
        endpoint: &str,
    ) -> DomainResult<Option<DateTime<Utc>>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"SELECT created_at FROM tasks WHERE endpoint = ? AND status = 'PENDING'
               ORDER BY created_at, id LIMIT 1"#,
        )
        .bind(endpoint)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(s,)| parse_datetime(&s)).transpose()
    }

    async fn status_counts(&self, endpoint: Option<&str>) -> DomainResult<TaskStatistics> {
        let rows: Vec<(String, i64)> = match endpoint {
            Some(endpoint) => {
                sqlx::query_as(
                    "SELECT status, COUNT(*) FROM tasks WHERE endpoint = ? GROUP BY status",
                )
                .bind(endpoint)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut stats = TaskStatistics {
            scope_value: endpoint.unwrap_or("").to_string(),
            ..Default::default()
        };
        for (status_str, count) in rows {
            apply_count(&mut stats, &status_str, count as u64);
        }
        Ok(stats)
    }

    async fn status_counts_by_endpoint(&self) -> DomainResult<Vec<TaskStatistics>> {
        let rows: Vec<(String, String, i64)> =
            sqlx::query_as("SELECT endpoint, status, COUNT(*) FROM tasks GROUP BY endpoint, status")
                .fetch_all(&self.pool)
                .await?;

        let mut by_endpoint: std::collections::BTreeMap<String, TaskStatistics> =
            std::collections::BTreeMap::new();
        for (endpoint, status_str, count) in rows {
            let stats = by_endpoint
                .entry(endpoint.clone())
                .or_insert_with(|| TaskStatistics {
                    scope_value: endpoint,
                    ..Default::default()
                });
            apply_count(stats, &status_str, count as u64);
        }
        Ok(by_endpoint.into_values().collect())
    }
}

fn apply_count(stats: &mut TaskStatistics, status_str: &str, count: u64) {
    match TaskStatus::from_str(status_str) {
        Some(TaskStatus::Pending) => stats.pending = count,
        Some(TaskStatus::InProgress) => stats.in_progress = count,
        Some(TaskStatus::Completed) => stats.completed = count,
        Some(TaskStatus::Failed) => stats.failed = count,
        Some(TaskStatus::Cancelled) => stats.cancelled = count,
        None => {}
    }
}
