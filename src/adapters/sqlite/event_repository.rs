//! SQLite implementation of the EventRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{TaskEvent, TaskEventType, WorkerEvent, WorkerEventType};
use crate::domain::ports::EventRepository;

use super::util::{parse_datetime, parse_uuid};

#[derive(Clone)]
pub struct SqliteEventRepository {
    pool: SqlitePool,
}

impl SqliteEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct TaskEventRow {
    id: String,
    task_id: String,
    endpoint: String,
    worker_id: Option<String>,
    event_type: String,
    event_time: String,
    queue_wait_ms: Option<i64>,
    execution_ms: Option<i64>,
    total_ms: Option<i64>,
    detail: Option<String>,
}

impl TryFrom<TaskEventRow> for TaskEvent {
    type Error = DomainError;

    fn try_from(row: TaskEventRow) -> DomainResult<TaskEvent> {
        let event_type = TaskEventType::from_str(&row.event_type).ok_or_else(|| {
            DomainError::SerializationError(format!("unknown task event '{}'", row.event_type))
        })?;
        Ok(TaskEvent {
            id: parse_uuid(&row.id)?,
            task_id: parse_uuid(&row.task_id)?,
            endpoint: row.endpoint,
            worker_id: row.worker_id,
            event_type,
            event_time: parse_datetime(&row.event_time)?,
            queue_wait_ms: row.queue_wait_ms,
            execution_ms: row.execution_ms,
            total_ms: row.total_ms,
            detail: row.detail,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkerEventRow {
    id: String,
    worker_id: String,
    endpoint: String,
    event_type: String,
    event_time: String,
    idle_ms: Option<i64>,
    cold_start_ms: Option<i64>,
}

impl TryFrom<WorkerEventRow> for WorkerEvent {
    type Error = DomainError;

    fn try_from(row: WorkerEventRow) -> DomainResult<WorkerEvent> {
        let event_type = WorkerEventType::from_str(&row.event_type).ok_or_else(|| {
            DomainError::SerializationError(format!("unknown worker event '{}'", row.event_type))
        })?;
        Ok(WorkerEvent {
            id: parse_uuid(&row.id)?,
            worker_id: row.worker_id,
            endpoint: row.endpoint,
            event_type,
            event_time: parse_datetime(&row.event_time)?,
            idle_ms: row.idle_ms,
            cold_start_ms: row.cold_start_ms,
        })
    }
}

#[async_trait]
impl EventRepository for SqliteEventRepository {
    async fn append_task_event(&self, event: &TaskEvent) -> DomainResult<()> {
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
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_worker_event(&self, event: &WorkerEvent) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO worker_events (id, worker_id, endpoint, event_type, event_time,
               idle_ms, cold_start_ms)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(event.id.to_string())
        .bind(&event.worker_id)
        .bind(&event.endpoint)
        .bind(event.event_type.as_str())
        .bind(event.event_time.to_rfc3339())
        .bind(event.idle_ms)
        .bind(event.cold_start_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn task_events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DomainResult<Vec<TaskEvent>> {
        let rows: Vec<TaskEventRow> = sqlx::query_as(
            r#"SELECT * FROM task_events WHERE event_time >= ? AND event_time < ?
               ORDER BY event_time, id"#,
        )
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskEvent::try_from).collect()
    }

    async fn worker_events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DomainResult<Vec<WorkerEvent>> {
        let rows: Vec<WorkerEventRow> = sqlx::query_as(
            r#"SELECT * FROM worker_events WHERE event_time >= ? AND event_time < ?
               ORDER BY event_time, id"#,
        )
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WorkerEvent::try_from).collect()
    }

    async fn events_for_task(&self, task_id: Uuid) -> DomainResult<Vec<TaskEvent>> {
        let rows: Vec<TaskEventRow> = sqlx::query_as(
            "SELECT * FROM task_events WHERE task_id = ? ORDER BY event_time, id",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskEvent::try_from).collect()
    }
}
