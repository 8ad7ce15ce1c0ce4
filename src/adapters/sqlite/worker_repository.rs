//! SQLite implementation of the WorkerRepository.
//!
//! The heartbeat status expression is embedded in a single UPDATE
//! (`CASE WHEN status = 'DRAINING' …`) so a draining worker can never
//! be flipped back to ONLINE/BUSY by a racing heartbeat.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{PodRuntimeState, Worker, WorkerStatus};
use crate::domain::ports::{HeartbeatOutcome, HeartbeatUpdate, WorkerRepository};

use super::util::{parse_datetime, parse_opt_datetime};

#[derive(Clone)]
pub struct SqliteWorkerRepository {
    pool: SqlitePool,
}

impl SqliteWorkerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct WorkerRow {
    id: String,
    endpoint: String,
    status: String,
    concurrency: i64,
    current_jobs: i64,
    jobs_in_progress: String,
    version: Option<String>,
    last_heartbeat: Option<String>,
    registered_at: Option<String>,
    pod_name: String,
    pod_created_at: Option<String>,
    pod_started_at: Option<String>,
    pod_ready_at: Option<String>,
    runtime_state: String,
    cold_start_ms: Option<i64>,
    last_task_time: Option<String>,
    failure_occurred_at: Option<String>,
    terminated_at: Option<String>,
    completed_count: i64,
    failed_count: i64,
    execution_ms_total: i64,
    created_at: String,
    updated_at: String,
}

impl TryFrom<WorkerRow> for Worker {
    type Error = DomainError;

    fn try_from(row: WorkerRow) -> DomainResult<Worker> {
        let status = WorkerStatus::from_str(&row.status).ok_or_else(|| {
            DomainError::SerializationError(format!("unknown worker status '{}'", row.status))
        })?;
        Ok(Worker {
            id: row.id,
            endpoint: row.endpoint,
            status,
            concurrency: row.concurrency as u32,
            current_jobs: row.current_jobs as u32,
            jobs_in_progress: serde_json::from_str(&row.jobs_in_progress)?,
            version: row.version,
            last_heartbeat: parse_opt_datetime(row.last_heartbeat.as_deref())?,
            registered_at: parse_opt_datetime(row.registered_at.as_deref())?,
            pod_name: row.pod_name,
            pod_created_at: parse_opt_datetime(row.pod_created_at.as_deref())?,
            pod_started_at: parse_opt_datetime(row.pod_started_at.as_deref())?,
            pod_ready_at: parse_opt_datetime(row.pod_ready_at.as_deref())?,
            runtime_state: serde_json::from_str(&row.runtime_state)?,
            cold_start_ms: row.cold_start_ms,
            last_task_time: parse_opt_datetime(row.last_task_time.as_deref())?,
            failure_occurred_at: parse_opt_datetime(row.failure_occurred_at.as_deref())?,
            terminated_at: parse_opt_datetime(row.terminated_at.as_deref())?,
            completed_count: row.completed_count as u64,
            failed_count: row.failed_count as u64,
            execution_ms_total: row.execution_ms_total,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
        })
    }
}

#[async_trait]
impl WorkerRepository for SqliteWorkerRepository {
    async fn get(&self, id: &str) -> DomainResult<Option<Worker>> {
        let row: Option<WorkerRow> = sqlx::query_as("SELECT * FROM workers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Worker::try_from).transpose()
    }

    async fn list_all(&self) -> DomainResult<Vec<Worker>> {
        let rows: Vec<WorkerRow> = sqlx::query_as("SELECT * FROM workers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Worker::try_from).collect()
    }

    async fn list_by_endpoint(&self, endpoint: &str) -> DomainResult<Vec<Worker>> {
        let rows: Vec<WorkerRow> =
            sqlx::query_as("SELECT * FROM workers WHERE endpoint = ? ORDER BY id")
                .bind(endpoint)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Worker::try_from).collect()
    }

    async fn apply_heartbeat(
        &self,
        heartbeat: &HeartbeatUpdate,
        current_jobs: u32,
        default_concurrency: u32,
    ) -> DomainResult<HeartbeatOutcome> {
        let mut tx = self.pool.begin().await?;

        let previous: Option<(String, i64)> =
            sqlx::query_as("SELECT status, current_jobs FROM workers WHERE id = ?")
                .bind(&heartbeat.worker_id)
                .fetch_optional(&mut *tx)
                .await?;

        let jobs_json = serde_json::to_string(&heartbeat.jobs_in_progress)?;
        let now_str = heartbeat.now.to_rfc3339();
        let derived = if current_jobs > 0 { "BUSY" } else { "ONLINE" };
        let version = heartbeat
            .version
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let (previous_status, previous_jobs) = match &previous {
            Some((status, jobs)) => {
                // An empty reported endpoint keeps the stored one; the
                // wire heartbeat does not always carry it.
                sqlx::query(
                    r#"UPDATE workers SET
                       endpoint = COALESCE(NULLIF(?, ''), endpoint),
                       status = CASE WHEN status = 'DRAINING' THEN 'DRAINING' ELSE ? END,
                       current_jobs = ?,
                       jobs_in_progress = ?,
                       concurrency = COALESCE(?, concurrency),
                       version = COALESCE(?, version),
                       last_heartbeat = ?,
                       registered_at = COALESCE(registered_at, ?),
                       updated_at = ?
                       WHERE id = ?"#,
                )
                .bind(&heartbeat.endpoint)
                .bind(derived)
                .bind(i64::from(current_jobs))
                .bind(&jobs_json)
                .bind(heartbeat.concurrency.map(i64::from))
                .bind(&version)
                .bind(&now_str)
                .bind(&now_str)
                .bind(&now_str)
                .bind(&heartbeat.worker_id)
                .execute(&mut *tx)
                .await?;

                (WorkerStatus::from_str(status), *jobs as u32)
            }
            None => {
                let concurrency = heartbeat.concurrency.unwrap_or(default_concurrency);
                let endpoint =
                    crate::domain::models::normalize_endpoint(&heartbeat.endpoint);
                sqlx::query(
                    r#"INSERT INTO workers (id, endpoint, status, concurrency, current_jobs,
                       jobs_in_progress, version, last_heartbeat, registered_at, pod_name,
                       runtime_state, completed_count, failed_count, execution_ms_total,
                       created_at, updated_at)
                       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, '{}', 0, 0, 0, ?, ?)"#,
                )
                .bind(&heartbeat.worker_id)
                .bind(endpoint)
                .bind(derived)
                .bind(i64::from(concurrency))
                .bind(i64::from(current_jobs))
                .bind(&jobs_json)
                .bind(&version)
                .bind(&now_str)
                .bind(&now_str)
                .bind(&heartbeat.worker_id)
                .bind(&now_str)
                .bind(&now_str)
                .execute(&mut *tx)
                .await?;

                (None, 0)
            }
        };

        let row: WorkerRow = sqlx::query_as("SELECT * FROM workers WHERE id = ?")
            .bind(&heartbeat.worker_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(HeartbeatOutcome {
            worker: row.try_into()?,
            previous_status,
            previous_jobs,
        })
    }

    async fn upsert_pod_observed(
        &self,
        pod_name: &str,
        endpoint: &str,
        state: &PodRuntimeState,
        pod_created_at: Option<DateTime<Utc>>,
        pod_started_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DomainResult<Worker> {
        let mut tx = self.pool.begin().await?;
        let now_str = now.to_rfc3339();

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT runtime_state FROM workers WHERE pod_name = ?")
                .bind(pod_name)
                .fetch_optional(&mut *tx)
                .await?;

        match existing {
            Some((runtime_state,)) => {
                let mut merged: PodRuntimeState = serde_json::from_str(&runtime_state)?;
                merged.merge(state);
                sqlx::query(
                    r#"UPDATE workers SET
                       runtime_state = ?,
                       pod_created_at = COALESCE(pod_created_at, ?),
                       pod_started_at = COALESCE(pod_started_at, ?),
                       updated_at = ?
                       WHERE pod_name = ?"#,
                )
                .bind(serde_json::to_string(&merged)?)
                .bind(pod_created_at.map(|t| t.to_rfc3339()))
                .bind(pod_started_at.map(|t| t.to_rfc3339()))
                .bind(&now_str)
                .bind(pod_name)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"INSERT INTO workers (id, endpoint, status, concurrency, current_jobs,
                       jobs_in_progress, pod_name, pod_created_at, pod_started_at,
                       runtime_state, completed_count, failed_count, execution_ms_total,
                       created_at, updated_at)
                       VALUES (?, ?, 'STARTING', 1, 0, '[]', ?, ?, ?, ?, 0, 0, 0, ?, ?)"#,
                )
                .bind(pod_name)
                .bind(endpoint)
                .bind(pod_name)
                .bind(pod_created_at.map(|t| t.to_rfc3339()))
                .bind(pod_started_at.map(|t| t.to_rfc3339()))
                .bind(serde_json::to_string(state)?)
                .bind(&now_str)
                .bind(&now_str)
                .execute(&mut *tx)
                .await?;
            }
        }

        let row: WorkerRow = sqlx::query_as("SELECT * FROM workers WHERE pod_name = ?")
            .bind(pod_name)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn set_pod_ready(
        &self,
        pod_name: &str,
        ready_at: DateTime<Utc>,
    ) -> DomainResult<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT pod_created_at FROM workers WHERE pod_name = ?")
                .bind(pod_name)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((pod_created_at,)) = row else {
            tx.rollback().await?;
            return Err(DomainError::WorkerNotFound(pod_name.to_string()));
        };

        let cold_start_ms = pod_created_at
            .as_deref()
            .map(parse_datetime)
            .transpose()?
            .map(|created| (ready_at - created).num_milliseconds());

        sqlx::query(
            r#"UPDATE workers SET pod_ready_at = ?,
               cold_start_ms = COALESCE(?, cold_start_ms), updated_at = ?
               WHERE pod_name = ?"#,
        )
        .bind(ready_at.to_rfc3339())
        .bind(cold_start_ms)
        .bind(ready_at.to_rfc3339())
        .bind(pod_name)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(cold_start_ms)
    }

    async fn mark_draining(&self, id: &str, now: DateTime<Utc>) -> DomainResult<bool> {
        let result = sqlx::query(
            r#"UPDATE workers SET status = 'DRAINING',
               terminated_at = COALESCE(terminated_at, ?), updated_at = ?
               WHERE id = ? AND status NOT IN ('DRAINING', 'OFFLINE')"#,
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_offline(&self, id: &str, now: DateTime<Utc>) -> DomainResult<bool> {
        let result = sqlx::query(
            r#"UPDATE workers SET status = 'OFFLINE', current_jobs = 0,
               jobs_in_progress = '[]', updated_at = ?
               WHERE id = ? AND status != 'OFFLINE'"#,
        )
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> DomainResult<Vec<Worker>> {
        let rows: Vec<WorkerRow> = sqlx::query_as(
            r#"SELECT * FROM workers
               WHERE status NOT IN ('OFFLINE', 'STARTING')
                 AND (last_heartbeat IS NULL OR last_heartbeat < ?)
               ORDER BY id"#,
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Worker::try_from).collect()
    }

    async fn record_task_completion(
        &self,
        id: &str,
        execution_ms: i64,
        failed: bool,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        let (completed_inc, failed_inc) = if failed { (0i64, 1i64) } else { (1, 0) };
        sqlx::query(
            r#"UPDATE workers SET
               completed_count = completed_count + ?,
               failed_count = failed_count + ?,
               execution_ms_total = execution_ms_total + ?,
               updated_at = ?
               WHERE id = ?"#,
        )
        .bind(completed_inc)
        .bind(failed_inc)
        .bind(execution_ms.max(0))
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_last_task_time(&self, id: &str, now: DateTime<Utc>) -> DomainResult<()> {
        sqlx::query("UPDATE workers SET last_task_time = ?, updated_at = ? WHERE id = ?")
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_failure_occurred(&self, id: &str, now: DateTime<Utc>) -> DomainResult<bool> {
        let result = sqlx::query(
            r#"UPDATE workers SET failure_occurred_at = ?, updated_at = ?
               WHERE id = ? AND failure_occurred_at IS NULL"#,
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_failure(&self, id: &str) -> DomainResult<()> {
        sqlx::query("UPDATE workers SET failure_occurred_at = NULL WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
