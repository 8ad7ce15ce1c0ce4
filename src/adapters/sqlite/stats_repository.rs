//! SQLite implementation of the StatsRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    CountScope, EndpointBucketStats, Granularity, TaskStatistics, TaskStatus,
};
use crate::domain::ports::StatsRepository;

use super::util::parse_datetime;

#[derive(Clone)]
pub struct SqliteStatsRepository {
    pool: SqlitePool,
}

impl SqliteStatsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const ALL_STATUSES: [TaskStatus; 5] = [
    TaskStatus::Pending,
    TaskStatus::InProgress,
    TaskStatus::Completed,
    TaskStatus::Failed,
    TaskStatus::Cancelled,
];

fn bucket_table(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::Minute => "endpoint_stats_minute",
        Granularity::Hour => "endpoint_stats_hour",
        Granularity::Day => "endpoint_stats_day",
    }
}

async fn apply_transition_scope(
    tx: &mut Transaction<'_, Sqlite>,
    scope: CountScope,
    scope_value: &str,
    from: Option<TaskStatus>,
    to: TaskStatus,
) -> DomainResult<()> {
    if let Some(from) = from {
        // Floor at zero: a decrement below zero means the counters
        // drifted and the periodic refresh will correct them.
        sqlx::query(
            r#"UPDATE task_counts SET count = MAX(count - 1, 0)
               WHERE scope = ? AND scope_value = ? AND status = ?"#,
        )
        .bind(scope.as_str())
        .bind(scope_value)
        .bind(from.as_str())
        .execute(&mut **tx)
        .await?;
    }

    sqlx::query(
        r#"INSERT INTO task_counts (scope, scope_value, status, count) VALUES (?, ?, ?, 1)
           ON CONFLICT(scope, scope_value, status) DO UPDATE SET count = count + 1"#,
    )
    .bind(scope.as_str())
    .bind(scope_value)
    .bind(to.as_str())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn insert_count_rows(
    tx: &mut Transaction<'_, Sqlite>,
    scope: CountScope,
    stats: &TaskStatistics,
) -> DomainResult<()> {
    for status in ALL_STATUSES {
        sqlx::query("INSERT INTO task_counts (scope, scope_value, status, count) VALUES (?, ?, ?, ?)")
            .bind(scope.as_str())
            .bind(&stats.scope_value)
            .bind(status.as_str())
            .bind(stats.get(status) as i64)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

#[derive(sqlx::FromRow)]
struct BucketRow {
    endpoint: String,
    bucket: String,
    tasks_submitted: i64,
    tasks_completed: i64,
    tasks_failed: i64,
    tasks_timeout: i64,
    tasks_retried: i64,
    avg_queue_wait_ms: Option<f64>,
    avg_execution_ms: Option<f64>,
    p50_execution_ms: Option<i64>,
    p95_execution_ms: Option<i64>,
    worker_utilization: Option<f64>,
    idle_ms_total: i64,
    idle_ms_max: i64,
    idle_ms_avg: Option<f64>,
    cold_starts: i64,
    cold_start_ms_avg: Option<f64>,
}

impl TryFrom<BucketRow> for EndpointBucketStats {
    type Error = DomainError;

    fn try_from(row: BucketRow) -> DomainResult<EndpointBucketStats> {
        Ok(EndpointBucketStats {
            endpoint: row.endpoint,
            bucket: parse_datetime(&row.bucket)?,
            tasks_submitted: row.tasks_submitted as u64,
            tasks_completed: row.tasks_completed as u64,
            tasks_failed: row.tasks_failed as u64,
            tasks_timeout: row.tasks_timeout as u64,
            tasks_retried: row.tasks_retried as u64,
            avg_queue_wait_ms: row.avg_queue_wait_ms,
            avg_execution_ms: row.avg_execution_ms,
            p50_execution_ms: row.p50_execution_ms,
            p95_execution_ms: row.p95_execution_ms,
            worker_utilization: row.worker_utilization,
            idle_ms_total: row.idle_ms_total,
            idle_ms_max: row.idle_ms_max,
            idle_ms_avg: row.idle_ms_avg,
            cold_starts: row.cold_starts as u64,
            cold_start_ms_avg: row.cold_start_ms_avg,
        })
    }
}

#[async_trait]
impl StatsRepository for SqliteStatsRepository {
    async fn increment_transition(
        &self,
        endpoint: &str,
        from: Option<TaskStatus>,
        to: TaskStatus,
    ) -> DomainResult<()> {
        let mut tx = self.pool.begin().await?;
        apply_transition_scope(&mut tx, CountScope::Global, "", from, to).await?;
        apply_transition_scope(&mut tx, CountScope::Endpoint, endpoint, from, to).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_counts(
        &self,
        scope: CountScope,
        scope_value: &str,
    ) -> DomainResult<TaskStatistics> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, count FROM task_counts WHERE scope = ? AND scope_value = ?",
        )
        .bind(scope.as_str())
        .bind(scope_value)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = TaskStatistics {
            scope_value: scope_value.to_string(),
            ..Default::default()
        };
        for (status_str, count) in rows {
            match TaskStatus::from_str(&status_str) {
                Some(TaskStatus::Pending) => stats.pending = count as u64,
                Some(TaskStatus::InProgress) => stats.in_progress = count as u64,
                Some(TaskStatus::Completed) => stats.completed = count as u64,
                Some(TaskStatus::Failed) => stats.failed = count as u64,
                Some(TaskStatus::Cancelled) => stats.cancelled = count as u64,
                None => {}
            }
        }
        Ok(stats)
    }

    async fn replace_counts(
        &self,
        global: &TaskStatistics,
        per_endpoint: &[TaskStatistics],
    ) -> DomainResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM task_counts").execute(&mut *tx).await?;
        insert_count_rows(&mut tx, CountScope::Global, global).await?;
        for stats in per_endpoint {
            insert_count_rows(&mut tx, CountScope::Endpoint, stats).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_bucket(
        &self,
        granularity: Granularity,
        stats: &EndpointBucketStats,
    ) -> DomainResult<()> {
        let sql = format!(
            r#"INSERT INTO {table} (endpoint, bucket, tasks_submitted, tasks_completed,
               tasks_failed, tasks_timeout, tasks_retried, avg_queue_wait_ms,
               avg_execution_ms, p50_execution_ms, p95_execution_ms, worker_utilization,
               idle_ms_total, idle_ms_max, idle_ms_avg, cold_starts, cold_start_ms_avg)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(endpoint, bucket) DO UPDATE SET
                 tasks_submitted = excluded.tasks_submitted,
                 tasks_completed = excluded.tasks_completed,
                 tasks_failed = excluded.tasks_failed,
                 tasks_timeout = excluded.tasks_timeout,
                 tasks_retried = excluded.tasks_retried,
                 avg_queue_wait_ms = excluded.avg_queue_wait_ms,
                 avg_execution_ms = excluded.avg_execution_ms,
                 p50_execution_ms = excluded.p50_execution_ms,
                 p95_execution_ms = excluded.p95_execution_ms,
                 worker_utilization = excluded.worker_utilization,
                 idle_ms_total = excluded.idle_ms_total,
                 idle_ms_max = excluded.idle_ms_max,
                 idle_ms_avg = excluded.idle_ms_avg,
                 cold_starts = excluded.cold_starts,
                 cold_start_ms_avg = excluded.cold_start_ms_avg"#,
            table = bucket_table(granularity)
        );

        sqlx::query(&sql)
            .bind(&stats.endpoint)
            .bind(stats.bucket.to_rfc3339())
            .bind(stats.tasks_submitted as i64)
            .bind(stats.tasks_completed as i64)
            .bind(stats.tasks_failed as i64)
            .bind(stats.tasks_timeout as i64)
            .bind(stats.tasks_retried as i64)
            .bind(stats.avg_queue_wait_ms)
            .bind(stats.avg_execution_ms)
            .bind(stats.p50_execution_ms)
            .bind(stats.p95_execution_ms)
            .bind(stats.worker_utilization)
            .bind(stats.idle_ms_total)
            .bind(stats.idle_ms_max)
            .bind(stats.idle_ms_avg)
            .bind(stats.cold_starts as i64)
            .bind(stats.cold_start_ms_avg)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_bucket(
        &self,
        granularity: Granularity,
        endpoint: &str,
        bucket: DateTime<Utc>,
    ) -> DomainResult<Option<EndpointBucketStats>> {
        let sql = format!(
            "SELECT * FROM {} WHERE endpoint = ? AND bucket = ?",
            bucket_table(granularity)
        );
        let row: Option<BucketRow> = sqlx::query_as(&sql)
            .bind(endpoint)
            .bind(bucket.to_rfc3339())
            .fetch_optional(&self.pool)
            .await?;
        row.map(EndpointBucketStats::try_from).transpose()
    }

    async fn buckets_between(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DomainResult<Vec<EndpointBucketStats>> {
        let sql = format!(
            "SELECT * FROM {} WHERE bucket >= ? AND bucket < ? ORDER BY endpoint, bucket",
            bucket_table(granularity)
        );
        let rows: Vec<BucketRow> = sqlx::query_as(&sql)
            .bind(start.to_rfc3339())
            .bind(end.to_rfc3339())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(EndpointBucketStats::try_from).collect()
    }
}
