//! SQLite implementation of the EndpointRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{AutoscalerConfig, EndpointMetadata, EndpointRecord};
use crate::domain::ports::EndpointRepository;

use super::util::{parse_datetime, parse_opt_datetime};

#[derive(Clone)]
pub struct SqliteEndpointRepository {
    pool: SqlitePool,
}

impl SqliteEndpointRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct EndpointRow {
    name: String,
    display_name: String,
    image: String,
    gpu_spec: Option<String>,
    desired_replicas: i64,
    task_timeout_secs: Option<i64>,
    max_pending: i64,
    webhook_url: Option<String>,
    status: String,
    last_task_time: Option<String>,
    last_scale_time: Option<String>,
    first_pending_time: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<EndpointRow> for EndpointMetadata {
    type Error = DomainError;

    fn try_from(row: EndpointRow) -> DomainResult<EndpointMetadata> {
        Ok(EndpointMetadata {
            name: row.name,
            display_name: row.display_name,
            image: row.image,
            gpu_spec: row.gpu_spec,
            desired_replicas: row.desired_replicas as u32,
            task_timeout_secs: row.task_timeout_secs.map(|v| v as u64),
            max_pending: row.max_pending as u32,
            webhook_url: row.webhook_url,
            status: row.status,
            last_task_time: parse_opt_datetime(row.last_task_time.as_deref())?,
            last_scale_time: parse_opt_datetime(row.last_scale_time.as_deref())?,
            first_pending_time: parse_opt_datetime(row.first_pending_time.as_deref())?,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AutoscalerRow {
    endpoint: String,
    min_replicas: i64,
    max_replicas: i64,
    scale_up_queue_threshold: i64,
    scale_down_idle_secs: i64,
    scale_up_cooldown_secs: i64,
    scale_down_cooldown_secs: i64,
    priority: i64,
    dynamic_priority: i64,
    high_load_threshold: i64,
    priority_boost: i64,
    enabled: i64,
}

impl From<AutoscalerRow> for AutoscalerConfig {
    fn from(row: AutoscalerRow) -> Self {
        Self {
            endpoint: row.endpoint,
            min_replicas: row.min_replicas as u32,
            max_replicas: row.max_replicas as u32,
            scale_up_queue_threshold: row.scale_up_queue_threshold as u32,
            scale_down_idle_secs: row.scale_down_idle_secs as u64,
            scale_up_cooldown_secs: row.scale_up_cooldown_secs as u64,
            scale_down_cooldown_secs: row.scale_down_cooldown_secs as u64,
            priority: row.priority as i32,
            dynamic_priority: row.dynamic_priority != 0,
            high_load_threshold: row.high_load_threshold as u32,
            priority_boost: row.priority_boost as i32,
            enabled: row.enabled != 0,
        }
    }
}

#[async_trait]
impl EndpointRepository for SqliteEndpointRepository {
    async fn save(
        &self,
        metadata: &EndpointMetadata,
        autoscaler: &AutoscalerConfig,
    ) -> DomainResult<()> {
        let mut tx = self.pool.begin().await?;

        // Config fields only; the time-tracking columns are owned by
        // the dispatch path and survive re-saves.
        sqlx::query(
            r#"INSERT INTO endpoints (name, display_name, image, gpu_spec, desired_replicas,
               task_timeout_secs, max_pending, webhook_url, status, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(name) DO UPDATE SET
                 display_name = excluded.display_name,
                 image = excluded.image,
                 gpu_spec = excluded.gpu_spec,
                 desired_replicas = excluded.desired_replicas,
                 task_timeout_secs = excluded.task_timeout_secs,
                 max_pending = excluded.max_pending,
                 webhook_url = excluded.webhook_url,
                 status = excluded.status,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&metadata.name)
        .bind(&metadata.display_name)
        .bind(&metadata.image)
        .bind(&metadata.gpu_spec)
        .bind(i64::from(metadata.desired_replicas))
        .bind(metadata.task_timeout_secs.map(|v| v as i64))
        .bind(i64::from(metadata.max_pending))
        .bind(&metadata.webhook_url)
        .bind(&metadata.status)
        .bind(metadata.created_at.to_rfc3339())
        .bind(metadata.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"INSERT INTO autoscaler_configs (endpoint, min_replicas, max_replicas,
               scale_up_queue_threshold, scale_down_idle_secs, scale_up_cooldown_secs,
               scale_down_cooldown_secs, priority, dynamic_priority, high_load_threshold,
               priority_boost, enabled)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(endpoint) DO UPDATE SET
                 min_replicas = excluded.min_replicas,
                 max_replicas = excluded.max_replicas,
                 scale_up_queue_threshold = excluded.scale_up_queue_threshold,
                 scale_down_idle_secs = excluded.scale_down_idle_secs,
                 scale_up_cooldown_secs = excluded.scale_up_cooldown_secs,
                 scale_down_cooldown_secs = excluded.scale_down_cooldown_secs,
                 priority = excluded.priority,
                 dynamic_priority = excluded.dynamic_priority,
                 high_load_threshold = excluded.high_load_threshold,
                 priority_boost = excluded.priority_boost,
                 enabled = excluded.enabled"#,
        )
        .bind(&autoscaler.endpoint)
        .bind(i64::from(autoscaler.min_replicas))
        .bind(i64::from(autoscaler.max_replicas))
        .bind(i64::from(autoscaler.scale_up_queue_threshold))
        .bind(autoscaler.scale_down_idle_secs as i64)
        .bind(autoscaler.scale_up_cooldown_secs as i64)
        .bind(autoscaler.scale_down_cooldown_secs as i64)
        .bind(i64::from(autoscaler.priority))
        .bind(i64::from(autoscaler.dynamic_priority))
        .bind(i64::from(autoscaler.high_load_threshold))
        .bind(i64::from(autoscaler.priority_boost))
        .bind(i64::from(autoscaler.enabled))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, name: &str) -> DomainResult<Option<EndpointRecord>> {
        let endpoint: Option<EndpointRow> =
            sqlx::query_as("SELECT * FROM endpoints WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        let Some(endpoint) = endpoint else {
            return Ok(None);
        };

        let autoscaler: Option<AutoscalerRow> =
            sqlx::query_as("SELECT * FROM autoscaler_configs WHERE endpoint = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(Some(EndpointRecord {
            metadata: endpoint.try_into()?,
            autoscaler: autoscaler
                .map(AutoscalerConfig::from)
                .unwrap_or_else(|| AutoscalerConfig::disabled(name)),
        }))
    }

    async fn list(&self) -> DomainResult<Vec<EndpointRecord>> {
        let endpoints: Vec<EndpointRow> = sqlx::query_as("SELECT * FROM endpoints ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        let autoscalers: Vec<AutoscalerRow> =
            sqlx::query_as("SELECT * FROM autoscaler_configs")
                .fetch_all(&self.pool)
                .await?;

        let mut by_endpoint: HashMap<String, AutoscalerConfig> = autoscalers
            .into_iter()
            .map(|row| (row.endpoint.clone(), row.into()))
            .collect();

        endpoints
            .into_iter()
            .map(|row| {
                let name = row.name.clone();
                Ok(EndpointRecord {
                    metadata: row.try_into()?,
                    autoscaler: by_endpoint
                        .remove(&name)
                        .unwrap_or_else(|| AutoscalerConfig::disabled(&name)),
                })
            })
            .collect()
    }

    async fn delete(&self, name: &str) -> DomainResult<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM endpoints WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM autoscaler_configs WHERE endpoint = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_last_task_time(&self, name: &str, at: DateTime<Utc>) -> DomainResult<()> {
        sqlx::query("UPDATE endpoints SET last_task_time = ?, updated_at = ? WHERE name = ?")
            .bind(at.to_rfc3339())
            .bind(at.to_rfc3339())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_first_pending_time(
        &self,
        name: &str,
        at: Option<DateTime<Utc>>,
    ) -> DomainResult<()> {
        sqlx::query("UPDATE endpoints SET first_pending_time = ? WHERE name = ?")
            .bind(at.map(|t| t.to_rfc3339()))
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_last_scale_time(&self, name: &str, at: DateTime<Utc>) -> DomainResult<()> {
        sqlx::query("UPDATE endpoints SET last_scale_time = ?, updated_at = ? WHERE name = ?")
            .bind(at.to_rfc3339())
            .bind(at.to_rfc3339())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn task_timeouts(&self) -> DomainResult<HashMap<String, u64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT name, task_timeout_secs FROM endpoints WHERE task_timeout_secs IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, secs)| (name, secs as u64))
            .collect())
    }
}
