//! Endpoint metadata repository port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::domain::errors::DomainResult;
use crate::domain::models::{AutoscalerConfig, EndpointMetadata, EndpointRecord};

/// Repository for endpoint config and the paired autoscaler config.
#[async_trait]
pub trait EndpointRepository: Send + Sync {
    /// Create-or-update by natural key. Always upserts the autoscaler
    /// row too, so a disabled autoscaler is persisted intent.
    async fn save(
        &self,
        metadata: &EndpointMetadata,
        autoscaler: &AutoscalerConfig,
    ) -> DomainResult<()>;

    /// Get one endpoint merged with its autoscaler config.
    async fn get(&self, name: &str) -> DomainResult<Option<EndpointRecord>>;

    /// All endpoints merged with their autoscaler configs.
    async fn list(&self) -> DomainResult<Vec<EndpointRecord>>;

    /// Delete an endpoint and its autoscaler config. Returns whether a
    /// row existed.
    async fn delete(&self, name: &str) -> DomainResult<bool>;

    /// Autoscaler idle signal: last terminal task time.
    async fn set_last_task_time(&self, name: &str, at: DateTime<Utc>) -> DomainResult<()>;

    /// Autoscaler backlog signal: enqueue time of the oldest pending
    /// task, or None when the queue emptied.
    async fn set_first_pending_time(
        &self,
        name: &str,
        at: Option<DateTime<Utc>>,
    ) -> DomainResult<()>;

    /// Stamped by the autoscaler after a replica change.
    async fn set_last_scale_time(&self, name: &str, at: DateTime<Utc>) -> DomainResult<()>;

    /// Explicit per-endpoint task timeouts, batch-fetched so sweeps
    /// avoid per-task lookups.
    async fn task_timeouts(&self) -> DomainResult<HashMap<String, u64>>;
}
