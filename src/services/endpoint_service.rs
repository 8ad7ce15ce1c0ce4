//! Endpoint metadata manager.
//!
//! CRUD over endpoint config plus the live per-endpoint stats view the
//! autoscaler and operators read.

use std::sync::Arc;
use tracing::instrument;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    normalize_endpoint, AutoscalerConfig, EndpointMetadata, EndpointRecord, EndpointStats,
};
use crate::domain::ports::{EndpointRepository, TaskRepository, WorkerRepository};

pub struct EndpointService {
    endpoints: Arc<dyn EndpointRepository>,
    tasks: Arc<dyn TaskRepository>,
    workers: Arc<dyn WorkerRepository>,
}

impl EndpointService {
    pub fn new(
        endpoints: Arc<dyn EndpointRepository>,
        tasks: Arc<dyn TaskRepository>,
        workers: Arc<dyn WorkerRepository>,
    ) -> Self {
        Self {
            endpoints,
            tasks,
            workers,
        }
    }

    /// Create-or-update an endpoint. The autoscaler config row is
    /// always written, even when scaling is disabled, so the intent is
    /// persisted rather than inferred from a missing row.
    #[instrument(skip(self, metadata, autoscaler), fields(endpoint = %metadata.name))]
    pub async fn save(
        &self,
        mut metadata: EndpointMetadata,
        mut autoscaler: AutoscalerConfig,
    ) -> DomainResult<EndpointRecord> {
        if metadata.name.trim().is_empty() {
            return Err(DomainError::ValidationFailed(
                "endpoint name cannot be empty".to_string(),
            ));
        }
        metadata.apply_defaults();
        autoscaler.endpoint = metadata.name.clone();

        self.endpoints.save(&metadata, &autoscaler).await?;
        Ok(EndpointRecord {
            metadata,
            autoscaler,
        })
    }

    pub async fn get(&self, name: &str) -> DomainResult<EndpointRecord> {
        let name = normalize_endpoint(name);
        self.endpoints
            .get(&name)
            .await?
            .ok_or(DomainError::EndpointNotFound(name))
    }

    pub async fn list(&self) -> DomainResult<Vec<EndpointRecord>> {
        self.endpoints.list().await
    }

    pub async fn delete(&self, name: &str) -> DomainResult<()> {
        let name = normalize_endpoint(name);
        if !self.endpoints.delete(&name).await? {
            return Err(DomainError::EndpointNotFound(name));
        }
        Ok(())
    }

    /// Live metrics: task counts by status and worker availability.
    /// DRAINING workers appear in their own counter and contribute no
    /// capacity.
    #[instrument(skip(self))]
    pub async fn get_stats(&self, name: &str) -> DomainResult<EndpointStats> {
        let name = normalize_endpoint(name);
        let counts = self.tasks.status_counts(Some(&name)).await?;
        let workers = self.workers.list_by_endpoint(&name).await?;

        let mut stats = EndpointStats {
            endpoint: name,
            pending_tasks: counts.pending,
            running_tasks: counts.in_progress,
            completed_tasks: counts.completed,
            failed_tasks: counts.failed,
            ..Default::default()
        };
        for worker in &workers {
            stats.count_worker(worker.status, worker.concurrency, worker.current_jobs);
        }
        Ok(stats)
    }
}
