//! Worker repository port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::DomainResult;
use crate::domain::models::{PodRuntimeState, Worker, WorkerStatus};

/// One heartbeat as reported by a worker.
#[derive(Debug, Clone)]
pub struct HeartbeatUpdate {
    pub worker_id: String,
    pub endpoint: String,
    /// Task IDs the worker claims to be executing
    pub jobs_in_progress: Vec<String>,
    /// Reported concurrency limit, if any
    pub concurrency: Option<u32>,
    /// Worker software version; empty values are ignored
    pub version: Option<String>,
    pub now: DateTime<Utc>,
}

/// Result of applying a heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatOutcome {
    /// The worker row after the update
    pub worker: Worker,
    /// Status before the update; None when the row was created
    pub previous_status: Option<WorkerStatus>,
    /// Job count before the update
    pub previous_jobs: u32,
}

/// Repository interface for Worker persistence.
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// Get a worker by ID (== pod name).
    async fn get(&self, id: &str) -> DomainResult<Option<Worker>>;

    /// All workers, any status.
    async fn list_all(&self) -> DomainResult<Vec<Worker>>;

    /// Workers serving one endpoint.
    async fn list_by_endpoint(&self, endpoint: &str) -> DomainResult<Vec<Worker>>;

    /// Apply one heartbeat. The status expression is embedded in a
    /// single UPDATE so DRAINING stays sticky with no read-modify-write
    /// race; a missing row is created with the given default
    /// concurrency.
    async fn apply_heartbeat(
        &self,
        heartbeat: &HeartbeatUpdate,
        current_jobs: u32,
        default_concurrency: u32,
    ) -> DomainResult<HeartbeatOutcome>;

    /// Upsert from a pod-watch observation: create the row in STARTING
    /// on first sight, otherwise merge the runtime state and pod
    /// timestamps.
    async fn upsert_pod_observed(
        &self,
        pod_name: &str,
        endpoint: &str,
        state: &PodRuntimeState,
        pod_created_at: Option<DateTime<Utc>>,
        pod_started_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DomainResult<Worker>;

    /// Record pod readiness; computes and stores the cold-start
    /// duration when the pod creation time is known. Returns the
    /// cold-start milliseconds, if computable.
    async fn set_pod_ready(
        &self,
        pod_name: &str,
        ready_at: DateTime<Utc>,
    ) -> DomainResult<Option<i64>>;

    /// Transition to DRAINING. Returns false if the worker is unknown
    /// or already draining/offline.
    async fn mark_draining(&self, id: &str, now: DateTime<Utc>) -> DomainResult<bool>;

    /// Transition to OFFLINE and clear the in-progress accounting.
    /// Returns false if the worker is unknown or already offline.
    async fn mark_offline(&self, id: &str, now: DateTime<Utc>) -> DomainResult<bool>;

    /// Workers whose heartbeat predates `cutoff`, excluding OFFLINE and
    /// STARTING rows.
    async fn list_stale(&self, cutoff: DateTime<Utc>) -> DomainResult<Vec<Worker>>;

    /// Bump completion counters and execution time for a worker.
    async fn record_task_completion(
        &self,
        id: &str,
        execution_ms: i64,
        failed: bool,
        now: DateTime<Utc>,
    ) -> DomainResult<()>;

    /// Record idle-start accounting when a worker's queue empties.
    async fn set_last_task_time(&self, id: &str, now: DateTime<Utc>) -> DomainResult<()>;

    /// Stamp the first failure detection; a no-op if already set.
    /// Returns whether this call performed the write.
    async fn set_failure_occurred(&self, id: &str, now: DateTime<Utc>) -> DomainResult<bool>;

    /// Explicit recovery: clear the failure stamp.
    async fn clear_failure(&self, id: &str) -> DomainResult<()>;
}
