//! Task repository port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Payload, Task, TaskEvent, TaskStatistics, TaskStatus};

/// Full field set applied by a conditional status update.
///
/// Every field is written as given (None clears the column), so the
/// caller states the complete desired row, not a delta. This mirrors
/// the single-statement CAS the claim and requeue paths depend on.
#[derive(Debug, Clone)]
pub struct TaskCasUpdate {
    pub status: TaskStatus,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<Payload>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Close the open execution-history record at this time
    pub close_history_at: Option<DateTime<Utc>>,
}

/// Repository interface for Task persistence.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Create a new task.
    async fn create(&self, task: &Task) -> DomainResult<()>;

    /// Get a task by ID.
    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>>;

    /// Apply `update` only if the task's current status equals
    /// `expected`. Returns whether a row matched; a miss is the
    /// documented lost-the-race path, not an error.
    async fn update_if_status(
        &self,
        id: Uuid,
        expected: TaskStatus,
        update: TaskCasUpdate,
    ) -> DomainResult<bool>;

    /// Atomically claim up to `batch_size` PENDING tasks for a worker,
    /// oldest first. The whole claim runs in one transaction: candidate
    /// selection, a re-read of the worker row (the claim is abandoned
    /// if the worker is DRAINING at that point), the per-row
    /// PENDING→IN_PROGRESS CAS, and the execution-history append.
    /// Rows that lost the CAS race are silently dropped.
    async fn assign_pending(
        &self,
        endpoint: &str,
        worker_id: &str,
        batch_size: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<Task>>;

    /// Requeue one IN_PROGRESS task back to PENDING, appending `event`
    /// in the same transaction so the journal cannot disagree with the
    /// state. Returns false when the CAS found the task no longer
    /// IN_PROGRESS (e.g. a result landed concurrently).
    async fn requeue_in_progress(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        event: &TaskEvent,
    ) -> DomainResult<bool>;

    /// Tasks in a given status, optionally scoped to one endpoint,
    /// FIFO by creation time.
    async fn list_by_status(
        &self,
        status: TaskStatus,
        endpoint: Option<&str>,
    ) -> DomainResult<Vec<Task>>;

    /// IN_PROGRESS tasks assigned to a worker.
    async fn in_progress_by_worker(&self, worker_id: &str) -> DomainResult<Vec<Task>>;

    /// Number of PENDING tasks for an endpoint.
    async fn count_pending(&self, endpoint: &str) -> DomainResult<u64>;

    /// Creation time of the oldest PENDING task for an endpoint.
    async fn oldest_pending_created_at(
        &self,
        endpoint: &str,
    ) -> DomainResult<Option<DateTime<Utc>>>;

    /// Per-status counts for one endpoint, or fleet-wide when None.
    async fn status_counts(&self, endpoint: Option<&str>) -> DomainResult<TaskStatistics>;

    /// Per-status counts grouped by endpoint (statistics refresh).
    async fn status_counts_by_endpoint(&self) -> DomainResult<Vec<TaskStatistics>>;
}
