//! Event journal port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{TaskEvent, WorkerEvent};

/// Append-only journal of task and worker lifecycle events.
///
/// Appends are best-effort from the caller's perspective: a failed
/// write is logged by the emitting service and never fails the
/// originating operation. The one exception, the requeue event, goes
/// through `TaskRepository::requeue_in_progress` so it shares the
/// state-change transaction.
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn append_task_event(&self, event: &TaskEvent) -> DomainResult<()>;

    async fn append_worker_event(&self, event: &WorkerEvent) -> DomainResult<()>;

    /// All task events with `start <= event_time < end`, every endpoint.
    async fn task_events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DomainResult<Vec<TaskEvent>>;

    /// All worker events with `start <= event_time < end`.
    async fn worker_events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DomainResult<Vec<WorkerEvent>>;

    /// Events for one task, oldest first.
    async fn events_for_task(&self, task_id: Uuid) -> DomainResult<Vec<TaskEvent>>;
}
