//! Lifecycle event records.
//!
//! Append-only journal entries for task and worker transitions. Each
//! event carries the durations computed at emit time (queue wait,
//! execution, idle, cold start) so the aggregator never has to re-derive
//! them from entity state that may have moved on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task lifecycle event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskEventType {
    TaskCreated,
    TaskQueued,
    TaskAssigned,
    TaskCompleted,
    TaskFailed,
    TaskTimeout,
    TaskOrphaned,
    TaskRequeued,
    TaskCancelled,
}

impl TaskEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "TASK_CREATED",
            Self::TaskQueued => "TASK_QUEUED",
            Self::TaskAssigned => "TASK_ASSIGNED",
            Self::TaskCompleted => "TASK_COMPLETED",
            Self::TaskFailed => "TASK_FAILED",
            Self::TaskTimeout => "TASK_TIMEOUT",
            Self::TaskOrphaned => "TASK_ORPHANED",
            Self::TaskRequeued => "TASK_REQUEUED",
            Self::TaskCancelled => "TASK_CANCELLED",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "TASK_CREATED" => Some(Self::TaskCreated),
            "TASK_QUEUED" => Some(Self::TaskQueued),
            "TASK_ASSIGNED" => Some(Self::TaskAssigned),
            "TASK_COMPLETED" => Some(Self::TaskCompleted),
            "TASK_FAILED" => Some(Self::TaskFailed),
            "TASK_TIMEOUT" => Some(Self::TaskTimeout),
            "TASK_ORPHANED" => Some(Self::TaskOrphaned),
            "TASK_REQUEUED" => Some(Self::TaskRequeued),
            "TASK_CANCELLED" => Some(Self::TaskCancelled),
            _ => None,
        }
    }
}

/// Worker lifecycle event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerEventType {
    WorkerStarted,
    WorkerRegistered,
    WorkerTaskPulled,
    WorkerTaskCompleted,
    WorkerOffline,
}

impl WorkerEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkerStarted => "WORKER_STARTED",
            Self::WorkerRegistered => "WORKER_REGISTERED",
            Self::WorkerTaskPulled => "WORKER_TASK_PULLED",
            Self::WorkerTaskCompleted => "WORKER_TASK_COMPLETED",
            Self::WorkerOffline => "WORKER_OFFLINE",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "WORKER_STARTED" => Some(Self::WorkerStarted),
            "WORKER_REGISTERED" => Some(Self::WorkerRegistered),
            "WORKER_TASK_PULLED" => Some(Self::WorkerTaskPulled),
            "WORKER_TASK_COMPLETED" => Some(Self::WorkerTaskCompleted),
            "WORKER_OFFLINE" => Some(Self::WorkerOffline),
            _ => None,
        }
    }
}

/// An immutable task lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: Uuid,
    pub task_id: Uuid,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub event_type: TaskEventType,
    pub event_time: DateTime<Utc>,
    /// Created → assigned, on assign events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_wait_ms: Option<i64>,
    /// Started → terminal, on completion events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_ms: Option<i64>,
    /// Created → terminal, on completion events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_ms: Option<i64>,
    /// Human-readable detail (timeout reason, cancel origin)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TaskEvent {
    pub fn new(
        task_id: Uuid,
        endpoint: impl Into<String>,
        event_type: TaskEventType,
        event_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            endpoint: endpoint.into(),
            worker_id: None,
            event_type,
            event_time,
            queue_wait_ms: None,
            execution_ms: None,
            total_ms: None,
            detail: None,
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_queue_wait_ms(mut self, ms: i64) -> Self {
        self.queue_wait_ms = Some(ms);
        self
    }

    pub fn with_execution_ms(mut self, ms: i64) -> Self {
        self.execution_ms = Some(ms);
        self
    }

    pub fn with_total_ms(mut self, ms: i64) -> Self {
        self.total_ms = Some(ms);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// An immutable worker lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEvent {
    pub id: Uuid,
    pub worker_id: String,
    pub endpoint: String,
    pub event_type: WorkerEventType,
    pub event_time: DateTime<Utc>,
    /// Idle span ended by this pull, on WORKER_TASK_PULLED
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_ms: Option<i64>,
    /// Pod created → ready, on WORKER_REGISTERED
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cold_start_ms: Option<i64>,
}

impl WorkerEvent {
    pub fn new(
        worker_id: impl Into<String>,
        endpoint: impl Into<String>,
        event_type: WorkerEventType,
        event_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker_id: worker_id.into(),
            endpoint: endpoint.into(),
            event_type,
            event_time,
            idle_ms: None,
            cold_start_ms: None,
        }
    }

    pub fn with_idle_ms(mut self, ms: i64) -> Self {
        self.idle_ms = Some(ms);
        self
    }

    pub fn with_cold_start_ms(mut self, ms: i64) -> Self {
        self.cold_start_ms = Some(ms);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_round_trip() {
        for t in [
            TaskEventType::TaskCreated,
            TaskEventType::TaskQueued,
            TaskEventType::TaskAssigned,
            TaskEventType::TaskCompleted,
            TaskEventType::TaskFailed,
            TaskEventType::TaskTimeout,
            TaskEventType::TaskOrphaned,
            TaskEventType::TaskRequeued,
            TaskEventType::TaskCancelled,
        ] {
            assert_eq!(TaskEventType::from_str(t.as_str()), Some(t));
        }
        for t in [
            WorkerEventType::WorkerStarted,
            WorkerEventType::WorkerRegistered,
            WorkerEventType::WorkerTaskPulled,
            WorkerEventType::WorkerTaskCompleted,
            WorkerEventType::WorkerOffline,
        ] {
            assert_eq!(WorkerEventType::from_str(t.as_str()), Some(t));
        }
    }

    #[test]
    fn test_builder_fields() {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let event = TaskEvent::new(id, "e1", TaskEventType::TaskAssigned, now)
            .with_worker("w1")
            .with_queue_wait_ms(120);
        assert_eq!(event.task_id, id);
        assert_eq!(event.worker_id.as_deref(), Some("w1"));
        assert_eq!(event.queue_wait_ms, Some(120));
        assert!(event.execution_ms.is_none());
    }
}
