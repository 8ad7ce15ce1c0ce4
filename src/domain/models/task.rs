//! Task domain model.
//!
//! A task is one client submission to a named endpoint: an opaque JSON
//! payload that a worker pulls, executes, and posts a result for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::payload::Payload;

/// Status of a task in the dispatch pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Task is persisted and waiting to be claimed by a worker
    Pending,
    /// Task is claimed by a worker and executing
    InProgress,
    /// Task finished successfully
    Completed,
    /// Task failed (worker error or execution timeout)
    Failed,
    /// Task was cancelled by the client
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" | "CANCELED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if this is an active (non-terminal) state.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Valid transitions from this status.
    ///
    /// `Failed → Pending` is the explicit requeue/retry path; `InProgress
    /// → Pending` is the orphan/stale-worker requeue. `Completed` and
    /// `Cancelled` are absorbing.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::InProgress, Self::Cancelled],
            Self::InProgress => &[Self::Completed, Self::Failed, Self::Cancelled, Self::Pending],
            Self::Completed => &[],
            Self::Failed => &[Self::Pending],
            Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// One assignment of a task to a worker.
///
/// A task accumulates one record per claim; requeues close the open
/// record so the history survives re-execution on another worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Worker that held the assignment
    pub worker_id: String,
    /// When the claim succeeded
    pub started_at: DateTime<Utc>,
    /// When the assignment ended (result, requeue, or timeout); open while running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// A unit of work submitted to an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: Uuid,
    /// Endpoint this task belongs to
    pub endpoint: String,
    /// Opaque input payload (never inspected by the dispatcher)
    pub input: Payload,
    /// Current status
    pub status: TaskStatus,
    /// Opaque output payload once completed
    pub output: Option<Payload>,
    /// Error message for failed tasks
    pub error_message: Option<String>,
    /// Worker currently (or last) assigned
    pub worker_id: Option<String>,
    /// Webhook to POST the terminal result to
    pub webhook_url: Option<String>,
    /// When created
    pub created_at: DateTime<Utc>,
    /// When last updated
    pub updated_at: DateTime<Utc>,
    /// When the current assignment started
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// One record per assignment, oldest first
    pub execution_history: Vec<ExecutionRecord>,
}

/// The endpoint used when a submission names none.
pub const DEFAULT_ENDPOINT: &str = "default";

/// Coerce an optional/empty endpoint name to [`DEFAULT_ENDPOINT`].
///
/// Applied once at the admission seam so downstream code can assume a
/// non-empty endpoint.
pub fn normalize_endpoint(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        DEFAULT_ENDPOINT.to_string()
    } else {
        trimmed.to_string()
    }
}

impl Task {
    /// Create a new pending task for an endpoint.
    pub fn new(endpoint: impl AsRef<str>, input: Payload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            endpoint: normalize_endpoint(endpoint.as_ref()),
            input,
            status: TaskStatus::default(),
            output: None,
            error_message: None,
            worker_id: None,
            webhook_url: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            execution_history: Vec::new(),
        }
    }

    /// Set the webhook URL.
    pub fn with_webhook(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    /// Check if can transition to given status.
    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Check if task is terminal.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The open execution record, if the task is currently assigned.
    pub fn current_execution(&self) -> Option<&ExecutionRecord> {
        self.execution_history.iter().rev().find(|r| r.ended_at.is_none())
    }

    /// Close the open execution record, if any.
    pub fn close_execution(&mut self, ended_at: DateTime<Utc>) {
        if let Some(record) = self.execution_history.iter_mut().rev().find(|r| r.ended_at.is_none())
        {
            record.ended_at = Some(ended_at);
        }
    }

    /// Milliseconds the task waited in the queue before its first claim.
    pub fn queue_wait_ms(&self) -> Option<i64> {
        self.started_at
            .map(|s| (s - self.created_at).num_milliseconds())
    }

    /// Milliseconds spent executing the current assignment.
    pub fn execution_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        self.started_at.map(|s| (now - s).num_milliseconds())
    }
}
