//! Deployment provider port.
//!
//! The orchestrator that owns pods is an external collaborator; the
//! dispatcher only consumes its pod state. Implementations must be safe
//! for concurrent calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::domain::errors::DomainResult;
use crate::domain::models::PodRuntimeState;

/// What happened to a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodEventKind {
    /// Pod first observed
    Added,
    /// Pod state changed
    Modified,
    /// Pod reported Ready
    Ready,
    /// Pod is terminating
    Terminating,
    /// Pod deletion confirmed
    Deleted,
}

/// One pod phase transition from the watch stream.
#[derive(Debug, Clone)]
pub struct PodEvent {
    /// Pod name (== worker ID)
    pub pod_name: String,
    /// Endpoint the pod serves
    pub endpoint: String,
    pub kind: PodEventKind,
    pub state: PodRuntimeState,
    pub pod_created_at: Option<DateTime<Utc>>,
    pub pod_started_at: Option<DateTime<Utc>>,
    pub event_time: DateTime<Utc>,
}

/// Contract with the external pod orchestrator.
#[async_trait]
pub trait DeploymentProvider: Send + Sync {
    /// Whether the pod is being terminated right now. Used as the
    /// dispatch safety net for the window before the watch callback
    /// lands; callers treat errors as "unknown" and proceed.
    async fn is_pod_terminating(&self, pod_name: &str) -> DomainResult<bool>;

    /// Snapshot of current pods as synthetic events (list-then-watch
    /// replay after a reconnect).
    async fn list_pods(&self) -> DomainResult<Vec<PodEvent>>;

    /// Subscribe to the pod event stream. The receiver ends when the
    /// provider connection drops; callers reconnect with backoff.
    async fn subscribe(&self) -> DomainResult<mpsc::Receiver<PodEvent>>;
}
