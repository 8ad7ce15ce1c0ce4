//! Worker domain model.
//!
//! A worker is one pod instance managed by the external orchestrator;
//! the worker ID equals the pod name. Workers pull tasks from a single
//! endpoint's pending queue and report liveness via heartbeats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a worker pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Pod observed by the watch stream, no heartbeat yet
    Starting,
    /// Heartbeating, idle
    Online,
    /// Heartbeating with at least one task in progress
    Busy,
    /// Pod is terminating; no new tasks may be assigned
    Draining,
    /// Heartbeat stale beyond the threshold, or pod deletion confirmed
    Offline,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self::Starting
    }
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Online => "ONLINE",
            Self::Busy => "BUSY",
            Self::Draining => "DRAINING",
            Self::Offline => "OFFLINE",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "STARTING" => Some(Self::Starting),
            "ONLINE" => Some(Self::Online),
            "BUSY" => Some(Self::Busy),
            "DRAINING" => Some(Self::Draining),
            "OFFLINE" => Some(Self::Offline),
            _ => None,
        }
    }

    /// Status a heartbeat would set, honoring the sticky DRAINING rule:
    /// a heartbeat never moves a draining worker back to ONLINE/BUSY.
    pub fn from_heartbeat(current: Option<Self>, jobs_in_progress: usize) -> Self {
        if current == Some(Self::Draining) {
            return Self::Draining;
        }
        if jobs_in_progress > 0 {
            Self::Busy
        } else {
            Self::Online
        }
    }

    /// Whether the worker may be handed new tasks.
    pub fn accepts_tasks(&self) -> bool {
        matches!(self, Self::Online | Self::Busy)
    }
}

/// Pod runtime state merged from the orchestrator watch stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRuntimeState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

impl PodRuntimeState {
    /// Overlay newer fields onto the stored state, keeping known values
    /// when the incoming event omits them.
    pub fn merge(&mut self, incoming: &PodRuntimeState) {
        if incoming.phase.is_some() {
            self.phase = incoming.phase.clone();
        }
        if incoming.status.is_some() {
            self.status = incoming.status.clone();
        }
        if incoming.reason.is_some() {
            self.reason = incoming.reason.clone();
        }
        if incoming.message.is_some() {
            self.message = incoming.message.clone();
        }
        if incoming.pod_ip.is_some() {
            self.pod_ip = incoming.pod_ip.clone();
        }
        if incoming.node_name.is_some() {
            self.node_name = incoming.node_name.clone();
        }
    }
}

/// A pod instance serving one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Worker ID; equals the pod name
    pub id: String,
    /// Endpoint this worker serves
    pub endpoint: String,
    /// Current status
    pub status: WorkerStatus,
    /// Max concurrent tasks
    pub concurrency: u32,
    /// Count of tasks currently in progress (as last reported)
    pub current_jobs: u32,
    /// Task IDs in progress (as last reported by heartbeat)
    pub jobs_in_progress: Vec<String>,
    /// Worker software version, if reported
    pub version: Option<String>,
    /// Last heartbeat time
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// When the first heartbeat registered the worker
    pub registered_at: Option<DateTime<Utc>>,
    /// Pod name (1:1 with the worker ID)
    pub pod_name: String,
    /// Pod creation time from the watch stream
    pub pod_created_at: Option<DateTime<Utc>>,
    /// Pod container start time
    pub pod_started_at: Option<DateTime<Utc>>,
    /// When the pod reported Ready
    pub pod_ready_at: Option<DateTime<Utc>>,
    /// Merged pod runtime state
    pub runtime_state: PodRuntimeState,
    /// Cold start duration in milliseconds (created → ready)
    pub cold_start_ms: Option<i64>,
    /// Last time this worker finished its queue (idle accounting)
    pub last_task_time: Option<DateTime<Utc>>,
    /// First failure detection; write-once until explicitly cleared
    pub failure_occurred_at: Option<DateTime<Utc>>,
    /// When the pod began terminating
    pub terminated_at: Option<DateTime<Utc>>,
    /// Total tasks completed
    pub completed_count: u64,
    /// Total tasks failed
    pub failed_count: u64,
    /// Total execution milliseconds across all tasks
    pub execution_ms_total: i64,
    /// Row created
    pub created_at: DateTime<Utc>,
    /// Row updated
    pub updated_at: DateTime<Utc>,
}

impl Worker {
    /// Create a worker row for a pod first observed by the watch stream.
    pub fn starting(pod_name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let pod_name = pod_name.into();
        let now = Utc::now();
        Self {
            id: pod_name.clone(),
            endpoint: endpoint.into(),
            status: WorkerStatus::Starting,
            concurrency: 1,
            current_jobs: 0,
            jobs_in_progress: Vec::new(),
            version: None,
            last_heartbeat: None,
            registered_at: None,
            pod_name,
            pod_created_at: None,
            pod_started_at: None,
            pod_ready_at: None,
            runtime_state: PodRuntimeState::default(),
            cold_start_ms: None,
            last_task_time: None,
            failure_occurred_at: None,
            terminated_at: None,
            completed_count: 0,
            failed_count: 0,
            execution_ms_total: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Cold start duration: `pod_started_at - pod_created_at` when both
    /// are known, else the value recorded at pod readiness.
    pub fn cold_start_duration_ms(&self) -> Option<i64> {
        match (self.pod_created_at, self.pod_started_at) {
            (Some(created), Some(started)) => Some((started - created).num_milliseconds()),
            _ => self.cold_start_ms,
        }
    }

    /// Whether the heartbeat is older than the given cutoff. Workers in
    /// STARTING are exempt: cold starts may exceed the heartbeat window.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        if matches!(self.status, WorkerStatus::Offline | WorkerStatus::Starting) {
            return false;
        }
        match self.last_heartbeat {
            Some(hb) => hb < cutoff,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_status_derivation() {
        assert_eq!(
            WorkerStatus::from_heartbeat(None, 0),
            WorkerStatus::Online
        );
        assert_eq!(
            WorkerStatus::from_heartbeat(Some(WorkerStatus::Starting), 2),
            WorkerStatus::Busy
        );
        assert_eq!(
            WorkerStatus::from_heartbeat(Some(WorkerStatus::Online), 1),
            WorkerStatus::Busy
        );
        assert_eq!(
            WorkerStatus::from_heartbeat(Some(WorkerStatus::Busy), 0),
            WorkerStatus::Online
        );
    }

    #[test]
    fn test_draining_is_sticky_against_heartbeats() {
        assert_eq!(
            WorkerStatus::from_heartbeat(Some(WorkerStatus::Draining), 0),
            WorkerStatus::Draining
        );
        assert_eq!(
            WorkerStatus::from_heartbeat(Some(WorkerStatus::Draining), 3),
            WorkerStatus::Draining
        );
    }

    #[test]
    fn test_accepts_tasks() {
        assert!(WorkerStatus::Online.accepts_tasks());
        assert!(WorkerStatus::Busy.accepts_tasks());
        assert!(!WorkerStatus::Starting.accepts_tasks());
        assert!(!WorkerStatus::Draining.accepts_tasks());
        assert!(!WorkerStatus::Offline.accepts_tasks());
    }

    #[test]
    fn test_staleness_skips_starting() {
        let mut w = Worker::starting("pod-1", "e1");
        let cutoff = Utc::now();
        // STARTING is never stale, even with no heartbeat.
        assert!(!w.is_stale(cutoff));

        w.status = WorkerStatus::Online;
        w.last_heartbeat = Some(cutoff - chrono::Duration::seconds(10));
        assert!(w.is_stale(cutoff));

        w.last_heartbeat = Some(cutoff + chrono::Duration::seconds(10));
        assert!(!w.is_stale(cutoff));

        w.status = WorkerStatus::Offline;
        w.last_heartbeat = Some(cutoff - chrono::Duration::seconds(10));
        assert!(!w.is_stale(cutoff));
    }

    #[test]
    fn test_cold_start_prefers_pod_timestamps() {
        let mut w = Worker::starting("pod-1", "e1");
        assert!(w.cold_start_duration_ms().is_none());

        let t0 = Utc::now();
        w.pod_created_at = Some(t0);
        w.pod_started_at = Some(t0 + chrono::Duration::seconds(12));
        assert_eq!(w.cold_start_duration_ms(), Some(12_000));

        // The ready-time value is only a fallback; pod timestamps win.
        w.cold_start_ms = Some(12_200);
        assert_eq!(w.cold_start_duration_ms(), Some(12_000));

        w.pod_started_at = None;
        assert_eq!(w.cold_start_duration_ms(), Some(12_200));
    }

    #[test]
    fn test_runtime_state_merge_keeps_known_fields() {
        let mut state = PodRuntimeState {
            phase: Some("Running".into()),
            pod_ip: Some("10.0.0.5".into()),
            ..Default::default()
        };
        state.merge(&PodRuntimeState {
            reason: Some("Ready".into()),
            ..Default::default()
        });
        assert_eq!(state.phase.as_deref(), Some("Running"));
        assert_eq!(state.pod_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(state.reason.as_deref(), Some("Ready"));
    }
}
