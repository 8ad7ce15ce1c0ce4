//! Endpoint metadata and autoscaler configuration.
//!
//! An endpoint is the unit of scaling and configuration; every task
//! belongs to exactly one. The autoscaler itself lives outside this
//! crate and only reads the signals persisted here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::worker::WorkerStatus;

/// Deploy-time and dispatch-time configuration for one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointMetadata {
    /// Natural key
    pub name: String,
    /// Display name; defaults to `name` on save
    pub display_name: String,
    /// Container image reference
    pub image: String,
    /// Hardware spec identifier (e.g. a GPU class)
    pub gpu_spec: Option<String>,
    /// Replica count requested by the operator
    pub desired_replicas: u32,
    /// Per-endpoint execution timeout; falls back to the global default
    pub task_timeout_secs: Option<u64>,
    /// Pending-queue depth beyond which submission is not recommended;
    /// 0 disables the check
    pub max_pending: u32,
    /// Default webhook applied to tasks submitted without one
    pub webhook_url: Option<String>,
    /// Deployment status string; defaults to "Deploying" on save
    pub status: String,
    /// Last time any task for this endpoint reached a terminal state
    pub last_task_time: Option<DateTime<Utc>>,
    /// Last time the autoscaler changed the replica count
    pub last_scale_time: Option<DateTime<Utc>>,
    /// When the oldest currently-pending task was enqueued
    pub first_pending_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EndpointMetadata {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            display_name: name.clone(),
            name,
            image: image.into(),
            gpu_spec: None,
            desired_replicas: 0,
            task_timeout_secs: None,
            max_pending: 0,
            webhook_url: None,
            status: "Deploying".to_string(),
            last_task_time: None,
            last_scale_time: None,
            first_pending_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply the save-time defaults for fields left empty by the caller.
    pub fn apply_defaults(&mut self) {
        if self.status.is_empty() {
            self.status = "Deploying".to_string();
        }
        if self.display_name.is_empty() {
            self.display_name = self.name.clone();
        }
    }
}

/// Autoscaler tuning for one endpoint.
///
/// Persisted even when `max_replicas == 0` so that "autoscaling
/// disabled" is a recorded decision rather than a missing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalerConfig {
    pub endpoint: String,
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Pending-queue depth that triggers a scale-up
    pub scale_up_queue_threshold: u32,
    /// Idle seconds before a scale-down is considered
    pub scale_down_idle_secs: u64,
    pub scale_up_cooldown_secs: u64,
    pub scale_down_cooldown_secs: u64,
    /// Static priority among endpoints competing for capacity
    pub priority: i32,
    /// Allow the autoscaler to boost priority under sustained load
    pub dynamic_priority: bool,
    /// Queue depth treated as high load for the dynamic boost
    pub high_load_threshold: u32,
    /// Priority increment applied under high load
    pub priority_boost: i32,
    pub enabled: bool,
}

impl AutoscalerConfig {
    pub fn disabled(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            min_replicas: 0,
            max_replicas: 0,
            scale_up_queue_threshold: 1,
            scale_down_idle_secs: 300,
            scale_up_cooldown_secs: 60,
            scale_down_cooldown_secs: 120,
            priority: 0,
            dynamic_priority: true,
            high_load_threshold: 50,
            priority_boost: 10,
            enabled: false,
        }
    }
}

/// Endpoint metadata merged with its autoscaler config, as returned by
/// get/list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRecord {
    #[serde(flatten)]
    pub metadata: EndpointMetadata,
    pub autoscaler: AutoscalerConfig,
}

/// Live metrics for one endpoint, assembled on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub endpoint: String,
    pub pending_tasks: u64,
    pub running_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub workers_starting: u64,
    pub workers_online: u64,
    pub workers_busy: u64,
    pub workers_draining: u64,
    /// Task slots on workers that accept new work; DRAINING workers
    /// contribute nothing here
    pub available_capacity: u64,
}

impl EndpointStats {
    /// Fold one worker into the availability counters.
    pub fn count_worker(&mut self, status: WorkerStatus, concurrency: u32, current_jobs: u32) {
        match status {
            WorkerStatus::Starting => self.workers_starting += 1,
            WorkerStatus::Online => self.workers_online += 1,
            WorkerStatus::Busy => self.workers_busy += 1,
            WorkerStatus::Draining => self.workers_draining += 1,
            WorkerStatus::Offline => {}
        }
        if status.accepts_tasks() {
            self.available_capacity += u64::from(concurrency.saturating_sub(current_jobs));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_defaults() {
        let mut meta = EndpointMetadata::new("e1", "registry/image:tag");
        meta.status = String::new();
        meta.display_name = String::new();
        meta.apply_defaults();
        assert_eq!(meta.status, "Deploying");
        assert_eq!(meta.display_name, "e1");
    }

    #[test]
    fn test_draining_not_counted_as_capacity() {
        let mut stats = EndpointStats::default();
        stats.count_worker(WorkerStatus::Online, 2, 0);
        stats.count_worker(WorkerStatus::Busy, 2, 1);
        stats.count_worker(WorkerStatus::Draining, 2, 0);
        stats.count_worker(WorkerStatus::Starting, 2, 0);

        assert_eq!(stats.workers_online, 1);
        assert_eq!(stats.workers_busy, 1);
        assert_eq!(stats.workers_draining, 1);
        assert_eq!(stats.workers_starting, 1);
        // 2 free on the online worker + 1 free on the busy worker.
        assert_eq!(stats.available_capacity, 3);
    }

    #[test]
    fn test_overcommitted_worker_contributes_zero() {
        let mut stats = EndpointStats::default();
        stats.count_worker(WorkerStatus::Busy, 1, 3);
        assert_eq!(stats.available_capacity, 0);
    }
}
