//! Worker lifecycle state machine.
//!
//! Drives worker rows from two inputs: heartbeats posted by the worker
//! agent, and pod phase transitions delivered by the deployment
//! provider's watch stream. The status rules live in one place:
//! DRAINING is sticky against heartbeats, staleness never touches
//! STARTING pods, and `failure_occurred_at` is write-once.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    normalize_endpoint, DispatchConfig, Worker, WorkerEvent, WorkerEventType, WorkerStatus,
};
use crate::domain::ports::{
    EventRepository, HeartbeatUpdate, PodEvent, PodEventKind, WorkerRepository,
};

/// One heartbeat as received from the worker agent.
#[derive(Debug, Clone)]
pub struct HeartbeatRequest {
    pub worker_id: String,
    pub endpoint: String,
    pub jobs_in_progress: Vec<String>,
    /// Standalone job count, honored when the list is empty
    pub reported_count: Option<u32>,
    pub concurrency: Option<u32>,
    pub version: Option<String>,
}

pub struct WorkerRegistry {
    workers: Arc<dyn WorkerRepository>,
    events: Arc<dyn EventRepository>,
    config: DispatchConfig,
}

impl WorkerRegistry {
    pub fn new(
        workers: Arc<dyn WorkerRepository>,
        events: Arc<dyn EventRepository>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            workers,
            events,
            config,
        }
    }

    /// Apply one heartbeat and return the updated worker row.
    ///
    /// First-heartbeat detection (a row previously in STARTING, or no
    /// row at all) emits WORKER_REGISTERED with the cold-start
    /// duration. A worker whose queue just emptied gets its
    /// `last_task_time` stamped for idle accounting.
    #[instrument(skip(self, request), fields(worker_id = %request.worker_id))]
    pub async fn process_heartbeat(&self, request: &HeartbeatRequest) -> DomainResult<Worker> {
        let now = Utc::now();

        let current_jobs = if request.jobs_in_progress.is_empty() {
            request.reported_count.unwrap_or(0)
        } else {
            request.jobs_in_progress.len() as u32
        };

        // An empty endpoint keeps the row's stored endpoint (the wire
        // heartbeat does not always carry one); new rows default it.
        let heartbeat = HeartbeatUpdate {
            worker_id: request.worker_id.clone(),
            endpoint: request.endpoint.trim().to_string(),
            jobs_in_progress: request.jobs_in_progress.clone(),
            concurrency: request.concurrency,
            version: request.version.clone(),
            now,
        };

        let outcome = self
            .workers
            .apply_heartbeat(&heartbeat, current_jobs, self.config.default_concurrency)
            .await?;

        let endpoint = outcome.worker.endpoint.clone();
        let registered_now = matches!(outcome.previous_status, None | Some(WorkerStatus::Starting));
        if registered_now {
            let mut event = WorkerEvent::new(
                &request.worker_id,
                &endpoint,
                WorkerEventType::WorkerRegistered,
                now,
            );
            if let Some(cold_start_ms) = outcome.worker.cold_start_duration_ms() {
                event = event.with_cold_start_ms(cold_start_ms);
            }
            self.emit(event).await;
            info!(worker_id = %request.worker_id, endpoint = %endpoint, "worker registered");
        }

        if outcome.previous_jobs > 0 && current_jobs == 0 {
            if let Err(e) = self.workers.set_last_task_time(&request.worker_id, now).await {
                warn!(worker_id = %request.worker_id, error = %e, "last_task_time update failed");
            }
        }

        Ok(outcome.worker)
    }

    /// Translate one pod-watch observation into worker state. Returns
    /// the worker ID when this event took the worker OFFLINE, so the
    /// caller can trigger task reclamation.
    #[instrument(skip(self, event), fields(pod = %event.pod_name, kind = ?event.kind))]
    pub async fn ingest_pod_event(&self, event: &PodEvent) -> DomainResult<Option<String>> {
        let now = event.event_time;
        let endpoint = normalize_endpoint(&event.endpoint);

        match event.kind {
            PodEventKind::Added | PodEventKind::Modified => {
                let first_sighting = self.workers.get(&event.pod_name).await?.is_none();
                self.workers
                    .upsert_pod_observed(
                        &event.pod_name,
                        &endpoint,
                        &event.state,
                        event.pod_created_at,
                        event.pod_started_at,
                        now,
                    )
                    .await?;
                if first_sighting {
                    self.emit(WorkerEvent::new(
                        &event.pod_name,
                        &endpoint,
                        WorkerEventType::WorkerStarted,
                        now,
                    ))
                    .await;
                    debug!(pod = %event.pod_name, "pod first observed, worker row created");
                }
                Ok(None)
            }
            PodEventKind::Ready => {
                self.workers
                    .upsert_pod_observed(
                        &event.pod_name,
                        &endpoint,
                        &event.state,
                        event.pod_created_at,
                        event.pod_started_at,
                        now,
                    )
                    .await?;
                let cold_start_ms = self.workers.set_pod_ready(&event.pod_name, now).await?;
                debug!(pod = %event.pod_name, ?cold_start_ms, "pod ready");
                Ok(None)
            }
            PodEventKind::Terminating => {
                // Ensure the row exists even if we never saw the pod before.
                self.workers
                    .upsert_pod_observed(
                        &event.pod_name,
                        &endpoint,
                        &event.state,
                        event.pod_created_at,
                        event.pod_started_at,
                        now,
                    )
                    .await?;
                if self.workers.mark_draining(&event.pod_name, now).await? {
                    info!(pod = %event.pod_name, "pod terminating, worker draining");
                }
                Ok(None)
            }
            PodEventKind::Deleted => {
                if self.workers.mark_offline(&event.pod_name, now).await? {
                    self.emit(WorkerEvent::new(
                        &event.pod_name,
                        &endpoint,
                        WorkerEventType::WorkerOffline,
                        now,
                    ))
                    .await;
                    info!(pod = %event.pod_name, "pod deleted, worker offline");
                    Ok(Some(event.pod_name.clone()))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Transition a worker to DRAINING (pull-path safety net).
    pub async fn begin_draining(&self, worker_id: &str) -> DomainResult<bool> {
        let drained = self.workers.mark_draining(worker_id, Utc::now()).await?;
        if drained {
            info!(worker_id, "worker draining (provider safety net)");
        }
        Ok(drained)
    }

    /// Mark workers with stale heartbeats OFFLINE. STARTING workers are
    /// exempt (cold start may exceed the heartbeat window). Returns the
    /// workers transitioned, so the caller can reclaim their tasks.
    #[instrument(skip(self))]
    pub async fn sweep_stale(&self) -> DomainResult<Vec<Worker>> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(self.config.heartbeat_timeout()).unwrap_or_default();

        let stale = self.workers.list_stale(cutoff).await?;
        let mut transitioned = Vec::with_capacity(stale.len());
        for worker in stale {
            if !self.workers.mark_offline(&worker.id, now).await? {
                continue;
            }
            // First failure detection only; an already-set stamp stays.
            if let Err(e) = self.workers.set_failure_occurred(&worker.id, now).await {
                warn!(worker_id = %worker.id, error = %e, "failure stamp write failed");
            }
            self.emit(WorkerEvent::new(
                &worker.id,
                &worker.endpoint,
                WorkerEventType::WorkerOffline,
                now,
            ))
            .await;
            warn!(
                worker_id = %worker.id,
                last_heartbeat = ?worker.last_heartbeat,
                "worker heartbeat stale, marked offline"
            );
            transitioned.push(worker);
        }
        Ok(transitioned)
    }

    /// Best-effort journal append.
    async fn emit(&self, event: WorkerEvent) {
        if let Err(e) = self.events.append_worker_event(&event).await {
            warn!(
                worker_id = %event.worker_id,
                event_type = event.event_type.as_str(),
                error = %e,
                "worker event write failed"
            );
        }
    }
}
