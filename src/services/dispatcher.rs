//! Task dispatch: the task lifecycle state machine.
//!
//! Owns submit, the atomic PENDING→IN_PROGRESS claim, result ingest,
//! cancel, and the periodic timeout/orphan/reclaim sweeps. All
//! mutual exclusion is delegated to the store's conditional updates;
//! losing a CAS race is a documented skip, never an error.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    normalize_endpoint, DispatchConfig, Payload, Task, TaskEvent, TaskEventType, TaskStatus,
    WorkerEvent, WorkerEventType, WorkerStatus,
};
use crate::domain::ports::{
    DeploymentProvider, EndpointRepository, EventRepository, TaskCasUpdate, TaskRepository,
    WorkerRepository,
};
use crate::services::stats_service::StatsService;
use crate::services::webhook::WebhookDispatcher;
use crate::services::worker_registry::{HeartbeatRequest, WorkerRegistry};

/// Result of a submit call.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub task_id: Uuid,
    pub status: TaskStatus,
    /// False when the endpoint's pending queue is at or past its
    /// configured limit; the task is still accepted.
    pub recommended: bool,
}

/// Read-only submit-eligibility signal.
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    pub should_submit: bool,
    pub pending: u64,
    /// Configured max pending; 0 means unlimited
    pub limit: u32,
}

/// One pull request from a worker.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub worker_id: String,
    pub endpoint: String,
    pub jobs_in_progress: Vec<String>,
    pub reported_count: Option<u32>,
    pub concurrency: Option<u32>,
    pub version: Option<String>,
    pub batch_size: u32,
}

/// One entry handed to a worker.
#[derive(Debug, Clone)]
pub struct PulledJob {
    pub id: Uuid,
    pub input: Payload,
}

/// A result posted by a worker.
#[derive(Debug, Clone)]
pub struct ResultSubmission {
    pub task_id: Uuid,
    pub output: Option<Payload>,
    pub error: Option<String>,
}

pub struct TaskDispatcher {
    tasks: Arc<dyn TaskRepository>,
    workers: Arc<dyn WorkerRepository>,
    events: Arc<dyn EventRepository>,
    endpoints: Arc<dyn EndpointRepository>,
    provider: Arc<dyn DeploymentProvider>,
    registry: Arc<WorkerRegistry>,
    stats: Arc<StatsService>,
    webhooks: WebhookDispatcher,
    config: DispatchConfig,
}

impl TaskDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        workers: Arc<dyn WorkerRepository>,
        events: Arc<dyn EventRepository>,
        endpoints: Arc<dyn EndpointRepository>,
        provider: Arc<dyn DeploymentProvider>,
        registry: Arc<WorkerRegistry>,
        stats: Arc<StatsService>,
        webhooks: WebhookDispatcher,
        config: DispatchConfig,
    ) -> Self {
        Self {
            tasks,
            workers,
            events,
            endpoints,
            provider,
            registry,
            stats,
            webhooks,
            config,
        }
    }

    // ------------------------------------------------------------------
    // Submit
    // ------------------------------------------------------------------

    /// Read-only eligibility check for an endpoint.
    pub async fn check_admission(&self, endpoint: &str) -> DomainResult<Admission> {
        let endpoint = normalize_endpoint(endpoint);
        let pending = self.tasks.count_pending(&endpoint).await?;
        let limit = match self.endpoints.get(&endpoint).await? {
            Some(record) => record.metadata.max_pending,
            None => 0,
        };
        let should_submit = limit == 0 || pending < u64::from(limit);
        Ok(Admission {
            should_submit,
            pending,
            limit,
        })
    }

    /// Persist a new task. An over-limit queue is reported through the
    /// outcome but never refuses the submission.
    #[instrument(skip(self, input, webhook_url), fields(endpoint = %endpoint))]
    pub async fn submit(
        &self,
        endpoint: &str,
        input: Payload,
        webhook_url: Option<String>,
    ) -> DomainResult<SubmitOutcome> {
        let endpoint = normalize_endpoint(endpoint);
        let admission = self.check_admission(&endpoint).await?;
        if !admission.should_submit {
            warn!(
                endpoint = %endpoint,
                pending = admission.pending,
                limit = admission.limit,
                "pending queue over limit, submission accepted anyway"
            );
        }

        let mut task = Task::new(&endpoint, input);
        if let Some(url) = webhook_url {
            task.webhook_url = Some(url);
        } else if let Some(record) = self.endpoints.get(&endpoint).await? {
            task.webhook_url = record.metadata.webhook_url;
        }

        self.tasks.create(&task).await?;

        let now = task.created_at;
        self.emit(TaskEvent::new(task.id, &endpoint, TaskEventType::TaskCreated, now))
            .await;
        self.emit(TaskEvent::new(task.id, &endpoint, TaskEventType::TaskQueued, now))
            .await;
        self.stats
            .record_transition(&endpoint, None, TaskStatus::Pending);
        self.refresh_first_pending(&endpoint).await;

        debug!(task_id = %task.id, "task submitted");
        Ok(SubmitOutcome {
            task_id: task.id,
            status: task.status,
            recommended: admission.should_submit,
        })
    }

    /// Get a task by ID.
    pub async fn get_task(&self, id: Uuid) -> DomainResult<Task> {
        self.tasks
            .get(id)
            .await?
            .ok_or(DomainError::TaskNotFound(id))
    }

    /// Block until the task is terminal or the deadline passes,
    /// polling at the configured interval. Returns the task either way.
    pub async fn wait_for_terminal(
        &self,
        id: Uuid,
        deadline: DateTime<Utc>,
    ) -> DomainResult<Task> {
        let interval =
            std::time::Duration::from_secs(self.config.sync_poll_interval_secs.max(1));
        loop {
            let task = self.get_task(id).await?;
            if task.is_terminal() || Utc::now() >= deadline {
                return Ok(task);
            }
            sleep(interval).await;
        }
    }

    // ------------------------------------------------------------------
    // Claim (worker pull)
    // ------------------------------------------------------------------

    /// The worker pull path: heartbeat, draining checks, then the
    /// transactional batch claim. Returns zero jobs when the worker is
    /// draining or the queue is empty.
    #[instrument(skip(self, request), fields(worker_id = %request.worker_id))]
    pub async fn pull(&self, request: &PullRequest) -> DomainResult<Vec<PulledJob>> {
        // Step 1: heartbeat keeps liveness accurate even for an
        // ultimately-empty pull.
        let worker = self
            .registry
            .process_heartbeat(&HeartbeatRequest {
                worker_id: request.worker_id.clone(),
                endpoint: request.endpoint.clone(),
                jobs_in_progress: request.jobs_in_progress.clone(),
                reported_count: request.reported_count,
                concurrency: request.concurrency,
                version: request.version.clone(),
            })
            .await?;

        // The worker row is authoritative for the queue it serves; the
        // wire pull may omit the endpoint.
        let endpoint = if request.endpoint.trim().is_empty() {
            worker.endpoint.clone()
        } else {
            normalize_endpoint(&request.endpoint)
        };

        // Step 2: the stored status already says draining.
        if worker.status == WorkerStatus::Draining {
            return Ok(Vec::new());
        }

        // Step 3: safety net for the window before the pod-watch
        // callback fires. Provider errors must not block dispatch.
        match self.provider.is_pod_terminating(&worker.pod_name).await {
            Ok(true) => {
                self.registry.begin_draining(&request.worker_id).await?;
                return Ok(Vec::new());
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    worker_id = %request.worker_id,
                    error = %e,
                    "provider termination check failed, proceeding"
                );
            }
        }

        // Steps 4-7 run inside one transaction in the store, including
        // a draining re-check against the worker row.
        let now = Utc::now();
        let claimed = self
            .tasks
            .assign_pending(&endpoint, &request.worker_id, request.batch_size.max(1), now)
            .await?;

        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        for task in &claimed {
            let mut event =
                TaskEvent::new(task.id, &endpoint, TaskEventType::TaskAssigned, now)
                    .with_worker(&request.worker_id);
            if let Some(wait) = task.queue_wait_ms() {
                event = event.with_queue_wait_ms(wait);
            }
            self.emit(event).await;
            self.stats
                .record_transition(&endpoint, Some(TaskStatus::Pending), TaskStatus::InProgress);
        }

        // Idle accounting: this pull ended an idle span.
        if worker.current_jobs == 0 {
            if let Some(idle_since) = worker.last_task_time {
                let event = WorkerEvent::new(
                    &request.worker_id,
                    &endpoint,
                    WorkerEventType::WorkerTaskPulled,
                    now,
                )
                .with_idle_ms((now - idle_since).num_milliseconds().max(0));
                if let Err(e) = self.events.append_worker_event(&event).await {
                    warn!(worker_id = %request.worker_id, error = %e, "worker event write failed");
                }
            }
        }

        self.refresh_first_pending(&endpoint).await;

        info!(
            worker_id = %request.worker_id,
            endpoint = %endpoint,
            claimed = claimed.len(),
            "tasks assigned"
        );
        Ok(claimed
            .into_iter()
            .map(|task| PulledJob {
                id: task.id,
                input: task.input,
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Result ingest
    // ------------------------------------------------------------------

    /// Ingest a worker-posted result. Terminal states are absorbing: a
    /// result against a CANCELLED task is rejected with a warning, and
    /// a duplicate post against COMPLETED/FAILED is an idempotent no-op.
    #[instrument(skip(self, submission), fields(task_id = %submission.task_id))]
    pub async fn ingest_result(&self, submission: &ResultSubmission) -> DomainResult<Task> {
        let task = self.get_task(submission.task_id).await?;

        if task.is_terminal() {
            if task.status == TaskStatus::Cancelled {
                warn!(
                    task_id = %task.id,
                    "result for cancelled task rejected, terminal state preserved"
                );
            } else {
                debug!(task_id = %task.id, status = task.status.as_str(), "duplicate result ignored");
            }
            return Ok(task);
        }

        if task.status == TaskStatus::Pending {
            warn!(
                task_id = %task.id,
                "result for unassigned task skipped (requeued concurrently)"
            );
            return Ok(task);
        }

        let now = Utc::now();
        let failed = submission.error.is_some();
        let new_status = if failed {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        let execution_ms = task.execution_ms(now).unwrap_or(0);

        let update = TaskCasUpdate {
            status: new_status,
            worker_id: task.worker_id.clone(),
            started_at: task.started_at,
            completed_at: Some(now),
            output: submission.output.clone(),
            error_message: submission.error.clone(),
            updated_at: now,
            close_history_at: Some(now),
        };

        let applied = self
            .tasks
            .update_if_status(task.id, TaskStatus::InProgress, update)
            .await?;
        if !applied {
            // A cancel or requeue won the race after our read.
            let current = self.get_task(task.id).await?;
            warn!(
                task_id = %task.id,
                status = current.status.as_str(),
                "result lost the race, state preserved"
            );
            return Ok(current);
        }

        let event_type = if failed {
            TaskEventType::TaskFailed
        } else {
            TaskEventType::TaskCompleted
        };
        let mut event = TaskEvent::new(task.id, &task.endpoint, event_type, now)
            .with_execution_ms(execution_ms)
            .with_total_ms((now - task.created_at).num_milliseconds());
        if let Some(worker_id) = &task.worker_id {
            event = event.with_worker(worker_id);
        }
        self.emit(event).await;
        self.stats
            .record_transition(&task.endpoint, Some(TaskStatus::InProgress), new_status);

        if let Some(worker_id) = &task.worker_id {
            if let Err(e) = self
                .workers
                .record_task_completion(worker_id, execution_ms, failed, now)
                .await
            {
                warn!(worker_id = %worker_id, error = %e, "worker completion counters failed");
            }
            let worker_event = WorkerEvent::new(
                worker_id,
                &task.endpoint,
                WorkerEventType::WorkerTaskCompleted,
                now,
            );
            if let Err(e) = self.events.append_worker_event(&worker_event).await {
                warn!(worker_id = %worker_id, error = %e, "worker event write failed");
            }
        }

        // Autoscaler idle signal.
        if let Err(e) = self.endpoints.set_last_task_time(&task.endpoint, now).await {
            warn!(endpoint = %task.endpoint, error = %e, "last_task_time update failed");
        }

        let updated = self.get_task(task.id).await?;
        if let Some(url) = updated.webhook_url.clone() {
            self.webhooks.dispatch(url, &updated);
        }

        info!(task_id = %task.id, status = updated.status.as_str(), "result ingested");
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Cancel
    // ------------------------------------------------------------------

    /// Cancel a PENDING or IN_PROGRESS task. CANCELLED is absorbing: a
    /// result landing later must not resurrect the task.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid) -> DomainResult<Task> {
        // The CAS can lose to a claim or requeue moving the task
        // between the active states; re-read and try again.
        loop {
            let task = self.get_task(id).await?;

            if task.is_terminal() {
                return Err(DomainError::InvalidStateTransition {
                    from: task.status.as_str().to_string(),
                    to: TaskStatus::Cancelled.as_str().to_string(),
                });
            }

            let now = Utc::now();
            let previous = task.status;
            let update = TaskCasUpdate {
                status: TaskStatus::Cancelled,
                worker_id: None,
                started_at: None,
                completed_at: None,
                output: None,
                error_message: None,
                updated_at: now,
                close_history_at: (previous == TaskStatus::InProgress).then_some(now),
            };

            if !self.tasks.update_if_status(id, previous, update).await? {
                continue;
            }

            let mut event = TaskEvent::new(id, &task.endpoint, TaskEventType::TaskCancelled, now);
            if let Some(worker_id) = &task.worker_id {
                event = event.with_worker(worker_id);
            }
            self.emit(event).await;
            self.stats
                .record_transition(&task.endpoint, Some(previous), TaskStatus::Cancelled);
            if previous == TaskStatus::Pending {
                self.refresh_first_pending(&task.endpoint).await;
            }

            info!(task_id = %id, "task cancelled");
            return self.get_task(id).await;
        }
    }

    // ------------------------------------------------------------------
    // Sweeps
    // ------------------------------------------------------------------

    /// Fail IN_PROGRESS tasks that exceeded their endpoint's timeout
    /// (or the global default). Endpoint timeouts are batch-fetched
    /// upfront.
    #[instrument(skip(self))]
    pub async fn sweep_timed_out(&self) -> DomainResult<usize> {
        let now = Utc::now();
        let timeouts = self.endpoints.task_timeouts().await?;
        let in_progress = self.tasks.list_by_status(TaskStatus::InProgress, None).await?;

        let mut failed = 0;
        for task in in_progress {
            let limit_secs = timeouts
                .get(&task.endpoint)
                .copied()
                .unwrap_or(self.config.task_timeout_secs);
            let Some(running_ms) = task.execution_ms(now) else {
                continue;
            };
            if running_ms <= (limit_secs as i64) * 1000 {
                continue;
            }

            let message = format!(
                "Task execution timeout after {}s (limit: {}s)",
                running_ms / 1000,
                limit_secs
            );
            let update = TaskCasUpdate {
                status: TaskStatus::Failed,
                worker_id: task.worker_id.clone(),
                started_at: task.started_at,
                completed_at: Some(now),
                output: None,
                error_message: Some(message.clone()),
                updated_at: now,
                close_history_at: Some(now),
            };
            let applied = self
                .tasks
                .update_if_status(task.id, TaskStatus::InProgress, update)
                .await?;
            if !applied {
                continue;
            }

            let mut event = TaskEvent::new(task.id, &task.endpoint, TaskEventType::TaskTimeout, now)
                .with_execution_ms(running_ms)
                .with_detail(message);
            if let Some(worker_id) = &task.worker_id {
                event = event.with_worker(worker_id);
            }
            self.emit(event).await;
            self.stats.record_transition(
                &task.endpoint,
                Some(TaskStatus::InProgress),
                TaskStatus::Failed,
            );
            warn!(task_id = %task.id, limit_secs, "task timed out");
            failed += 1;
        }
        Ok(failed)
    }

    /// Requeue IN_PROGRESS tasks whose worker is gone: no worker at
    /// all, a missing worker row, or an OFFLINE worker past the grace
    /// period.
    #[instrument(skip(self))]
    pub async fn sweep_orphaned(&self) -> DomainResult<usize> {
        let now = Utc::now();
        let in_progress = self.tasks.list_by_status(TaskStatus::InProgress, None).await?;

        let mut requeued = 0;
        for task in in_progress {
            let (orphaned, within_grace) = match &task.worker_id {
                None => (true, false),
                Some(worker_id) => match self.workers.get(worker_id).await? {
                    None => (true, false),
                    Some(worker) if worker.status == WorkerStatus::Offline => {
                        (true, self.within_grace(&task, now))
                    }
                    Some(_) => (false, false),
                },
            };
            if !orphaned || within_grace {
                continue;
            }
            if self.requeue_task(&task, now, "worker gone").await? {
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    /// Requeue the IN_PROGRESS tasks of one worker, respecting the
    /// grace period. Called when a worker transitions to OFFLINE.
    #[instrument(skip(self))]
    pub async fn reclaim_worker_tasks(&self, worker_id: &str) -> DomainResult<usize> {
        let now = Utc::now();
        let tasks = self.tasks.in_progress_by_worker(worker_id).await?;

        let mut requeued = 0;
        for task in tasks {
            if self.within_grace(&task, now) {
                debug!(
                    task_id = %task.id,
                    worker_id,
                    "task within grace period, left in progress"
                );
                continue;
            }
            if self.requeue_task(&task, now, "worker offline").await? {
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    /// A task younger than the grace period is left alone: its worker
    /// may only be partitioned, and the task may still complete.
    fn within_grace(&self, task: &Task, now: DateTime<Utc>) -> bool {
        match task.started_at {
            Some(started) => {
                let grace =
                    chrono::Duration::from_std(self.config.grace_period()).unwrap_or_default();
                now - started < grace
            }
            None => false,
        }
    }

    async fn requeue_task(
        &self,
        task: &Task,
        now: DateTime<Utc>,
        reason: &str,
    ) -> DomainResult<bool> {
        let mut requeue_event =
            TaskEvent::new(task.id, &task.endpoint, TaskEventType::TaskRequeued, now)
                .with_detail(reason);
        if let Some(worker_id) = &task.worker_id {
            requeue_event = requeue_event.with_worker(worker_id);
        }

        let applied = self
            .tasks
            .requeue_in_progress(task.id, now, &requeue_event)
            .await?;
        if !applied {
            // The worker posted a result first; that outcome stands.
            debug!(task_id = %task.id, "status changed during requeue, skipped");
            return Ok(false);
        }

        // Orphan marker is best-effort; the requeue event above shared
        // the state-change transaction.
        let mut orphan_event =
            TaskEvent::new(task.id, &task.endpoint, TaskEventType::TaskOrphaned, now)
                .with_detail(reason);
        if let Some(worker_id) = &task.worker_id {
            orphan_event = orphan_event.with_worker(worker_id);
        }
        self.emit(orphan_event).await;

        self.stats.record_transition(
            &task.endpoint,
            Some(TaskStatus::InProgress),
            TaskStatus::Pending,
        );
        self.refresh_first_pending(&task.endpoint).await;
        info!(task_id = %task.id, reason, "task requeued");
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Keep the endpoint's first-pending signal in sync with the queue.
    async fn refresh_first_pending(&self, endpoint: &str) {
        let oldest = match self.tasks.oldest_pending_created_at(endpoint).await {
            Ok(oldest) => oldest,
            Err(e) => {
                warn!(endpoint, error = %e, "oldest pending lookup failed");
                return;
            }
        };
        if let Err(e) = self.endpoints.set_first_pending_time(endpoint, oldest).await {
            warn!(endpoint, error = %e, "first_pending_time update failed");
        }
    }

    /// Best-effort journal append.
    async fn emit(&self, event: TaskEvent) {
        if let Err(e) = self.events.append_task_event(&event).await {
            warn!(
                task_id = %event.task_id,
                event_type = event.event_type.as_str(),
                error = %e,
                "task event write failed"
            );
        }
    }
}
