//! Timeout, orphan, and reclamation sweep tests.

mod common;

use common::{age_task_start, age_worker_heartbeat, payload, setup};
use gantry::domain::models::{AutoscalerConfig, EndpointMetadata, TaskEventType, TaskStatus};
use gantry::domain::ports::EventRepository;
use gantry::services::{HeartbeatRequest, PullRequest, ResultSubmission};

fn heartbeat(worker_id: &str, endpoint: &str) -> HeartbeatRequest {
    HeartbeatRequest {
        worker_id: worker_id.to_string(),
        endpoint: endpoint.to_string(),
        jobs_in_progress: Vec::new(),
        reported_count: None,
        concurrency: Some(4),
        version: None,
    }
}

fn pull_request(worker_id: &str, endpoint: &str, batch_size: u32) -> PullRequest {
    PullRequest {
        worker_id: worker_id.to_string(),
        endpoint: endpoint.to_string(),
        jobs_in_progress: Vec::new(),
        reported_count: None,
        concurrency: Some(4),
        version: None,
        batch_size,
    }
}

/// Submit + claim one task for the worker, returning the task ID.
async fn claimed_task(h: &common::TestHarness, endpoint: &str, worker: &str) -> uuid::Uuid {
    let outcome = h.dispatcher.submit(endpoint, payload("{}"), None).await.unwrap();
    h.registry.process_heartbeat(&heartbeat(worker, endpoint)).await.unwrap();
    let jobs = h.dispatcher.pull(&pull_request(worker, endpoint, 10)).await.unwrap();
    assert!(jobs.iter().any(|j| j.id == outcome.task_id));
    outcome.task_id
}

#[tokio::test]
async fn test_timeout_sweep_uses_endpoint_override() {
    let h = setup().await;

    // e-fast times out after 1 s; e-slow uses the 600 s global default.
    let mut fast = EndpointMetadata::new("e-fast", "img:1");
    fast.task_timeout_secs = Some(1);
    h.endpoint_service
        .save(fast, AutoscalerConfig::disabled("e-fast"))
        .await
        .unwrap();

    let fast_task = claimed_task(&h, "e-fast", "w1").await;
    let slow_task = claimed_task(&h, "e-slow", "w2").await;
    age_task_start(&h.pool, fast_task, 5).await;
    age_task_start(&h.pool, slow_task, 5).await;

    let swept = h.dispatcher.sweep_timed_out().await.unwrap();
    assert_eq!(swept, 1);

    let fast = h.dispatcher.get_task(fast_task).await.unwrap();
    assert_eq!(fast.status, TaskStatus::Failed);
    let message = fast.error_message.unwrap();
    assert!(message.contains("timeout"), "unexpected message: {message}");
    assert!(message.contains("limit: 1s"), "unexpected message: {message}");

    let slow = h.dispatcher.get_task(slow_task).await.unwrap();
    assert_eq!(slow.status, TaskStatus::InProgress);

    let events = h.events.events_for_task(fast_task).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == TaskEventType::TaskTimeout));
}

#[tokio::test]
async fn test_orphan_sweep_requeues_missing_worker() {
    let h = setup().await;
    let task_id = claimed_task(&h, "e1", "w1").await;

    // The worker row disappears entirely.
    sqlx::query("DELETE FROM workers WHERE id = 'w1'")
        .execute(&h.pool)
        .await
        .unwrap();

    let requeued = h.dispatcher.sweep_orphaned().await.unwrap();
    assert_eq!(requeued, 1);

    let task = h.dispatcher.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.worker_id.is_none());
    assert!(task.started_at.is_none());
    // The first assignment survives in the history, closed.
    assert_eq!(task.execution_history.len(), 1);
    assert_eq!(task.execution_history[0].worker_id, "w1");
    assert!(task.execution_history[0].ended_at.is_some());

    let events = h.events.events_for_task(task_id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == TaskEventType::TaskRequeued));
}

#[tokio::test]
async fn test_orphan_sweep_respects_grace_period() {
    let h = setup().await;
    let task_id = claimed_task(&h, "e1", "w1").await;

    // Worker goes offline; the task started moments ago.
    age_worker_heartbeat(&h.pool, "w1", 10).await;
    let offlined = h.registry.sweep_stale().await.unwrap();
    assert_eq!(offlined.len(), 1);

    // Within the grace period the task is left alone (the worker may
    // only be partitioned).
    let requeued = h.dispatcher.sweep_orphaned().await.unwrap();
    assert_eq!(requeued, 0);
    let task = h.dispatcher.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);

    // Beyond the grace period (4 s in tests) the requeue applies.
    age_task_start(&h.pool, task_id, 10).await;
    let requeued = h.dispatcher.sweep_orphaned().await.unwrap();
    assert_eq!(requeued, 1);
    let task = h.dispatcher.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_reclaim_on_offline_respects_grace() {
    let h = setup().await;
    let young = claimed_task(&h, "e1", "w1").await;
    let old = claimed_task(&h, "e1", "w1").await;
    age_task_start(&h.pool, old, 30).await;

    let requeued = h.dispatcher.reclaim_worker_tasks("w1").await.unwrap();
    assert_eq!(requeued, 1);

    assert_eq!(
        h.dispatcher.get_task(young).await.unwrap().status,
        TaskStatus::InProgress
    );
    assert_eq!(
        h.dispatcher.get_task(old).await.unwrap().status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn test_requeue_loses_to_concurrent_result() {
    let h = setup().await;
    let task_id = claimed_task(&h, "e1", "w1").await;
    age_task_start(&h.pool, task_id, 30).await;

    // The worker's result lands before the janitor requeue.
    h.dispatcher
        .ingest_result(&ResultSubmission {
            task_id,
            output: Some(payload(r#"{"ok":true}"#)),
            error: None,
        })
        .await
        .unwrap();

    let requeued = h.dispatcher.reclaim_worker_tasks("w1").await.unwrap();
    assert_eq!(requeued, 0);

    let task = h.dispatcher.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let events = h.events.events_for_task(task_id).await.unwrap();
    assert!(!events
        .iter()
        .any(|e| e.event_type == TaskEventType::TaskRequeued));
}

#[tokio::test]
async fn test_result_loses_to_concurrent_requeue() {
    let h = setup().await;
    let task_id = claimed_task(&h, "e1", "w1").await;
    age_task_start(&h.pool, task_id, 30).await;

    // The janitor requeues first; the worker's result arrives late.
    let requeued = h.dispatcher.reclaim_worker_tasks("w1").await.unwrap();
    assert_eq!(requeued, 1);

    let task = h
        .dispatcher
        .ingest_result(&ResultSubmission {
            task_id,
            output: Some(payload(r#"{"late":true}"#)),
            error: None,
        })
        .await
        .unwrap();

    // Exactly one outcome stands: the task is PENDING for reassignment.
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.output.is_none());

    // And it can be claimed again by another worker.
    h.registry.process_heartbeat(&heartbeat("w2", "e1")).await.unwrap();
    let jobs = h.dispatcher.pull(&pull_request("w2", "e1", 1)).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, task_id);

    let task = h.dispatcher.get_task(task_id).await.unwrap();
    assert_eq!(task.execution_history.len(), 2);
}

#[tokio::test]
async fn test_unassigned_in_progress_task_is_orphaned() {
    let h = setup().await;
    let task_id = claimed_task(&h, "e1", "w1").await;

    // Corrupted assignment: IN_PROGRESS with no worker at all.
    sqlx::query("UPDATE tasks SET worker_id = NULL WHERE id = ?")
        .bind(task_id.to_string())
        .execute(&h.pool)
        .await
        .unwrap();

    let requeued = h.dispatcher.sweep_orphaned().await.unwrap();
    assert_eq!(requeued, 1);
    assert_eq!(
        h.dispatcher.get_task(task_id).await.unwrap().status,
        TaskStatus::Pending
    );
}
