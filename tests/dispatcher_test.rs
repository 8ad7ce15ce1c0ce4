//! Dispatch-path integration tests: submit, claim, result, cancel.

mod common;

use common::{payload, setup};
use gantry::domain::models::{TaskEventType, TaskStatus, WorkerStatus};
use gantry::domain::ports::{EventRepository, TaskRepository, WorkerRepository};
use gantry::services::{HeartbeatRequest, PullRequest, ResultSubmission};

fn pull_request(worker_id: &str, endpoint: &str, batch_size: u32) -> PullRequest {
    PullRequest {
        worker_id: worker_id.to_string(),
        endpoint: endpoint.to_string(),
        jobs_in_progress: Vec::new(),
        reported_count: None,
        concurrency: Some(1),
        version: None,
        batch_size,
    }
}

fn heartbeat(worker_id: &str, endpoint: &str) -> HeartbeatRequest {
    HeartbeatRequest {
        worker_id: worker_id.to_string(),
        endpoint: endpoint.to_string(),
        jobs_in_progress: Vec::new(),
        reported_count: None,
        concurrency: Some(1),
        version: None,
    }
}

#[tokio::test]
async fn test_submit_creates_pending_task_with_events() {
    let h = setup().await;

    let outcome = h
        .dispatcher
        .submit("e1", payload(r#"{"prompt":"hello"}"#), None)
        .await
        .unwrap();
    assert_eq!(outcome.status, TaskStatus::Pending);
    assert!(outcome.recommended);

    let task = h.dispatcher.get_task(outcome.task_id).await.unwrap();
    assert_eq!(task.endpoint, "e1");
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.worker_id.is_none());

    let events = h.events.events_for_task(task.id).await.unwrap();
    let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
    assert!(types.contains(&TaskEventType::TaskCreated));
    assert!(types.contains(&TaskEventType::TaskQueued));
}

#[tokio::test]
async fn test_submit_empty_endpoint_uses_default() {
    let h = setup().await;
    let outcome = h
        .dispatcher
        .submit("", payload("{}"), None)
        .await
        .unwrap();
    let task = h.dispatcher.get_task(outcome.task_id).await.unwrap();
    assert_eq!(task.endpoint, "default");
}

#[tokio::test]
async fn test_claim_race_single_winner() {
    let h = setup().await;

    let outcome = h
        .dispatcher
        .submit("e1", payload(r#"{"n":1}"#), None)
        .await
        .unwrap();

    // Both workers are known and healthy.
    h.registry.process_heartbeat(&heartbeat("w1", "e1")).await.unwrap();
    h.registry.process_heartbeat(&heartbeat("w2", "e1")).await.unwrap();

    let req1 = pull_request("w1", "e1", 1);
    let req2 = pull_request("w2", "e1", 1);
    let (a, b) = tokio::join!(
        h.dispatcher.pull(&req1),
        h.dispatcher.pull(&req2),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    // Exactly one pull wins the task.
    assert_eq!(a.len() + b.len(), 1);

    let task = h.dispatcher.get_task(outcome.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert!(task.worker_id.is_some());
    assert!(task.started_at.is_some());
    assert_eq!(task.execution_history.len(), 1);

    let events = h.events.events_for_task(task.id).await.unwrap();
    let assigned = events
        .iter()
        .filter(|e| e.event_type == TaskEventType::TaskAssigned)
        .count();
    assert_eq!(assigned, 1);
}

#[tokio::test]
async fn test_claim_is_fifo_by_creation_time() {
    let h = setup().await;

    let first = h.dispatcher.submit("e1", payload(r#"{"n":1}"#), None).await.unwrap();
    let second = h.dispatcher.submit("e1", payload(r#"{"n":2}"#), None).await.unwrap();

    h.registry.process_heartbeat(&heartbeat("w1", "e1")).await.unwrap();
    let jobs = h.dispatcher.pull(&pull_request("w1", "e1", 2)).await.unwrap();

    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].id, first.task_id);
    assert_eq!(jobs[1].id, second.task_id);
}

#[tokio::test]
async fn test_draining_worker_gets_no_tasks() {
    let h = setup().await;
    h.dispatcher.submit("e1", payload("{}"), None).await.unwrap();

    h.registry.process_heartbeat(&heartbeat("w1", "e1")).await.unwrap();
    assert!(h.registry.begin_draining("w1").await.unwrap());

    let jobs = h.dispatcher.pull(&pull_request("w1", "e1", 1)).await.unwrap();
    assert!(jobs.is_empty());

    // The pending task is untouched.
    let pending = h.tasks.list_by_status(TaskStatus::Pending, Some("e1")).await.unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn test_provider_safety_net_drains_worker() {
    let h = setup().await;
    h.dispatcher.submit("e1", payload("{}"), None).await.unwrap();

    // Worker is ONLINE; the pod-watch callback has not fired, but the
    // provider already reports the pod terminating.
    h.registry.process_heartbeat(&heartbeat("w1", "e1")).await.unwrap();
    h.provider.add_pod("w1", "e1");
    h.provider.set_terminating_silently("w1");

    let jobs = h.dispatcher.pull(&pull_request("w1", "e1", 1)).await.unwrap();
    assert!(jobs.is_empty());

    let worker = h.workers.get("w1").await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Draining);
}

#[tokio::test]
async fn test_result_ingest_completes_task() {
    let h = setup().await;
    let outcome = h
        .dispatcher
        .submit("e1", payload(r#"{"prompt":"x"}"#), None)
        .await
        .unwrap();
    h.registry.process_heartbeat(&heartbeat("w1", "e1")).await.unwrap();
    h.dispatcher.pull(&pull_request("w1", "e1", 1)).await.unwrap();

    let output_text = r#"{"answer": 42, "tokens": [1, 2, 3]}"#;
    let task = h
        .dispatcher
        .ingest_result(&ResultSubmission {
            task_id: outcome.task_id,
            output: Some(payload(output_text)),
            error: None,
        })
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.completed_at.is_some());
    // Opaque payloads survive the store round trip byte-identical.
    assert_eq!(task.output.as_ref().unwrap().as_str(), output_text);
    assert_eq!(task.execution_history.len(), 1);
    assert!(task.execution_history[0].ended_at.is_some());

    let worker = h.workers.get("w1").await.unwrap().unwrap();
    assert_eq!(worker.completed_count, 1);
    assert_eq!(worker.failed_count, 0);
}

#[tokio::test]
async fn test_result_with_error_fails_task() {
    let h = setup().await;
    let outcome = h.dispatcher.submit("e1", payload("{}"), None).await.unwrap();
    h.registry.process_heartbeat(&heartbeat("w1", "e1")).await.unwrap();
    h.dispatcher.pull(&pull_request("w1", "e1", 1)).await.unwrap();

    let task = h
        .dispatcher
        .ingest_result(&ResultSubmission {
            task_id: outcome.task_id,
            output: None,
            error: Some("CUDA out of memory".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error_message.as_deref(), Some("CUDA out of memory"));

    let worker = h.workers.get("w1").await.unwrap().unwrap();
    assert_eq!(worker.failed_count, 1);
}

#[tokio::test]
async fn test_duplicate_result_is_noop() {
    let h = setup().await;
    let outcome = h.dispatcher.submit("e1", payload("{}"), None).await.unwrap();
    h.registry.process_heartbeat(&heartbeat("w1", "e1")).await.unwrap();
    h.dispatcher.pull(&pull_request("w1", "e1", 1)).await.unwrap();

    let submission = ResultSubmission {
        task_id: outcome.task_id,
        output: Some(payload(r#"{"v":1}"#)),
        error: None,
    };
    let first = h.dispatcher.ingest_result(&submission).await.unwrap();
    assert_eq!(first.status, TaskStatus::Completed);
    let completed_at = first.completed_at;

    // A retried worker posts again; nothing moves.
    let second = h
        .dispatcher
        .ingest_result(&ResultSubmission {
            task_id: outcome.task_id,
            output: Some(payload(r#"{"v":2}"#)),
            error: None,
        })
        .await
        .unwrap();
    assert_eq!(second.status, TaskStatus::Completed);
    assert_eq!(second.completed_at, completed_at);
    assert_eq!(second.output.as_ref().unwrap().as_str(), r#"{"v":1}"#);
}

#[tokio::test]
async fn test_cancel_mid_flight_beats_result() {
    let h = setup().await;
    let outcome = h.dispatcher.submit("e1", payload("{}"), None).await.unwrap();
    h.registry.process_heartbeat(&heartbeat("w1", "e1")).await.unwrap();
    h.dispatcher.pull(&pull_request("w1", "e1", 1)).await.unwrap();

    let cancelled = h.dispatcher.cancel(outcome.task_id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.worker_id.is_none());
    assert!(cancelled.started_at.is_none());
    assert!(cancelled.completed_at.is_none());

    // The worker's late result must not resurrect the task.
    let after_result = h
        .dispatcher
        .ingest_result(&ResultSubmission {
            task_id: outcome.task_id,
            output: Some(payload(r#"{"late":true}"#)),
            error: None,
        })
        .await
        .unwrap();
    assert_eq!(after_result.status, TaskStatus::Cancelled);
    assert!(after_result.output.is_none());

    let events = h.events.events_for_task(outcome.task_id).await.unwrap();
    let cancelled_events = events
        .iter()
        .filter(|e| e.event_type == TaskEventType::TaskCancelled)
        .count();
    assert_eq!(cancelled_events, 1);
}

#[tokio::test]
async fn test_cancel_terminal_task_conflicts() {
    let h = setup().await;
    let outcome = h.dispatcher.submit("e1", payload("{}"), None).await.unwrap();
    h.registry.process_heartbeat(&heartbeat("w1", "e1")).await.unwrap();
    h.dispatcher.pull(&pull_request("w1", "e1", 1)).await.unwrap();
    h.dispatcher
        .ingest_result(&ResultSubmission {
            task_id: outcome.task_id,
            output: Some(payload("{}")),
            error: None,
        })
        .await
        .unwrap();

    let err = h.dispatcher.cancel(outcome.task_id).await.unwrap_err();
    assert!(matches!(
        err,
        gantry::DomainError::InvalidStateTransition { .. }
    ));
}

#[tokio::test]
async fn test_admission_signal_over_limit() {
    let h = setup().await;

    // Configure e1 with a pending limit of 1.
    let metadata = {
        let mut m = gantry::domain::models::EndpointMetadata::new("e1", "img:1");
        m.max_pending = 1;
        m
    };
    h.endpoint_service
        .save(metadata, gantry::domain::models::AutoscalerConfig::disabled("e1"))
        .await
        .unwrap();

    let first = h.dispatcher.submit("e1", payload("{}"), None).await.unwrap();
    assert!(first.recommended);

    // Queue is at the limit now; submission is accepted but flagged.
    let second = h.dispatcher.submit("e1", payload("{}"), None).await.unwrap();
    assert!(!second.recommended);
    assert!(h.dispatcher.get_task(second.task_id).await.is_ok());

    let admission = h.dispatcher.check_admission("e1").await.unwrap();
    assert!(!admission.should_submit);
    assert_eq!(admission.pending, 2);
    assert_eq!(admission.limit, 1);
}

#[tokio::test]
async fn test_wait_for_terminal_times_out_with_task() {
    let h = setup().await;
    let outcome = h.dispatcher.submit("e1", payload("{}"), None).await.unwrap();

    let deadline = chrono::Utc::now();
    let task = h
        .dispatcher
        .wait_for_terminal(outcome.task_id, deadline)
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
}
