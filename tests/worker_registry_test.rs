//! Worker lifecycle integration tests: heartbeats, pod watch, staleness.

mod common;

use chrono::Utc;
use common::{age_worker_heartbeat, setup};
use gantry::domain::models::{PodRuntimeState, WorkerEventType, WorkerStatus};
use gantry::domain::ports::{EventRepository, PodEvent, PodEventKind, WorkerRepository};
use gantry::services::HeartbeatRequest;

fn heartbeat(worker_id: &str, endpoint: &str, jobs: Vec<&str>) -> HeartbeatRequest {
    HeartbeatRequest {
        worker_id: worker_id.to_string(),
        endpoint: endpoint.to_string(),
        jobs_in_progress: jobs.into_iter().map(str::to_string).collect(),
        reported_count: None,
        concurrency: Some(2),
        version: Some("1.4.0".to_string()),
    }
}

fn pod_event(pod: &str, endpoint: &str, kind: PodEventKind) -> PodEvent {
    PodEvent {
        pod_name: pod.to_string(),
        endpoint: endpoint.to_string(),
        kind,
        state: PodRuntimeState::default(),
        pod_created_at: None,
        pod_started_at: None,
        event_time: Utc::now(),
    }
}

#[tokio::test]
async fn test_first_heartbeat_registers_worker() {
    let h = setup().await;

    let worker = h
        .registry
        .process_heartbeat(&heartbeat("w1", "e1", vec![]))
        .await
        .unwrap();
    assert_eq!(worker.status, WorkerStatus::Online);
    assert_eq!(worker.endpoint, "e1");
    assert_eq!(worker.concurrency, 2);
    assert_eq!(worker.pod_name, "w1");
    assert!(worker.last_heartbeat.is_some());
    assert!(worker.registered_at.is_some());

    let events = h
        .events
        .worker_events_between(Utc::now() - chrono::Duration::minutes(1), Utc::now())
        .await
        .unwrap();
    assert!(events
        .iter()
        .any(|e| e.worker_id == "w1" && e.event_type == WorkerEventType::WorkerRegistered));
}

#[tokio::test]
async fn test_heartbeat_with_jobs_is_busy() {
    let h = setup().await;
    let worker = h
        .registry
        .process_heartbeat(&heartbeat("w1", "e1", vec!["t1", "t2"]))
        .await
        .unwrap();
    assert_eq!(worker.status, WorkerStatus::Busy);
    assert_eq!(worker.current_jobs, 2);
    assert_eq!(worker.jobs_in_progress, vec!["t1", "t2"]);
}

#[tokio::test]
async fn test_heartbeat_preserves_draining() {
    let h = setup().await;
    h.registry
        .process_heartbeat(&heartbeat("w1", "e1", vec![]))
        .await
        .unwrap();
    assert!(h.registry.begin_draining("w1").await.unwrap());

    // A heartbeat with work in flight must not flip the status back.
    let worker = h
        .registry
        .process_heartbeat(&heartbeat("w1", "e1", vec!["t1"]))
        .await
        .unwrap();
    assert_eq!(worker.status, WorkerStatus::Draining);
    // The liveness fields still update.
    assert_eq!(worker.current_jobs, 1);
}

#[tokio::test]
async fn test_heartbeat_without_endpoint_keeps_stored_one() {
    let h = setup().await;
    h.registry
        .ingest_pod_event(&pod_event("w1", "e1", PodEventKind::Added))
        .await
        .unwrap();

    let worker = h
        .registry
        .process_heartbeat(&heartbeat("w1", "", vec![]))
        .await
        .unwrap();
    assert_eq!(worker.endpoint, "e1");
}

#[tokio::test]
async fn test_queue_emptied_stamps_last_task_time() {
    let h = setup().await;
    h.registry
        .process_heartbeat(&heartbeat("w1", "e1", vec!["t1"]))
        .await
        .unwrap();
    let worker = h
        .registry
        .process_heartbeat(&heartbeat("w1", "e1", vec![]))
        .await
        .unwrap();
    assert_eq!(worker.status, WorkerStatus::Online);

    let stored = h.workers.get("w1").await.unwrap().unwrap();
    assert!(stored.last_task_time.is_some());
}

#[tokio::test]
async fn test_pod_watch_lifecycle() {
    let h = setup().await;

    // First sighting creates the row in STARTING.
    h.registry
        .ingest_pod_event(&pod_event("w1", "e1", PodEventKind::Added))
        .await
        .unwrap();
    let worker = h.workers.get("w1").await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Starting);

    // Terminating flips to DRAINING.
    h.registry
        .ingest_pod_event(&pod_event("w1", "e1", PodEventKind::Terminating))
        .await
        .unwrap();
    let worker = h.workers.get("w1").await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Draining);
    assert!(worker.terminated_at.is_some());

    // Confirmed deletion goes OFFLINE and reports the worker for
    // task reclamation.
    let offline = h
        .registry
        .ingest_pod_event(&pod_event("w1", "e1", PodEventKind::Deleted))
        .await
        .unwrap();
    assert_eq!(offline.as_deref(), Some("w1"));
    let worker = h.workers.get("w1").await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Offline);
}

#[tokio::test]
async fn test_cold_start_measured_from_pod_timestamps() {
    let h = setup().await;
    let t0 = Utc::now() - chrono::Duration::seconds(20);

    let mut added = pod_event("w1", "e1", PodEventKind::Added);
    added.pod_created_at = Some(t0);
    h.registry.ingest_pod_event(&added).await.unwrap();

    let mut ready = pod_event("w1", "e1", PodEventKind::Ready);
    ready.pod_started_at = Some(t0 + chrono::Duration::seconds(12));
    ready.event_time = t0 + chrono::Duration::milliseconds(12_200);
    h.registry.ingest_pod_event(&ready).await.unwrap();

    // First heartbeat registers with the created→started duration.
    h.registry
        .process_heartbeat(&heartbeat("w1", "e1", vec![]))
        .await
        .unwrap();

    let events = h
        .events
        .worker_events_between(Utc::now() - chrono::Duration::minutes(1), Utc::now())
        .await
        .unwrap();
    let registered = events
        .iter()
        .find(|e| e.event_type == WorkerEventType::WorkerRegistered)
        .expect("no registration event");
    assert_eq!(registered.cold_start_ms, Some(12_000));
}

#[tokio::test]
async fn test_stale_sweep_skips_starting_and_stamps_failure_once() {
    let h = setup().await;

    // One STARTING pod with no heartbeat, one ONLINE worker gone quiet.
    h.registry
        .ingest_pod_event(&pod_event("cold", "e1", PodEventKind::Added))
        .await
        .unwrap();
    h.registry
        .process_heartbeat(&heartbeat("stale", "e1", vec![]))
        .await
        .unwrap();
    age_worker_heartbeat(&h.pool, "stale", 10).await;

    let offlined = h.registry.sweep_stale().await.unwrap();
    assert_eq!(offlined.len(), 1);
    assert_eq!(offlined[0].id, "stale");

    let cold = h.workers.get("cold").await.unwrap().unwrap();
    assert_eq!(cold.status, WorkerStatus::Starting);

    let stale = h.workers.get("stale").await.unwrap().unwrap();
    assert_eq!(stale.status, WorkerStatus::Offline);
    assert_eq!(stale.current_jobs, 0);
    let first_failure = stale.failure_occurred_at.expect("failure not stamped");

    // A later sweep must not move the stamp.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let _ = h.registry.sweep_stale().await.unwrap();
    let stale = h.workers.get("stale").await.unwrap().unwrap();
    assert_eq!(stale.failure_occurred_at, Some(first_failure));
}

#[tokio::test]
async fn test_offline_worker_can_reregister() {
    let h = setup().await;
    h.registry
        .process_heartbeat(&heartbeat("w1", "e1", vec![]))
        .await
        .unwrap();
    age_worker_heartbeat(&h.pool, "w1", 10).await;
    h.registry.sweep_stale().await.unwrap();

    // The partition heals and the worker heartbeats again.
    let worker = h
        .registry
        .process_heartbeat(&heartbeat("w1", "e1", vec![]))
        .await
        .unwrap();
    assert_eq!(worker.status, WorkerStatus::Online);
}
