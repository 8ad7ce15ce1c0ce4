//! Common test utilities for integration tests.
//!
//! Builds a fully wired dispatch stack over an in-memory SQLite pool
//! with short timeouts suitable for tests.
#![allow(dead_code)]

use std::sync::Arc;

use gantry::adapters::provider::StaticProvider;
use gantry::adapters::sqlite::{
    store, SqliteEndpointRepository, SqliteEventRepository, SqliteStatsRepository,
    SqliteTaskRepository, SqliteWorkerRepository,
};
use gantry::domain::models::{DispatchConfig, Payload, StatsConfig, WebhookConfig};
use gantry::services::{
    EndpointService, StatsAggregator, StatsService, TaskDispatcher, WebhookDispatcher,
    WorkerRegistry,
};
use sqlx::SqlitePool;

pub struct TestHarness {
    pub pool: SqlitePool,
    pub tasks: Arc<SqliteTaskRepository>,
    pub workers: Arc<SqliteWorkerRepository>,
    pub events: Arc<SqliteEventRepository>,
    pub endpoints: Arc<SqliteEndpointRepository>,
    pub stats_repo: Arc<SqliteStatsRepository>,
    pub provider: Arc<StaticProvider>,
    pub registry: Arc<WorkerRegistry>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub endpoint_service: Arc<EndpointService>,
    pub aggregator: Arc<StatsAggregator>,
    pub stats: Arc<StatsService>,
}

/// Dispatch timings tightened for tests: 2 s heartbeats, 4 s grace,
/// 600 s task timeout.
pub fn test_dispatch_config() -> DispatchConfig {
    DispatchConfig {
        heartbeat_timeout_secs: 2,
        grace_period_secs: 4,
        task_timeout_secs: 600,
        default_concurrency: 1,
        sync_poll_interval_secs: 1,
    }
}

pub async fn setup() -> TestHarness {
    setup_with_config(test_dispatch_config()).await
}

pub async fn setup_with_config(config: DispatchConfig) -> TestHarness {
    let pool = store::open_in_memory()
        .await
        .expect("failed to open in-memory store");

    let tasks = Arc::new(SqliteTaskRepository::new(pool.clone()));
    let workers = Arc::new(SqliteWorkerRepository::new(pool.clone()));
    let events = Arc::new(SqliteEventRepository::new(pool.clone()));
    let endpoints = Arc::new(SqliteEndpointRepository::new(pool.clone()));
    let stats_repo = Arc::new(SqliteStatsRepository::new(pool.clone()));
    let provider = Arc::new(StaticProvider::new());

    let stats = StatsService::new(
        stats_repo.clone(),
        tasks.clone(),
        &StatsConfig {
            queue_capacity: 256,
            drain_workers: 1,
        },
    );
    let registry = Arc::new(WorkerRegistry::new(
        workers.clone(),
        events.clone(),
        config.clone(),
    ));
    let dispatcher = Arc::new(TaskDispatcher::new(
        tasks.clone(),
        workers.clone(),
        events.clone(),
        endpoints.clone(),
        provider.clone(),
        registry.clone(),
        stats.clone(),
        WebhookDispatcher::new(&WebhookConfig::default()),
        config,
    ));
    let endpoint_service = Arc::new(EndpointService::new(
        endpoints.clone(),
        tasks.clone(),
        workers.clone(),
    ));
    let aggregator = Arc::new(StatsAggregator::new(
        events.clone(),
        workers.clone(),
        stats_repo.clone(),
    ));

    TestHarness {
        pool,
        tasks,
        workers,
        events,
        endpoints,
        stats_repo,
        provider,
        registry,
        dispatcher,
        endpoint_service,
        aggregator,
        stats,
    }
}

pub fn payload(json: &str) -> Payload {
    Payload::from_string(json).expect("invalid test payload")
}

/// Push a task's started_at back by `secs` so sweeps see it as old.
pub async fn age_task_start(pool: &SqlitePool, task_id: uuid::Uuid, secs: i64) {
    let started = chrono::Utc::now() - chrono::Duration::seconds(secs);
    sqlx::query("UPDATE tasks SET started_at = ? WHERE id = ?")
        .bind(started.to_rfc3339())
        .bind(task_id.to_string())
        .execute(pool)
        .await
        .expect("failed to age task");
}

/// Push a worker's last_heartbeat back by `secs`.
pub async fn age_worker_heartbeat(pool: &SqlitePool, worker_id: &str, secs: i64) {
    let heartbeat = chrono::Utc::now() - chrono::Duration::seconds(secs);
    sqlx::query("UPDATE workers SET last_heartbeat = ? WHERE id = ?")
        .bind(heartbeat.to_rfc3339())
        .bind(worker_id)
        .execute(pool)
        .await
        .expect("failed to age worker heartbeat");
}
