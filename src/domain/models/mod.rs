//! Domain models for the gantry dispatcher.

pub mod config;
pub mod endpoint;
pub mod event;
pub mod payload;
pub mod stats;
pub mod task;
pub mod worker;

pub use config::{
    Config, DatabaseConfig, DispatchConfig, JanitorConfig, LoggingConfig, ServerConfig,
    StatsConfig, WebhookConfig,
};
pub use endpoint::{AutoscalerConfig, EndpointMetadata, EndpointRecord, EndpointStats};
pub use event::{TaskEvent, TaskEventType, WorkerEvent, WorkerEventType};
pub use payload::Payload;
pub use stats::{CountScope, EndpointBucketStats, Granularity, TaskStatistics};
pub use task::{normalize_endpoint, ExecutionRecord, Task, TaskStatus, DEFAULT_ENDPOINT};
pub use worker::{PodRuntimeState, Worker, WorkerStatus};
