//! Ports: interfaces between the coordination kernel and its adapters.

pub mod deployment;
pub mod endpoint_repository;
pub mod event_repository;
pub mod stats_repository;
pub mod task_repository;
pub mod worker_repository;

pub use deployment::{DeploymentProvider, PodEvent, PodEventKind};
pub use endpoint_repository::EndpointRepository;
pub use event_repository::EventRepository;
pub use stats_repository::StatsRepository;
pub use task_repository::{TaskCasUpdate, TaskRepository};
pub use worker_repository::{HeartbeatOutcome, HeartbeatUpdate, WorkerRepository};
