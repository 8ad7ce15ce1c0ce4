//! Gantry - serverless task dispatcher for GPU inference workloads
//!
//! Clients submit opaque JSON tasks to named endpoints; ephemeral
//! workers pull them over HTTP and post results. The crate provides:
//! - Task lifecycle state machine with CAS-based atomic claim
//! - Worker lifecycle driven by heartbeats and pod-watch events
//! - Event journal and bucketed statistics aggregation
//! - Janitor jobs for timeouts, orphans, and stale workers
//! - SQLite persistence with WAL mode

pub mod adapters;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export key types for convenience
pub use domain::errors::{DomainError, DomainResult};
pub use domain::models::{Task, TaskStatus, Worker, WorkerStatus};
