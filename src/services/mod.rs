//! The coordination kernel: dispatch, worker lifecycle, maintenance,
//! and statistics services.

pub mod aggregator;
pub mod dispatcher;
pub mod endpoint_service;
pub mod janitor;
pub mod pod_watch;
pub mod stats_service;
pub mod webhook;
pub mod worker_registry;

pub use aggregator::StatsAggregator;
pub use dispatcher::{
    Admission, PullRequest, PulledJob, ResultSubmission, SubmitOutcome, TaskDispatcher,
};
pub use endpoint_service::EndpointService;
pub use janitor::{
    AggregateJob, Janitor, JanitorJob, JobSpec, OfflineWorkersJob, OrphanedTasksJob,
    RefreshStatisticsJob, TimedOutTasksJob,
};
pub use pod_watch::PodWatcher;
pub use stats_service::StatsService;
pub use webhook::WebhookDispatcher;
pub use worker_registry::{HeartbeatRequest, WorkerRegistry};
