//! Incrementally-maintained task statistics.
//!
//! Status-transition increments are fire-and-forget: the request path
//! enqueues onto a bounded channel and never waits. A small pool of
//! drain workers applies the increments; overflow is dropped and
//! counted. The periodic refresh recomputes every row from the tasks
//! table, so dropped increments self-heal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::{CountScope, StatsConfig, TaskStatistics, TaskStatus};
use crate::domain::ports::{StatsRepository, TaskRepository};

/// One queued status transition.
#[derive(Debug, Clone)]
struct StatsIncrement {
    endpoint: String,
    from: Option<TaskStatus>,
    to: TaskStatus,
}

/// Bounded-queue statistics updater.
pub struct StatsService {
    sender: mpsc::Sender<StatsIncrement>,
    dropped: Arc<AtomicU64>,
    stats_repo: Arc<dyn StatsRepository>,
    task_repo: Arc<dyn TaskRepository>,
}

impl StatsService {
    /// Build the service and spawn the drain workers.
    pub fn new(
        stats_repo: Arc<dyn StatsRepository>,
        task_repo: Arc<dyn TaskRepository>,
        config: &StatsConfig,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel::<StatsIncrement>(config.queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        for worker in 0..config.drain_workers.max(1) {
            let receiver = receiver.clone();
            let repo = stats_repo.clone();
            tokio::spawn(async move {
                loop {
                    let increment = {
                        let mut rx = receiver.lock().await;
                        rx.recv().await
                    };
                    let Some(increment) = increment else {
                        debug!(worker, "stats drain worker exiting, channel closed");
                        break;
                    };
                    if let Err(e) = repo
                        .increment_transition(&increment.endpoint, increment.from, increment.to)
                        .await
                    {
                        warn!(
                            endpoint = %increment.endpoint,
                            error = %e,
                            "statistics increment failed"
                        );
                    }
                }
            });
        }

        Arc::new(Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
            stats_repo,
            task_repo,
        })
    }

    /// Enqueue one transition. Never blocks; a full queue drops the
    /// increment and bumps the overflow counter.
    pub fn record_transition(&self, endpoint: &str, from: Option<TaskStatus>, to: TaskStatus) {
        let increment = StatsIncrement {
            endpoint: endpoint.to_string(),
            from,
            to,
        };
        if self.sender.try_send(increment).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(endpoint, dropped, "statistics queue full, increment dropped");
        }
    }

    /// Increments dropped to overflow since startup.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current counts for one scope.
    pub async fn get_counts(
        &self,
        scope: CountScope,
        scope_value: &str,
    ) -> DomainResult<TaskStatistics> {
        self.stats_repo.get_counts(scope, scope_value).await
    }

    /// Full recomputation from the tasks table, replacing every count
    /// row in one transaction.
    pub async fn refresh(&self) -> DomainResult<()> {
        let global = self.task_repo.status_counts(None).await?;
        let per_endpoint = self.task_repo.status_counts_by_endpoint().await?;
        self.stats_repo.replace_counts(&global, &per_endpoint).await
    }
}
