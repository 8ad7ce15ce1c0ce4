//! Periodic maintenance scheduler.
//!
//! Each job is a named `JanitorJob` run on its own interval. Aligned
//! jobs wait for the next interval boundary before their first run so
//! bucket aggregation lands on whole minutes/hours/days. Job errors
//! are logged and the next tick still fires; shutdown signals every
//! loop and waits for in-flight runs to finish.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::Granularity;
use crate::services::aggregator::StatsAggregator;
use crate::services::dispatcher::TaskDispatcher;
use crate::services::stats_service::StatsService;
use crate::services::worker_registry::WorkerRegistry;

/// One periodic maintenance job.
#[async_trait]
pub trait JanitorJob: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one sweep; returns how many rows it affected.
    async fn run(&self) -> DomainResult<usize>;
}

/// A job plus its schedule.
pub struct JobSpec {
    pub job: Arc<dyn JanitorJob>,
    pub interval: Duration,
    /// First run waits until the next `interval` boundary
    pub aligned: bool,
}

/// Runs every registered job on its interval until shutdown.
pub struct Janitor {
    jobs: Vec<JobSpec>,
    stop_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Default for Janitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Janitor {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            jobs: Vec::new(),
            stop_tx,
            handles: Vec::new(),
        }
    }

    pub fn add_job(&mut self, job: Arc<dyn JanitorJob>, interval: Duration, aligned: bool) {
        self.jobs.push(JobSpec {
            job,
            interval,
            aligned,
        });
    }

    /// Spawn one loop per job.
    pub fn start(&mut self) {
        for spec in self.jobs.drain(..) {
            let mut stop_rx = self.stop_tx.subscribe();
            let handle = tokio::spawn(async move {
                let name = spec.job.name();

                if spec.aligned {
                    let wait = until_next_boundary(spec.interval);
                    debug!(job = name, wait_secs = wait.as_secs(), "waiting for boundary");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = stop_rx.changed() => return,
                    }
                }

                let mut ticker = tokio::time::interval(spec.interval);
                // First tick of tokio's interval fires immediately.
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = stop_rx.changed() => {
                            debug!(job = name, "janitor job stopping");
                            return;
                        }
                    }
                    let started = std::time::Instant::now();
                    match spec.job.run().await {
                        Ok(affected) => {
                            if affected > 0 {
                                info!(
                                    job = name,
                                    affected,
                                    elapsed_ms = started.elapsed().as_millis() as u64,
                                    "janitor job finished"
                                );
                            }
                        }
                        Err(e) => {
                            // Next tick retries; store errors are transient.
                            error!(job = name, error = %e, "janitor job failed");
                        }
                    }
                }
            });
            self.handles.push(handle);
        }
        info!(jobs = self.handles.len(), "janitor started");
    }

    /// Signal every job loop and wait for in-flight runs to exit.
    pub async fn shutdown(mut self) {
        let _ = self.stop_tx.send(true);
        for result in futures::future::join_all(self.handles.drain(..)).await {
            if let Err(e) = result {
                warn!(error = %e, "janitor job panicked during shutdown");
            }
        }
        info!("janitor stopped");
    }
}

/// Time until `now` truncated to the interval plus one interval.
fn until_next_boundary(interval: Duration) -> Duration {
    let interval_secs = interval.as_secs().max(1) as i64;
    let now = Utc::now().timestamp();
    let next = (now / interval_secs + 1) * interval_secs;
    Duration::from_secs((next - now).max(0) as u64)
}

// ---------------------------------------------------------------------
// Standard jobs
// ---------------------------------------------------------------------

/// Stale-heartbeat sweep plus task reclamation for each worker taken
/// offline.
pub struct OfflineWorkersJob {
    pub registry: Arc<WorkerRegistry>,
    pub dispatcher: Arc<TaskDispatcher>,
}

#[async_trait]
impl JanitorJob for OfflineWorkersJob {
    fn name(&self) -> &'static str {
        "cleanup_offline_workers"
    }

    async fn run(&self) -> DomainResult<usize> {
        let offlined = self.registry.sweep_stale().await?;
        let mut requeued = 0;
        for worker in &offlined {
            requeued += self.dispatcher.reclaim_worker_tasks(&worker.id).await?;
        }
        Ok(offlined.len() + requeued)
    }
}

pub struct TimedOutTasksJob {
    pub dispatcher: Arc<TaskDispatcher>,
}

#[async_trait]
impl JanitorJob for TimedOutTasksJob {
    fn name(&self) -> &'static str {
        "cleanup_timed_out_tasks"
    }

    async fn run(&self) -> DomainResult<usize> {
        self.dispatcher.sweep_timed_out().await
    }
}

pub struct OrphanedTasksJob {
    pub dispatcher: Arc<TaskDispatcher>,
}

#[async_trait]
impl JanitorJob for OrphanedTasksJob {
    fn name(&self) -> &'static str {
        "cleanup_orphaned_tasks"
    }

    async fn run(&self) -> DomainResult<usize> {
        self.dispatcher.sweep_orphaned().await
    }
}

/// Bucket aggregation at one granularity.
pub struct AggregateJob {
    pub aggregator: Arc<StatsAggregator>,
    pub granularity: Granularity,
    /// Closed buckets re-aggregated each run, to absorb late events
    pub lookback_buckets: u32,
}

#[async_trait]
impl JanitorJob for AggregateJob {
    fn name(&self) -> &'static str {
        match self.granularity {
            Granularity::Minute => "aggregate_minute",
            Granularity::Hour => "aggregate_hour",
            Granularity::Day => "aggregate_day",
        }
    }

    async fn run(&self) -> DomainResult<usize> {
        self.aggregator
            .aggregate_recent(self.granularity, self.lookback_buckets, Utc::now())
            .await
    }
}

pub struct RefreshStatisticsJob {
    pub stats: Arc<StatsService>,
}

#[async_trait]
impl JanitorJob for RefreshStatisticsJob {
    fn name(&self) -> &'static str {
        "refresh_statistics"
    }

    async fn run(&self) -> DomainResult<usize> {
        self.stats.refresh().await?;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl JanitorJob for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&self) -> DomainResult<usize> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail && run == 0 {
                return Err(crate::domain::errors::DomainError::DatabaseError(
                    "induced".to_string(),
                ));
            }
            Ok(1)
        }
    }

    #[tokio::test]
    async fn test_job_keeps_ticking_after_error() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut janitor = Janitor::new();
        janitor.add_job(
            Arc::new(CountingJob {
                runs: runs.clone(),
                fail: true,
            }),
            Duration::from_millis(20),
            false,
        );
        janitor.start();

        tokio::time::sleep(Duration::from_millis(90)).await;
        janitor.shutdown().await;

        // First run errored, later ticks still fired.
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_jobs() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut janitor = Janitor::new();
        janitor.add_job(
            Arc::new(CountingJob {
                runs: runs.clone(),
                fail: false,
            }),
            Duration::from_millis(10),
            false,
        );
        janitor.start();
        tokio::time::sleep(Duration::from_millis(35)).await;
        janitor.shutdown().await;

        let after_shutdown = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_shutdown);
    }

    #[test]
    fn test_until_next_boundary_within_interval() {
        let wait = until_next_boundary(Duration::from_secs(60));
        assert!(wait <= Duration::from_secs(60));
    }
}
