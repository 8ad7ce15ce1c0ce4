//! Gantry server entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use gantry::adapters::http::{self, AppState};
use gantry::adapters::provider::StaticProvider;
use gantry::adapters::sqlite::{
    store, SqliteEndpointRepository, SqliteEventRepository, SqliteStatsRepository,
    SqliteTaskRepository, SqliteWorkerRepository,
};
use gantry::domain::models::Granularity;
use gantry::infrastructure::config::{load_endpoint_specs, ConfigLoader};
use gantry::infrastructure::logging;
use gantry::services::{
    AggregateJob, EndpointService, Janitor, OfflineWorkersJob, OrphanedTasksJob, PodWatcher,
    RefreshStatisticsJob, StatsAggregator, StatsService, TaskDispatcher, TimedOutTasksJob,
    WebhookDispatcher, WorkerRegistry,
};

#[derive(Parser)]
#[command(name = "gantry", about = "Task dispatcher for GPU inference workloads")]
struct Cli {
    /// Path to a YAML config file (defaults to gantry.yaml + env)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher server
    Serve,
    /// Apply the dispatch schema if needed and exit
    Migrate,
    /// Apply endpoint definitions from a YAML file and exit
    Apply {
        /// Path to the endpoints file
        #[arg(short, long)]
        file: std::path::PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };
    let _log_guard = logging::init(&config.logging);

    let pool = store::open(&config.database)
        .await
        .context("Failed to open dispatch store")?;
    if store::ensure_schema(&pool)
        .await
        .context("Failed to apply schema")?
    {
        tracing::info!(version = store::SCHEMA_VERSION, "dispatch schema applied");
    }

    if matches!(cli.command, Commands::Migrate) {
        let version = store::schema_version(&pool).await?;
        tracing::info!(version, "schema up to date");
        pool.close().await;
        return Ok(());
    }

    // Repositories
    let task_repo = Arc::new(SqliteTaskRepository::new(pool.clone()));
    let worker_repo = Arc::new(SqliteWorkerRepository::new(pool.clone()));
    let event_repo = Arc::new(SqliteEventRepository::new(pool.clone()));
    let endpoint_repo = Arc::new(SqliteEndpointRepository::new(pool.clone()));
    let stats_repo = Arc::new(SqliteStatsRepository::new(pool.clone()));

    if let Commands::Apply { file } = &cli.command {
        let endpoint_service = EndpointService::new(
            endpoint_repo.clone(),
            task_repo.clone(),
            worker_repo.clone(),
        );
        let specs = load_endpoint_specs(file)?;
        let count = specs.len();
        for (metadata, autoscaler) in specs {
            let record = endpoint_service.save(metadata, autoscaler).await?;
            tracing::info!(endpoint = %record.metadata.name, "endpoint applied");
        }
        tracing::info!(count, "endpoint definitions applied");
        pool.close().await;
        return Ok(());
    }

    // External collaborators
    let provider = Arc::new(StaticProvider::new());
    let webhooks = WebhookDispatcher::new(&config.webhook);

    // Services
    let stats = StatsService::new(stats_repo.clone(), task_repo.clone(), &config.stats);
    let registry = Arc::new(WorkerRegistry::new(
        worker_repo.clone(),
        event_repo.clone(),
        config.dispatch.clone(),
    ));
    let dispatcher = Arc::new(TaskDispatcher::new(
        task_repo.clone(),
        worker_repo.clone(),
        event_repo.clone(),
        endpoint_repo.clone(),
        provider.clone(),
        registry.clone(),
        stats.clone(),
        webhooks.clone(),
        config.dispatch.clone(),
    ));
    let endpoints = Arc::new(EndpointService::new(
        endpoint_repo.clone(),
        task_repo.clone(),
        worker_repo.clone(),
    ));
    let aggregator = Arc::new(StatsAggregator::new(
        event_repo.clone(),
        worker_repo.clone(),
        stats_repo.clone(),
    ));

    // Janitor jobs
    let offline_interval = if config.janitor.offline_workers_interval_secs > 0 {
        config.janitor.offline_workers_interval_secs
    } else {
        (config.dispatch.heartbeat_timeout_secs / 2).max(1)
    };
    let mut janitor = Janitor::new();
    janitor.add_job(
        Arc::new(OfflineWorkersJob {
            registry: registry.clone(),
            dispatcher: dispatcher.clone(),
        }),
        Duration::from_secs(offline_interval),
        false,
    );
    janitor.add_job(
        Arc::new(TimedOutTasksJob {
            dispatcher: dispatcher.clone(),
        }),
        Duration::from_secs(config.janitor.timed_out_tasks_interval_secs),
        false,
    );
    janitor.add_job(
        Arc::new(OrphanedTasksJob {
            dispatcher: dispatcher.clone(),
        }),
        Duration::from_secs(config.janitor.orphaned_tasks_interval_secs),
        false,
    );
    janitor.add_job(
        Arc::new(AggregateJob {
            aggregator: aggregator.clone(),
            granularity: Granularity::Minute,
            lookback_buckets: 5,
        }),
        Duration::from_secs(60),
        true,
    );
    janitor.add_job(
        Arc::new(AggregateJob {
            aggregator: aggregator.clone(),
            granularity: Granularity::Hour,
            lookback_buckets: 2,
        }),
        Duration::from_secs(3600),
        true,
    );
    janitor.add_job(
        Arc::new(AggregateJob {
            aggregator,
            granularity: Granularity::Day,
            lookback_buckets: 2,
        }),
        Duration::from_secs(86_400),
        true,
    );
    janitor.add_job(
        Arc::new(RefreshStatisticsJob {
            stats: stats.clone(),
        }),
        Duration::from_secs(config.janitor.refresh_statistics_interval_secs),
        false,
    );
    janitor.start();

    // Pod-watch consumer
    let (stop_tx, stop_rx) = watch::channel(false);
    let watcher_handle =
        PodWatcher::new(provider, registry.clone(), dispatcher.clone()).spawn(stop_rx);

    // HTTP surface
    let state = Arc::new(AppState {
        dispatcher,
        registry,
        endpoints,
        webhooks,
    });
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    http::serve(state, &config.server, shutdown).await?;

    // Drain background work before exit.
    let _ = stop_tx.send(true);
    let _ = watcher_handle.await;
    janitor.shutdown().await;
    pool.close().await;

    Ok(())
}
