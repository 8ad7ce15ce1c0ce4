//! Pod-watch stream consumer.
//!
//! A single task subscribes to the deployment provider, replays the
//! current pod list (list-then-watch), and translates every event into
//! Worker-Registry calls. On disconnect it reconnects with exponential
//! backoff. Workers taken OFFLINE by a deletion get their in-progress
//! tasks reclaimed immediately.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::ports::{DeploymentProvider, PodEvent};
use crate::services::dispatcher::TaskDispatcher;
use crate::services::worker_registry::WorkerRegistry;

pub struct PodWatcher {
    provider: Arc<dyn DeploymentProvider>,
    registry: Arc<WorkerRegistry>,
    dispatcher: Arc<TaskDispatcher>,
}

impl PodWatcher {
    pub fn new(
        provider: Arc<dyn DeploymentProvider>,
        registry: Arc<WorkerRegistry>,
        dispatcher: Arc<TaskDispatcher>,
    ) -> Self {
        Self {
            provider,
            registry,
            dispatcher,
        }
    }

    /// Run the consumer until the stop signal flips.
    pub fn spawn(self, mut stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = reconnect_backoff();
            loop {
                if *stop_rx.borrow() {
                    return;
                }

                match self.provider.subscribe().await {
                    Ok(mut receiver) => {
                        backoff.reset();

                        // Replay current state so events missed during
                        // the disconnect are not lost.
                        match self.provider.list_pods().await {
                            Ok(pods) => {
                                debug!(pods = pods.len(), "pod list replayed");
                                for event in pods {
                                    self.handle(&event).await;
                                }
                            }
                            Err(e) => warn!(error = %e, "pod list replay failed"),
                        }

                        loop {
                            tokio::select! {
                                event = receiver.recv() => {
                                    match event {
                                        Some(event) => self.handle(&event).await,
                                        None => {
                                            warn!("pod watch stream closed, reconnecting");
                                            break;
                                        }
                                    }
                                }
                                _ = stop_rx.changed() => {
                                    info!("pod watcher stopping");
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "pod watch subscribe failed");
                    }
                }

                let delay = backoff
                    .next_backoff()
                    .unwrap_or_else(|| Duration::from_secs(30));
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop_rx.changed() => return,
                }
            }
        })
    }

    async fn handle(&self, event: &PodEvent) {
        match self.registry.ingest_pod_event(event).await {
            Ok(Some(offline_worker)) => {
                if let Err(e) = self.dispatcher.reclaim_worker_tasks(&offline_worker).await {
                    warn!(worker_id = %offline_worker, error = %e, "task reclaim failed");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(pod = %event.pod_name, error = %e, "pod event ingestion failed");
            }
        }
    }
}

fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(500),
        max_interval: Duration::from_secs(30),
        // Retry forever; the stop signal is the only way out.
        max_elapsed_time: None,
        ..Default::default()
    }
}
