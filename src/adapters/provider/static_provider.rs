//! In-process deployment provider.
//!
//! Serves local runs and tests: pod state lives in memory and is
//! mutated through the handle methods, which also fan the corresponding
//! events out to subscribers. The real orchestrator integration
//! implements the same port out of tree.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::domain::errors::DomainResult;
use crate::domain::models::PodRuntimeState;
use crate::domain::ports::{DeploymentProvider, PodEvent, PodEventKind};

#[derive(Debug, Clone)]
struct PodEntry {
    event: PodEvent,
    terminating: bool,
}

#[derive(Default)]
struct Inner {
    pods: HashMap<String, PodEntry>,
    subscribers: Vec<mpsc::Sender<PodEvent>>,
}

/// Scriptable pod fleet.
#[derive(Clone, Default)]
pub struct StaticProvider {
    inner: Arc<Mutex<Inner>>,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, event: PodEvent) {
        let mut inner = self.inner.lock().expect("provider lock poisoned");
        match event.kind {
            PodEventKind::Deleted => {
                inner.pods.remove(&event.pod_name);
            }
            kind => {
                let entry = inner
                    .pods
                    .entry(event.pod_name.clone())
                    .or_insert_with(|| PodEntry {
                        event: event.clone(),
                        terminating: false,
                    });
                entry.event = event.clone();
                if kind == PodEventKind::Terminating {
                    entry.terminating = true;
                }
            }
        }
        inner
            .subscribers
            .retain(|sender| sender.try_send(event.clone()).is_ok());
    }

    /// Observe a new pod for an endpoint.
    pub fn add_pod(&self, pod_name: &str, endpoint: &str) {
        let now = Utc::now();
        self.publish(PodEvent {
            pod_name: pod_name.to_string(),
            endpoint: endpoint.to_string(),
            kind: PodEventKind::Added,
            state: PodRuntimeState {
                phase: Some("Pending".to_string()),
                ..Default::default()
            },
            pod_created_at: Some(now),
            pod_started_at: None,
            event_time: now,
        });
    }

    /// Report the pod Ready.
    pub fn mark_ready(&self, pod_name: &str, endpoint: &str) {
        let now = Utc::now();
        self.publish(PodEvent {
            pod_name: pod_name.to_string(),
            endpoint: endpoint.to_string(),
            kind: PodEventKind::Ready,
            state: PodRuntimeState {
                phase: Some("Running".to_string()),
                reason: Some("Ready".to_string()),
                ..Default::default()
            },
            pod_created_at: None,
            pod_started_at: Some(now),
            event_time: now,
        });
    }

    /// Begin terminating the pod.
    pub fn mark_terminating(&self, pod_name: &str, endpoint: &str) {
        let now = Utc::now();
        self.publish(PodEvent {
            pod_name: pod_name.to_string(),
            endpoint: endpoint.to_string(),
            kind: PodEventKind::Terminating,
            state: PodRuntimeState {
                phase: Some("Running".to_string()),
                reason: Some("Terminating".to_string()),
                ..Default::default()
            },
            pod_created_at: None,
            pod_started_at: None,
            event_time: now,
        });
    }

    /// Mark a pod terminating without emitting a watch event. Exercises
    /// the pull-path safety net for the window before the callback fires.
    pub fn set_terminating_silently(&self, pod_name: &str) {
        let mut inner = self.inner.lock().expect("provider lock poisoned");
        if let Some(entry) = inner.pods.get_mut(pod_name) {
            entry.terminating = true;
        }
    }

    /// Confirm pod deletion.
    pub fn delete_pod(&self, pod_name: &str, endpoint: &str) {
        self.publish(PodEvent {
            pod_name: pod_name.to_string(),
            endpoint: endpoint.to_string(),
            kind: PodEventKind::Deleted,
            state: PodRuntimeState::default(),
            pod_created_at: None,
            pod_started_at: None,
            event_time: Utc::now(),
        });
    }

    /// Drop all subscriber channels, simulating a watch disconnect.
    pub fn disconnect_watchers(&self) {
        self.inner
            .lock()
            .expect("provider lock poisoned")
            .subscribers
            .clear();
    }
}

#[async_trait]
impl DeploymentProvider for StaticProvider {
    async fn is_pod_terminating(&self, pod_name: &str) -> DomainResult<bool> {
        let inner = self.inner.lock().expect("provider lock poisoned");
        Ok(inner
            .pods
            .get(pod_name)
            .map(|entry| entry.terminating)
            .unwrap_or(false))
    }

    async fn list_pods(&self) -> DomainResult<Vec<PodEvent>> {
        let inner = self.inner.lock().expect("provider lock poisoned");
        Ok(inner.pods.values().map(|entry| entry.event.clone()).collect())
    }

    async fn subscribe(&self) -> DomainResult<mpsc::Receiver<PodEvent>> {
        let (tx, rx) = mpsc::channel(64);
        self.inner
            .lock()
            .expect("provider lock poisoned")
            .subscribers
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_terminating_flag() {
        let provider = StaticProvider::new();
        provider.add_pod("pod-1", "e1");
        assert!(!provider.is_pod_terminating("pod-1").await.unwrap());

        provider.set_terminating_silently("pod-1");
        assert!(provider.is_pod_terminating("pod-1").await.unwrap());

        // Unknown pods are not terminating.
        assert!(!provider.is_pod_terminating("pod-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let provider = StaticProvider::new();
        let mut rx = provider.subscribe().await.unwrap();

        provider.add_pod("pod-1", "e1");
        provider.mark_terminating("pod-1", "e1");

        let added = rx.recv().await.unwrap();
        assert_eq!(added.kind, PodEventKind::Added);
        let terminating = rx.recv().await.unwrap();
        assert_eq!(terminating.kind, PodEventKind::Terminating);
        assert!(provider.is_pod_terminating("pod-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_deleted_pod_leaves_snapshot() {
        let provider = StaticProvider::new();
        provider.add_pod("pod-1", "e1");
        provider.delete_pod("pod-1", "e1");
        assert!(provider.list_pods().await.unwrap().is_empty());
    }
}
