//! Terminal-result webhook delivery.
//!
//! Fire-and-forget: delivery runs on its own task with a fixed network
//! timeout, and a failed POST is logged without touching task state.

use serde::Serialize;
use serde_json::value::RawValue;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::models::{Task, WebhookConfig};

/// Body POSTed to the webhook URL; field names match the status API.
#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    id: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<&'a RawValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(rename = "executionTime", skip_serializing_if = "Option::is_none")]
    execution_time: Option<i64>,
}

/// Async webhook sender shared by the dispatch path.
#[derive(Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(config: &WebhookConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Spawn a delivery for a terminal task. Returns immediately.
    pub fn dispatch(&self, url: String, task: &Task) {
        let execution_time = match (task.started_at, task.completed_at) {
            (Some(started), Some(completed)) => Some((completed - started).num_milliseconds()),
            _ => None,
        };
        let body = serde_json::to_string(&WebhookBody {
            id: task.id.to_string(),
            status: task.status.as_str(),
            output: task.output.as_ref().map(|p| p.as_raw()),
            error: task.error_message.as_deref(),
            execution_time,
        });
        let body = match body {
            Ok(body) => body,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "webhook body serialization failed");
                return;
            }
        };

        let client = self.client.clone();
        let task_id = task.id;
        tokio::spawn(async move {
            post_json(client, url, task_id, body).await;
        });
    }

    /// Spawn a delivery of one streaming chunk. The chunk body wraps
    /// the raw payload under `stream` alongside the task id.
    pub fn dispatch_chunk(&self, url: String, task_id: uuid::Uuid, chunk: &RawValue) {
        let body = format!(r#"{{"id":"{task_id}","stream":{}}}"#, chunk.get());
        let client = self.client.clone();
        tokio::spawn(async move {
            post_json(client, url, task_id, body).await;
        });
    }
}

async fn post_json(client: reqwest::Client, url: String, task_id: uuid::Uuid, body: String) {
    let result = client
        .post(&url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await;
    match result {
        Ok(response) if response.status().is_success() => {
            debug!(%task_id, url, "webhook delivered");
        }
        Ok(response) => {
            warn!(%task_id, url, status = %response.status(), "webhook rejected");
        }
        Err(e) => {
            warn!(%task_id, url, error = %e, "webhook delivery failed");
        }
    }
}
