//! Declarative endpoint definitions.
//!
//! Operators can keep endpoint config in a YAML file and apply it with
//! `gantry apply -f endpoints.yaml`; each entry maps onto an endpoint
//! row plus its autoscaler config.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::domain::models::{AutoscalerConfig, EndpointMetadata};

#[derive(Debug, Deserialize)]
pub struct EndpointSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub gpu_spec: Option<String>,
    #[serde(default)]
    pub desired_replicas: u32,
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_pending: u32,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub autoscaler: Option<AutoscalerSpec>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AutoscalerSpec {
    #[serde(default)]
    pub min_replicas: u32,
    #[serde(default)]
    pub max_replicas: u32,
    #[serde(default)]
    pub scale_up_queue_threshold: Option<u32>,
    #[serde(default)]
    pub scale_down_idle_secs: Option<u64>,
    #[serde(default)]
    pub scale_up_cooldown_secs: Option<u64>,
    #[serde(default)]
    pub scale_down_cooldown_secs: Option<u64>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct EndpointsFile {
    endpoints: Vec<EndpointSpec>,
}

impl EndpointSpec {
    /// Expand into the persisted pair.
    pub fn into_records(self) -> (EndpointMetadata, AutoscalerConfig) {
        let mut metadata = EndpointMetadata::new(&self.name, &self.image);
        if let Some(display_name) = self.display_name {
            metadata.display_name = display_name;
        }
        metadata.gpu_spec = self.gpu_spec;
        metadata.desired_replicas = self.desired_replicas;
        metadata.task_timeout_secs = self.task_timeout_secs;
        metadata.max_pending = self.max_pending;
        metadata.webhook_url = self.webhook_url;

        let spec = self.autoscaler.unwrap_or_default();
        let mut autoscaler = AutoscalerConfig::disabled(&self.name);
        autoscaler.min_replicas = spec.min_replicas;
        autoscaler.max_replicas = spec.max_replicas;
        if let Some(threshold) = spec.scale_up_queue_threshold {
            autoscaler.scale_up_queue_threshold = threshold;
        }
        if let Some(idle) = spec.scale_down_idle_secs {
            autoscaler.scale_down_idle_secs = idle;
        }
        if let Some(cooldown) = spec.scale_up_cooldown_secs {
            autoscaler.scale_up_cooldown_secs = cooldown;
        }
        if let Some(cooldown) = spec.scale_down_cooldown_secs {
            autoscaler.scale_down_cooldown_secs = cooldown;
        }
        if let Some(priority) = spec.priority {
            autoscaler.priority = priority;
        }
        autoscaler.enabled = spec.enabled.unwrap_or(spec.max_replicas > 0);

        (metadata, autoscaler)
    }
}

/// Parse an endpoints file into persistable records.
pub fn load_endpoint_specs(
    path: impl AsRef<std::path::Path>,
) -> Result<Vec<(EndpointMetadata, AutoscalerConfig)>> {
    let text = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read {}", path.as_ref().display()))?;
    let file: EndpointsFile = serde_yaml::from_str(&text)
        .with_context(|| format!("failed to parse {}", path.as_ref().display()))?;
    Ok(file
        .endpoints
        .into_iter()
        .map(EndpointSpec::into_records)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints_file() {
        let yaml = r#"
endpoints:
  - name: sdxl
    image: registry/sdxl:latest
    gpu_spec: a100-40g
    task_timeout_secs: 300
    max_pending: 50
    autoscaler:
      min_replicas: 1
      max_replicas: 8
      scale_up_queue_threshold: 5
  - name: whisper
    image: registry/whisper:latest
"#;
        let file: EndpointsFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.endpoints.len(), 2);

        let (metadata, autoscaler) = file.endpoints.into_iter().next().unwrap().into_records();
        assert_eq!(metadata.name, "sdxl");
        assert_eq!(metadata.display_name, "sdxl");
        assert_eq!(metadata.task_timeout_secs, Some(300));
        assert_eq!(autoscaler.max_replicas, 8);
        assert_eq!(autoscaler.scale_up_queue_threshold, 5);
        // Enabled follows max_replicas when not explicit.
        assert!(autoscaler.enabled);
    }

    #[test]
    fn test_autoscaler_defaults_to_disabled() {
        let yaml = r#"
endpoints:
  - name: small
    image: img:1
"#;
        let file: EndpointsFile = serde_yaml::from_str(yaml).unwrap();
        let (_, autoscaler) = file.endpoints.into_iter().next().unwrap().into_records();
        assert_eq!(autoscaler.max_replicas, 0);
        assert!(!autoscaler.enabled);
    }
}
