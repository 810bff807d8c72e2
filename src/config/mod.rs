//! # Flowmill Configuration System
//!
//! YAML-based configuration with environment overrides and explicit validation.
//!
//! ## Architecture
//!
//! - **Single file**: `flowmill-config.yaml` holds every section
//! - **Environment awareness**: `development` / `test` / `production` sections are
//!   deep-merged over the base document
//! - **Variable overrides**: `FLOWMILL__SECTION__FIELD` environment variables win last
//! - **Explicit validation**: invalid values fail loading instead of falling back
//!
//! ## Usage
//!
//! ```rust,no_run
//! use flowmill_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let workers = manager.config().controller.workflow_workers;
//! let threshold = manager.config().workflow.offload_threshold_bytes;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::gc::RetentionPolicy;
use crate::objects::PropagationPolicy;
use crate::repository::ArtifactRepository;
use crate::resilience::Backoff;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring flowmill-config.yaml
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FlowmillConfig {
    /// Reconciler pools and watched namespaces
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Workflow execution settings
    #[serde(default)]
    pub workflow: WorkflowConfig,

    /// Backoff profiles for drivers and persistence
    #[serde(default)]
    pub retry: RetryConfig,

    /// SQL offload and archive store
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Built-in artifact repository and resolver settings
    #[serde(default)]
    pub artifact_repository: ArtifactRepositoryConfig,

    /// Deployment lifecycle timers
    #[serde(default)]
    pub deployment: DeploymentConfig,

    /// TTL, artifact, offload and retention collectors
    #[serde(default)]
    pub gc: GcConfig,

    /// Executor and controller plugins
    #[serde(default)]
    pub plugins: PluginsConfig,

    /// Environment the configuration was loaded for
    #[serde(default)]
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    pub workflow_workers: usize,
    pub deployment_workers: usize,
    /// Namespace holding controller-managed defaults
    pub managed_namespace: String,
    /// Restrict the controller to a single namespace
    #[serde(default)]
    pub namespace: Option<String>,
    pub requeue_seconds: u64,
    pub event_channel_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workflow_workers: 8,
            deployment_workers: 4,
            managed_namespace: "flowmill".to_string(),
            namespace: None,
            requeue_seconds: 10,
            event_channel_capacity: 1000,
        }
    }
}

impl ControllerConfig {
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowConfig {
    /// Serialized node-status size above which nodes are offloaded
    pub offload_threshold_bytes: usize,
    pub default_retry_limit: u32,
    pub executor_image: String,
    /// Template for artifact keys, e.g. `{{workflow.name}}/{{pod.name}}`
    pub key_format: String,
    #[serde(default)]
    pub cost_model: CostModel,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            offload_threshold_bytes: 1024 * 1024,
            default_retry_limit: 3,
            executor_image: "flowmill/executor:latest".to_string(),
            key_format: crate::repository::DEFAULT_KEY_FORMAT.to_string(),
            cost_model: CostModel::default(),
        }
    }
}

/// Linear cost model used by termination policies
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct CostModel {
    pub cpu_core_cents_per_hour: f64,
    pub mem_gib_cents_per_hour: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            cpu_core_cents_per_hour: 4.0,
            mem_gib_cents_per_hour: 0.5,
        }
    }
}

impl CostModel {
    /// Cost in cents of running `cpu_cores` and `mem_mib` for `seconds`
    pub fn cost_cents(&self, cpu_cores: f64, mem_mib: f64, seconds: f64) -> f64 {
        let hours = seconds / 3600.0;
        cpu_cores * hours * self.cpu_core_cents_per_hour
            + (mem_mib / 1024.0) * hours * self.mem_gib_cents_per_hour
    }
}

/// Serializable form of a [`Backoff`] profile
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct BackoffProfile {
    pub initial_ms: u64,
    pub factor: f64,
    pub jitter: f64,
    pub steps: u32,
    pub cap_ms: u64,
}

impl From<Backoff> for BackoffProfile {
    fn from(backoff: Backoff) -> Self {
        Self {
            initial_ms: backoff.duration.as_millis() as u64,
            factor: backoff.factor,
            jitter: backoff.jitter,
            steps: backoff.steps,
            cap_ms: backoff.cap.as_millis() as u64,
        }
    }
}

impl From<BackoffProfile> for Backoff {
    fn from(profile: BackoffProfile) -> Self {
        Backoff {
            duration: Duration::from_millis(profile.initial_ms),
            factor: profile.factor,
            jitter: profile.jitter,
            steps: profile.steps,
            cap: Duration::from_millis(profile.cap_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    pub driver: BackoffProfile,
    pub persistence_read: BackoffProfile,
    pub persistence_write: BackoffProfile,
    pub default: BackoffProfile,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            driver: Backoff::DRIVER.into(),
            persistence_read: Backoff::PERSISTENCE_READ.into(),
            persistence_write: Backoff::PERSISTENCE_WRITE.into(),
            default: Backoff::DEFAULT.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDriver {
    #[default]
    Postgres,
    Mysql,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub driver: SqlDriver,
    #[serde(default)]
    pub url: Option<String>,
    pub max_connections: u32,
    /// Offloads older than this are candidates for offload GC
    pub offload_ttl_seconds: u64,
    /// Archived workflows older than this are removed, if set
    #[serde(default)]
    pub archive_ttl_seconds: Option<u64>,
    pub query_timeout_seconds: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            driver: SqlDriver::Postgres,
            url: None,
            max_connections: 10,
            offload_ttl_seconds: 300,
            archive_ttl_seconds: None,
            query_timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtifactRepositoryConfig {
    /// Config-map consulted for namespace defaults
    pub config_map: String,
    /// Built-in repository used when no namespace default exists
    #[serde(default)]
    pub default: Option<ArtifactRepository>,
    pub list_timeout_seconds: u64,
}

impl Default for ArtifactRepositoryConfig {
    fn default() -> Self {
        Self {
            config_map: "artifact-repositories".to_string(),
            default: None,
            list_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeploymentConfig {
    pub init_timeout_seconds: u64,
    pub monitor_interval_seconds: u64,
    pub extender_interval_seconds: u64,
    pub reservation_ttl_seconds: u64,
    pub heartbeat_grace_seconds: u64,
    pub cache_ttl_seconds: u64,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            init_timeout_seconds: 30 * 60,
            monitor_interval_seconds: 60,
            extender_interval_seconds: 20 * 60,
            reservation_ttl_seconds: 60 * 60,
            heartbeat_grace_seconds: 3 * 60,
            cache_ttl_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GcConfig {
    pub ttl_workers: usize,
    pub artifact_gc_workers: usize,
    pub offload_gc_interval_seconds: u64,
    pub retention_interval_seconds: u64,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub propagation_policy: PropagationPolicy,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            ttl_workers: 4,
            artifact_gc_workers: 2,
            offload_gc_interval_seconds: 300,
            retention_interval_seconds: 600,
            retention: RetentionPolicy::default(),
            propagation_policy: PropagationPolicy::Background,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PluginEndpoint {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PluginsConfig {
    #[serde(default)]
    pub endpoints: Vec<PluginEndpoint>,
    pub connect_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            connect_timeout_seconds: 300,
            request_timeout_seconds: 30,
        }
    }
}

impl FlowmillConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.controller.workflow_workers == 0 {
            return Err(ConfigurationError::invalid_value(
                "controller.workflow_workers",
                "0",
                "at least one workflow worker is required",
            ));
        }

        if self.controller.managed_namespace.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "controller.managed_namespace",
                "controller configuration",
            ));
        }

        if self.workflow.offload_threshold_bytes == 0 {
            return Err(ConfigurationError::invalid_value(
                "workflow.offload_threshold_bytes",
                "0",
                "offload threshold must be greater than 0",
            ));
        }

        if self.workflow.executor_image.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "workflow.executor_image",
                "workflow configuration",
            ));
        }

        let cost = &self.workflow.cost_model;
        if cost.cpu_core_cents_per_hour < 0.0 || cost.mem_gib_cents_per_hour < 0.0 {
            return Err(ConfigurationError::invalid_value(
                "workflow.cost_model",
                format!("{cost:?}"),
                "cost rates cannot be negative",
            ));
        }

        for (field, profile) in [
            ("retry.driver", &self.retry.driver),
            ("retry.persistence_read", &self.retry.persistence_read),
            ("retry.persistence_write", &self.retry.persistence_write),
            ("retry.default", &self.retry.default),
        ] {
            if profile.steps == 0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    "steps=0",
                    "a backoff profile needs at least one step",
                ));
            }
            if profile.factor < 1.0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    profile.factor.to_string(),
                    "backoff factor must be at least 1.0",
                ));
            }
        }

        if self.persistence.enabled
            && self
                .persistence
                .url
                .as_deref()
                .map_or(true, |url| url.trim().is_empty())
        {
            return Err(ConfigurationError::missing_required_field(
                "persistence.url",
                "persistence configuration (enabled)",
            ));
        }

        for endpoint in &self.plugins.endpoints {
            if endpoint.address.trim().is_empty() {
                return Err(ConfigurationError::missing_required_field(
                    format!("plugins.endpoints[{}].address", endpoint.name),
                    "plugin configuration",
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FlowmillConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.driver.steps, 5);
        assert_eq!(config.deployment.cache_ttl_seconds, 120);
    }

    #[test]
    fn test_enabled_persistence_requires_url() {
        let mut config = FlowmillConfig::default();
        config.persistence.enabled = true;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("persistence.url"));
    }

    #[test]
    fn test_cost_model() {
        let model = CostModel {
            cpu_core_cents_per_hour: 10.0,
            mem_gib_cents_per_hour: 2.0,
        };
        let cents = model.cost_cents(2.0, 2048.0, 1800.0);
        assert!((cents - 12.0).abs() < f64::EPSILON);
    }
}
