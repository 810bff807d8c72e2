//! Executor plugins stored as labelled config maps.
//!
//! A plugin config map carries the label `configmap-type: ExecutorPlugin` and
//! two data keys: `sidecar.automountServiceAccountToken` (`"true"`/`"false"`)
//! and `sidecar.container` (the container as YAML). Other labels and
//! annotations survive a round trip; the type label is stripped on the way in.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::errors::{PluginError, PluginResult};
use crate::config::PluginEndpoint;
use crate::constants::labels::{CONFIGMAP_TYPE, EXECUTOR_PLUGIN};
use crate::objects::{ConfigMap, ObjectMeta};

const AUTOMOUNT_KEY: &str = "sidecar.automountServiceAccountToken";
const CONTAINER_KEY: &str = "sidecar.container";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    pub container_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginContainer {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,
    /// Container fields the controller does not interpret
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSidecar {
    #[serde(default)]
    pub automount_service_account_token: bool,
    pub container: PluginContainer,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorPlugin {
    pub metadata: ObjectMeta,
    pub sidecar: PluginSidecar,
}

impl ExecutorPlugin {
    /// Address the sidecar listens on, from its first container port
    pub fn address(&self) -> Option<String> {
        self.sidecar
            .container
            .ports
            .first()
            .map(|port| format!("http://localhost:{}", port.container_port))
    }

    pub fn endpoint(&self) -> Option<PluginEndpoint> {
        self.address().map(|address| PluginEndpoint {
            name: self.metadata.name.clone(),
            address,
        })
    }

    pub fn to_config_map(&self) -> PluginResult<ConfigMap> {
        let container = serde_yaml::to_string(&self.sidecar.container)
            .map_err(|e| PluginError::invalid_config_map(e.to_string()))?;
        let mut metadata = self.metadata.clone();
        metadata
            .labels
            .insert(CONFIGMAP_TYPE.to_string(), EXECUTOR_PLUGIN.to_string());

        let mut data = BTreeMap::new();
        data.insert(
            AUTOMOUNT_KEY.to_string(),
            self.sidecar.automount_service_account_token.to_string(),
        );
        data.insert(CONTAINER_KEY.to_string(), container);
        Ok(ConfigMap { metadata, data })
    }

    pub fn from_config_map(config_map: &ConfigMap) -> PluginResult<Self> {
        match config_map.metadata.labels.get(CONFIGMAP_TYPE) {
            Some(kind) if kind == EXECUTOR_PLUGIN => {}
            other => {
                return Err(PluginError::invalid_config_map(format!(
                    "{} has {CONFIGMAP_TYPE}={}, expected {EXECUTOR_PLUGIN}",
                    config_map.metadata.name,
                    other.map(String::as_str).unwrap_or("<unset>")
                )))
            }
        }

        let automount = match config_map.data.get(AUTOMOUNT_KEY).map(String::as_str) {
            None | Some("false") => false,
            Some("true") => true,
            Some(other) => {
                return Err(PluginError::invalid_config_map(format!(
                    "{AUTOMOUNT_KEY} must be \"true\" or \"false\", got {other:?}"
                )))
            }
        };
        let raw_container = config_map.data.get(CONTAINER_KEY).ok_or_else(|| {
            PluginError::invalid_config_map(format!("{CONTAINER_KEY} is required"))
        })?;
        let container: PluginContainer = serde_yaml::from_str(raw_container)
            .map_err(|e| PluginError::invalid_config_map(format!("{CONTAINER_KEY}: {e}")))?;

        let mut metadata = config_map.metadata.clone();
        metadata.labels.remove(CONFIGMAP_TYPE);
        Ok(Self {
            metadata,
            sidecar: PluginSidecar {
                automount_service_account_token: automount,
                container,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin() -> ExecutorPlugin {
        let mut metadata = ObjectMeta::named("flowmill", "hello");
        metadata.labels.insert("team".into(), "infra".into());
        metadata
            .annotations
            .insert("flowmill.io/description".into(), "says hello".into());
        let mut extra = BTreeMap::new();
        extra.insert(
            "resources".to_string(),
            serde_json::json!({"requests": {"cpu": "100m"}}),
        );
        ExecutorPlugin {
            metadata,
            sidecar: PluginSidecar {
                automount_service_account_token: true,
                container: PluginContainer {
                    name: "hello-executor-plugin".into(),
                    image: "python:3.12-alpine".into(),
                    command: vec!["python".into(), "-u".into(), "server.py".into()],
                    args: vec![],
                    ports: vec![ContainerPort {
                        container_port: 4355,
                    }],
                    extra,
                },
            },
        }
    }

    #[test]
    fn test_round_trip_preserves_metadata() {
        let original = plugin();
        let config_map = original.to_config_map().unwrap();
        assert_eq!(config_map.metadata.labels[CONFIGMAP_TYPE], EXECUTOR_PLUGIN);
        assert_eq!(config_map.data[AUTOMOUNT_KEY], "true");

        let decoded = ExecutorPlugin::from_config_map(&config_map).unwrap();
        assert_eq!(decoded, original);
        assert!(!decoded.metadata.labels.contains_key(CONFIGMAP_TYPE));
        assert_eq!(decoded.address().as_deref(), Some("http://localhost:4355"));
    }

    #[test]
    fn test_rejects_wrong_type_and_bad_flag() {
        let mut config_map = plugin().to_config_map().unwrap();
        config_map
            .data
            .insert(AUTOMOUNT_KEY.to_string(), "yes".to_string());
        assert!(ExecutorPlugin::from_config_map(&config_map).is_err());

        config_map.metadata.labels.remove(CONFIGMAP_TYPE);
        let err = ExecutorPlugin::from_config_map(&config_map).unwrap_err();
        assert!(err.to_string().contains("<unset>"));
    }
}
