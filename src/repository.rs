//! # Artifact Repository Resolution
//!
//! Picks the artifact repository a workflow writes to. Resolution order, first
//! hit wins:
//!
//! 1. the workflow's explicit reference, which must exist
//! 2. the default repository config-map in the workflow's namespace
//! 3. the default repository config-map in the controller's managed namespace
//! 4. the built-in default from configuration
//!
//! Config-maps hold one YAML repository profile per data key. When a reference
//! names no key, the `default-artifact-repository` annotation selects one.
//! The resolved reference is stored on the workflow so later operations stay
//! on the same repository even if defaults change.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::artifacts::{Artifact, ArtifactLocation};
use crate::constants::labels::DEFAULT_ARTIFACT_REPOSITORY;
use crate::error::ErrorKind;
use crate::objects::ConfigMap;

/// Config-map consulted when a reference leaves it unset
pub const DEFAULT_CONFIG_MAP: &str = "artifact-repositories";

/// Key layout used when a repository does not set one
pub const DEFAULT_KEY_FORMAT: &str = "{{workflow.name}}/{{pod.name}}";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("artifact repository config-map {namespace}/{config_map} not found")]
    NotFound {
        namespace: String,
        config_map: String,
    },

    #[error("config map {config_map} missing key {key:?}")]
    MissingKey { config_map: String, key: String },

    #[error("invalid artifact repository {reference}: {message}")]
    InvalidConfig { reference: String, message: String },

    #[error("no default artifact repository is configured")]
    NotConfigured,

    #[error("failed to read config-map: {message}")]
    Source { message: String, transient: bool },
}

impl RepositoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::MissingKey { .. } | Self::InvalidConfig { .. } | Self::NotConfigured => {
                ErrorKind::Validation
            }
            Self::Source { transient: true, .. } => ErrorKind::Transient,
            Self::Source { .. } => ErrorKind::PermanentRemote,
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// A workflow's request for a specific repository profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRepositoryRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl ArtifactRepositoryRef {
    pub fn config_map_or_default(&self) -> &str {
        self.config_map.as_deref().unwrap_or(DEFAULT_CONFIG_MAP)
    }
}

impl fmt::Display for ArtifactRepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}",
            self.config_map_or_default(),
            self.key.as_deref().unwrap_or_default()
        )
    }
}

/// The reference a workflow was resolved to, persisted on its status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRepositoryRefStatus {
    #[serde(flatten)]
    pub reference: ArtifactRepositoryRef,
    #[serde(default)]
    pub namespace: String,
    /// Points at the built-in default instead of a config-map
    #[serde(default)]
    pub default: bool,
}

impl ArtifactRepositoryRefStatus {
    pub fn built_in() -> Self {
        Self {
            default: true,
            ..Self::default()
        }
    }

    fn lookup(namespace: &str, reference: ArtifactRepositoryRef) -> Self {
        Self {
            reference,
            namespace: namespace.to_string(),
            default: false,
        }
    }
}

impl fmt::Display for ArtifactRepositoryRefStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.default {
            write!(f, "{DEFAULT_ARTIFACT_REPOSITORY}")
        } else {
            write!(f, "{}/{}", self.namespace, self.reference)
        }
    }
}

/// One repository profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRepository {
    /// Upload the main container's logs as an artifact
    #[serde(default)]
    pub archive_logs: bool,
    /// Layout of generated keys, using `{{workflow.*}}` and `{{pod.name}}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_format: Option<String>,
    /// Bucket or root the keys are placed under; its key is the key prefix
    #[serde(flatten)]
    pub location: ArtifactLocation,
}

/// Values substituted into a repository key format
#[derive(Debug, Clone, Default)]
pub struct KeyContext<'a> {
    pub workflow_name: &'a str,
    pub workflow_namespace: &'a str,
    pub workflow_uid: &'a str,
    pub pod_name: &'a str,
}

impl ArtifactRepository {
    pub fn key_format(&self) -> &str {
        self.key_format.as_deref().unwrap_or(DEFAULT_KEY_FORMAT)
    }

    /// Render the key for an output artifact
    pub fn key_for(&self, context: &KeyContext<'_>, artifact_name: &str) -> String {
        let rendered = self
            .key_format()
            .replace("{{workflow.name}}", context.workflow_name)
            .replace("{{workflow.namespace}}", context.workflow_namespace)
            .replace("{{workflow.uid}}", context.workflow_uid)
            .replace("{{pod.name}}", context.pod_name);
        let prefix = self.location.key().trim_matches('/');
        let suffix = format!("{}/{artifact_name}", rendered.trim_matches('/'));
        if prefix.is_empty() {
            suffix
        } else {
            format!("{prefix}/{suffix}")
        }
    }

    /// An output artifact placed in this repository
    pub fn artifact_for(&self, context: &KeyContext<'_>, artifact_name: &str) -> Artifact {
        let key = self.key_for(context, artifact_name);
        Artifact::new(artifact_name, self.location.with_key(key))
    }
}

/// Read access to config-maps
#[async_trait]
pub trait ConfigMapSource: Send + Sync {
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> RepositoryResult<Option<ConfigMap>>;
}

/// Config-maps held in memory, keyed by namespace and name
#[derive(Debug, Default)]
pub struct InMemoryConfigMaps {
    maps: DashMap<(String, String), ConfigMap>,
}

impl InMemoryConfigMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, config_map: ConfigMap) {
        let key = (
            config_map.metadata.namespace.clone(),
            config_map.metadata.name.clone(),
        );
        self.maps.insert(key, config_map);
    }

    pub fn remove(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.maps
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|(_, map)| map)
    }
}

#[async_trait]
impl ConfigMapSource for InMemoryConfigMaps {
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> RepositoryResult<Option<ConfigMap>> {
        Ok(self
            .maps
            .get(&(namespace.to_string(), name.to_string()))
            .map(|entry| entry.value().clone()))
    }
}

pub struct RepositoryResolver {
    source: Arc<dyn ConfigMapSource>,
    managed_namespace: String,
    default_repository: Option<ArtifactRepository>,
}

impl fmt::Debug for RepositoryResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryResolver")
            .field("managed_namespace", &self.managed_namespace)
            .field("default_repository", &self.default_repository)
            .finish()
    }
}

impl RepositoryResolver {
    pub fn new(
        source: Arc<dyn ConfigMapSource>,
        managed_namespace: impl Into<String>,
        default_repository: Option<ArtifactRepository>,
    ) -> Self {
        Self {
            source,
            managed_namespace: managed_namespace.into(),
            default_repository,
        }
    }

    /// Choose the effective reference for a workflow
    pub async fn resolve(
        &self,
        explicit: Option<&ArtifactRepositoryRef>,
        workflow_namespace: &str,
    ) -> RepositoryResult<ArtifactRepositoryRefStatus> {
        if let Some(reference) = explicit {
            let status = ArtifactRepositoryRefStatus::lookup(workflow_namespace, reference.clone());
            let (resolved, _) = self.lookup(&status).await?;
            return Ok(resolved);
        }

        let mut candidates = vec![ArtifactRepositoryRefStatus::lookup(
            workflow_namespace,
            ArtifactRepositoryRef::default(),
        )];
        if self.managed_namespace != workflow_namespace && !self.managed_namespace.is_empty() {
            candidates.push(ArtifactRepositoryRefStatus::lookup(
                &self.managed_namespace,
                ArtifactRepositoryRef::default(),
            ));
        }

        for candidate in candidates {
            match self.lookup(&candidate).await {
                Ok((resolved, _)) => {
                    debug!(reference = %resolved, "📦 Resolved artifact repository");
                    return Ok(resolved);
                }
                Err(RepositoryError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(ArtifactRepositoryRefStatus::built_in())
    }

    /// Load the repository profile a resolved reference points at
    pub async fn get(
        &self,
        reference: &ArtifactRepositoryRefStatus,
    ) -> RepositoryResult<ArtifactRepository> {
        if reference.default {
            return self
                .default_repository
                .clone()
                .ok_or(RepositoryError::NotConfigured);
        }
        self.lookup(reference).await.map(|(_, repository)| repository)
    }

    async fn lookup(
        &self,
        reference: &ArtifactRepositoryRefStatus,
    ) -> RepositoryResult<(ArtifactRepositoryRefStatus, ArtifactRepository)> {
        let config_map_name = reference.reference.config_map_or_default().to_string();
        let config_map = self
            .source
            .get_config_map(&reference.namespace, &config_map_name)
            .await?
            .ok_or_else(|| RepositoryError::NotFound {
                namespace: reference.namespace.clone(),
                config_map: config_map_name.clone(),
            })?;

        let key = match &reference.reference.key {
            Some(key) if !key.is_empty() => key.clone(),
            _ => config_map
                .metadata
                .annotations
                .get(DEFAULT_ARTIFACT_REPOSITORY)
                .cloned()
                .unwrap_or_default(),
        };
        let value = config_map
            .data
            .get(&key)
            .ok_or_else(|| RepositoryError::MissingKey {
                config_map: config_map_name.clone(),
                key: key.clone(),
            })?;

        let resolved = ArtifactRepositoryRefStatus::lookup(
            &reference.namespace,
            ArtifactRepositoryRef {
                config_map: Some(config_map_name),
                key: Some(key),
            },
        );
        let repository: ArtifactRepository =
            serde_yaml::from_str(value).map_err(|e| RepositoryError::InvalidConfig {
                reference: resolved.to_string(),
                message: e.to_string(),
            })?;
        Ok((resolved, repository))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::ObjectMeta;
    use std::collections::BTreeMap;

    const S3_PROFILE: &str = "archiveLogs: true\ns3:\n  bucket: team-artifacts\n  key: runs\n";
    const GCS_PROFILE: &str = "gcs:\n  bucket: shared\n  key: \"\"\n";

    fn config_map(namespace: &str, default_key: Option<&str>, data: &[(&str, &str)]) -> ConfigMap {
        let mut metadata = ObjectMeta::named(namespace, DEFAULT_CONFIG_MAP);
        if let Some(key) = default_key {
            metadata
                .annotations
                .insert(DEFAULT_ARTIFACT_REPOSITORY.to_string(), key.to_string());
        }
        ConfigMap {
            metadata,
            data: data
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn resolver(maps: Arc<InMemoryConfigMaps>) -> RepositoryResolver {
        let built_in: ArtifactRepository =
            serde_yaml::from_str("file:\n  path: /var/flowmill/artifacts\n").unwrap();
        RepositoryResolver::new(maps, "flowmill-system", Some(built_in))
    }

    #[tokio::test]
    async fn test_resolution_order() {
        let maps = Arc::new(InMemoryConfigMaps::new());
        let resolver = resolver(maps.clone());

        let resolved = resolver.resolve(None, "team-a").await.unwrap();
        assert!(resolved.default);
        let repository = resolver.get(&resolved).await.unwrap();
        assert_eq!(repository.location.driver_name(), "file");

        maps.insert(config_map("flowmill-system", Some("gcs"), &[("gcs", GCS_PROFILE)]));
        let resolved = resolver.resolve(None, "team-a").await.unwrap();
        assert_eq!(resolved.namespace, "flowmill-system");
        assert_eq!(resolved.reference.key.as_deref(), Some("gcs"));

        maps.insert(config_map("team-a", Some("s3"), &[("s3", S3_PROFILE)]));
        let resolved = resolver.resolve(None, "team-a").await.unwrap();
        assert_eq!(resolved.to_string(), "team-a/artifact-repositories#s3");
        let repository = resolver.get(&resolved).await.unwrap();
        assert!(repository.archive_logs);
    }

    #[tokio::test]
    async fn test_explicit_reference_must_exist() {
        let maps = Arc::new(InMemoryConfigMaps::new());
        maps.insert(config_map("team-a", None, &[("s3", S3_PROFILE)]));
        let resolver = resolver(maps);

        let explicit = ArtifactRepositoryRef {
            config_map: None,
            key: Some("missing".into()),
        };
        let err = resolver.resolve(Some(&explicit), "team-a").await.unwrap_err();
        assert_eq!(
            err,
            RepositoryError::MissingKey {
                config_map: DEFAULT_CONFIG_MAP.into(),
                key: "missing".into()
            }
        );

        let explicit = ArtifactRepositoryRef {
            config_map: Some("other".into()),
            key: None,
        };
        let err = resolver.resolve(Some(&explicit), "team-a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_key_rendering() {
        let repository: ArtifactRepository = serde_yaml::from_str(S3_PROFILE).unwrap();
        let context = KeyContext {
            workflow_name: "ci-7f2",
            pod_name: "ci-7f2-build",
            ..KeyContext::default()
        };
        let artifact = repository.artifact_for(&context, "bin");
        assert_eq!(artifact.key(), "runs/ci-7f2/ci-7f2-build/bin");
        assert_eq!(artifact.location.to_uri(), "s3://team-artifacts/runs/ci-7f2/ci-7f2-build/bin");
    }
}
