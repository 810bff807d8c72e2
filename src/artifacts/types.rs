use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::{ArtifactError, ArtifactResult};

/// How an output directory is packed before upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveMode {
    /// Upload files as they are
    #[default]
    None,
    /// Pack into a single tarball
    Tar,
}

/// When a produced artifact may be removed from its repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactGcStrategy {
    OnCompletion,
    OnDeletion,
    Never,
}

impl fmt::Display for ArtifactGcStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnCompletion => write!(f, "OnCompletion"),
            Self::OnDeletion => write!(f, "OnDeletion"),
            Self::Never => write!(f, "Never"),
        }
    }
}

impl FromStr for ArtifactGcStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OnCompletion" => Ok(Self::OnCompletion),
            "OnDeletion" => Ok(Self::OnDeletion),
            "Never" => Ok(Self::Never),
            _ => Err(format!("Invalid artifact GC strategy: {s}")),
        }
    }
}

/// Exactly one source descriptor for an artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactLocation {
    S3 {
        bucket: String,
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
    },
    Gcs {
        bucket: String,
        key: String,
    },
    Azure {
        container: String,
        blob: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        account: Option<String>,
    },
    Hdfs {
        path: String,
        /// `host:port` of the namenodes, tried in order
        addresses: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
    },
    File {
        path: String,
    },
}

impl ArtifactLocation {
    /// Slash separated object key inside the location's bucket or root
    pub fn key(&self) -> &str {
        match self {
            Self::S3 { key, .. } | Self::Gcs { key, .. } => key,
            Self::Azure { blob, .. } => blob,
            Self::Hdfs { path, .. } | Self::File { path } => path,
        }
    }

    /// Same bucket or root with a different key
    pub fn with_key(&self, new_key: impl Into<String>) -> Self {
        let new_key = new_key.into();
        let mut location = self.clone();
        match &mut location {
            Self::S3 { key, .. } | Self::Gcs { key, .. } => *key = new_key,
            Self::Azure { blob, .. } => *blob = new_key,
            Self::Hdfs { path, .. } | Self::File { path } => *path = new_key,
        }
        location
    }

    /// Driver family handling this location
    pub fn driver_name(&self) -> &'static str {
        match self {
            Self::S3 { .. } => "s3",
            Self::Gcs { .. } => "gcs",
            Self::Azure { .. } => "azure",
            Self::Hdfs { .. } => "hdfs",
            Self::File { .. } => "file",
        }
    }

    pub fn to_uri(&self) -> String {
        match self {
            Self::S3 { bucket, key, .. } => format!("s3://{bucket}/{key}"),
            Self::Gcs { bucket, key } => format!("gs://{bucket}/{key}"),
            Self::Azure { container, blob, .. } => format!("azure://{container}/{blob}"),
            Self::Hdfs { path, addresses, .. } => {
                let host = addresses.first().map(String::as_str).unwrap_or_default();
                format!("hdfs://{host}/{}", path.trim_start_matches('/'))
            }
            Self::File { path } => format!("file://{path}"),
        }
    }

    /// Parse `s3://`, `gs://`, `azure://`, `hdfs://` and `file://` URIs
    pub fn parse_uri(uri: &str) -> ArtifactResult<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| ArtifactError::invalid_location(format!("'{uri}' is not a URI")))?;
        if scheme == "file" {
            if rest.is_empty() {
                return Err(ArtifactError::invalid_location(format!("'{uri}' has no path")));
            }
            return Ok(Self::File {
                path: rest.to_string(),
            });
        }

        let (authority, key) = rest.split_once('/').unwrap_or((rest, ""));
        if authority.is_empty() {
            return Err(ArtifactError::invalid_location(format!(
                "'{uri}' has no bucket or host"
            )));
        }
        match scheme {
            "s3" => Ok(Self::S3 {
                bucket: authority.to_string(),
                key: key.to_string(),
                endpoint: None,
                region: None,
            }),
            "gs" | "gcs" => Ok(Self::Gcs {
                bucket: authority.to_string(),
                key: key.to_string(),
            }),
            "azure" | "az" => Ok(Self::Azure {
                container: authority.to_string(),
                blob: key.to_string(),
                account: None,
            }),
            "hdfs" => Ok(Self::Hdfs {
                path: format!("/{key}"),
                addresses: vec![authority.to_string()],
                user: None,
            }),
            other => Err(ArtifactError::invalid_location(format!(
                "unsupported artifact scheme '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uri())
    }
}

/// A named artifact and where it lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    #[serde(flatten)]
    pub location: ArtifactLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_gc: Option<ArtifactGcStrategy>,
    /// Source reference when the artifact is re-exported from another step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, location: ArtifactLocation) -> Self {
        Self {
            name: name.into(),
            location,
            archive: None,
            retention: None,
            artifact_gc: None,
            from: None,
        }
    }

    pub fn with_gc(mut self, strategy: ArtifactGcStrategy) -> Self {
        self.artifact_gc = Some(strategy);
        self
    }

    pub fn key(&self) -> &str {
        self.location.key()
    }

    /// GC strategy, `Never` when none is declared
    pub fn gc_strategy(&self) -> ArtifactGcStrategy {
        self.artifact_gc.unwrap_or(ArtifactGcStrategy::Never)
    }
}
