//! Retry wrapper applying the driver backoff profile to any [`ArtifactDriver`].

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use super::blob::BlobDriver;
use super::driver::{ArtifactDriver, ByteStream, DriverFactory};
use super::errors::{ArtifactError, ArtifactResult};
use super::hdfs::WebHdfsDriver;
use super::types::{Artifact, ArtifactLocation};
use crate::resilience::{retry_on, Backoff};

fn is_retriable(err: &ArtifactError) -> bool {
    err.is_transient()
}

/// Retries transient failures of the wrapped driver
#[derive(Debug, Clone)]
pub struct RetryingDriver {
    inner: Arc<dyn ArtifactDriver>,
    backoff: Backoff,
}

impl RetryingDriver {
    pub fn new(inner: Arc<dyn ArtifactDriver>) -> Self {
        Self::with_backoff(inner, Backoff::DRIVER)
    }

    pub fn with_backoff(inner: Arc<dyn ArtifactDriver>, backoff: Backoff) -> Self {
        Self { inner, backoff }
    }
}

#[async_trait]
impl ArtifactDriver for RetryingDriver {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn load(&self, artifact: &Artifact, local_path: &Path) -> ArtifactResult<()> {
        retry_on(&self.backoff, is_retriable, || {
            self.inner.load(artifact, local_path)
        })
        .await
    }

    async fn save(&self, local_path: &Path, artifact: &Artifact) -> ArtifactResult<()> {
        retry_on(&self.backoff, is_retriable, || {
            self.inner.save(local_path, artifact)
        })
        .await
    }

    async fn open_stream(&self, artifact: &Artifact) -> ArtifactResult<ByteStream> {
        retry_on(&self.backoff, is_retriable, || self.inner.open_stream(artifact)).await
    }

    async fn delete(&self, artifact: &Artifact) -> ArtifactResult<()> {
        retry_on(&self.backoff, is_retriable, || self.inner.delete(artifact)).await
    }

    async fn list_objects(&self, artifact: &Artifact) -> ArtifactResult<Vec<String>> {
        retry_on(&self.backoff, is_retriable, || self.inner.list_objects(artifact)).await
    }

    async fn is_directory(&self, artifact: &Artifact) -> ArtifactResult<bool> {
        retry_on(&self.backoff, is_retriable, || self.inner.is_directory(artifact)).await
    }
}

/// Builds the matching driver for a location, wrapped in retries
#[derive(Debug, Clone)]
pub struct DefaultDriverFactory {
    backoff: Backoff,
}

impl DefaultDriverFactory {
    pub fn new(backoff: Backoff) -> Self {
        Self { backoff }
    }
}

impl Default for DefaultDriverFactory {
    fn default() -> Self {
        Self::new(Backoff::DRIVER)
    }
}

impl DriverFactory for DefaultDriverFactory {
    fn driver_for(&self, location: &ArtifactLocation) -> ArtifactResult<Arc<dyn ArtifactDriver>> {
        let inner: Arc<dyn ArtifactDriver> = match location {
            ArtifactLocation::Hdfs { .. } => Arc::new(WebHdfsDriver::for_location(location)?),
            _ => Arc::new(BlobDriver::for_location(location)?),
        };
        Ok(Arc::new(RetryingDriver::with_backoff(inner, self.backoff)))
    }
}
