//! # Object Store Driver
//!
//! S3, GCS, Azure Blob and local file system artifacts through the
//! `object_store` crate.
//!
//! `load` fetches an exact key when one exists and otherwise treats the key as
//! a prefix, mirroring every object below it into the local directory. An
//! empty prefix is reported as `NotFound` before anything is written.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::driver::{
    collect_upload_files, local_target, normalize_key, relative_key, upload_key, write_local,
    ArtifactDriver, ByteStream,
};
use super::errors::{ArtifactError, ArtifactResult};
use super::types::{Artifact, ArtifactLocation};
use crate::constants::timing::OBJECT_STORE_LIST_TIMEOUT;
use crate::logging::log_artifact_operation;

#[derive(Debug, Clone)]
pub struct BlobDriver {
    store: Arc<dyn ObjectStore>,
    backend: String,
    list_timeout: Duration,
}

impl BlobDriver {
    pub fn new(store: Arc<dyn ObjectStore>, backend: impl Into<String>) -> Self {
        Self {
            store,
            backend: backend.into(),
            list_timeout: OBJECT_STORE_LIST_TIMEOUT,
        }
    }

    pub fn with_list_timeout(mut self, list_timeout: Duration) -> Self {
        self.list_timeout = list_timeout;
        self
    }

    /// Build a store client for an object store or file location.
    ///
    /// Credentials come from the environment the way each provider's SDK
    /// expects them.
    pub fn for_location(location: &ArtifactLocation) -> ArtifactResult<Self> {
        let invalid = |e: object_store::Error| ArtifactError::invalid_location(e.to_string());
        let store: Arc<dyn ObjectStore> = match location {
            ArtifactLocation::S3 {
                bucket,
                endpoint,
                region,
                ..
            } => {
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Some(region) = region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(endpoint.starts_with("http://"));
                }
                Arc::new(builder.build().map_err(invalid)?)
            }
            ArtifactLocation::Gcs { bucket, .. } => Arc::new(
                GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(bucket)
                    .build()
                    .map_err(invalid)?,
            ),
            ArtifactLocation::Azure {
                container, account, ..
            } => {
                let mut builder = MicrosoftAzureBuilder::from_env().with_container_name(container);
                if let Some(account) = account {
                    builder = builder.with_account(account);
                }
                Arc::new(builder.build().map_err(invalid)?)
            }
            ArtifactLocation::File { .. } => Arc::new(LocalFileSystem::new()),
            ArtifactLocation::Hdfs { .. } => {
                return Err(ArtifactError::invalid_location(
                    "HDFS locations are served by the WebHDFS driver",
                ))
            }
        };
        Ok(Self::new(store, location.driver_name()))
    }

    /// Every object below `prefix`, bounded by the list timeout
    async fn list_prefix(&self, prefix: &str) -> ArtifactResult<Vec<String>> {
        let prefix_path = ObjectPath::from(prefix);
        let listing = self
            .store
            .list(Some(&prefix_path))
            .map_ok(|meta| meta.location.to_string())
            .try_collect::<Vec<String>>();

        let mut keys = tokio::time::timeout(self.list_timeout, listing)
            .await
            .map_err(|_| {
                ArtifactError::transient(
                    "list",
                    format!("listing '{prefix}' timed out after {:?}", self.list_timeout),
                )
            })?
            .map_err(|e| ArtifactError::from_object_store("list", e))?;
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> ArtifactResult<bool> {
        if key.is_empty() || key.ends_with('/') {
            return Ok(false);
        }
        match self.store.head(&ObjectPath::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(ArtifactError::from_object_store("head", e)),
        }
    }

    async fn fetch(&self, key: &str) -> ArtifactResult<bytes::Bytes> {
        let result = self
            .store
            .get(&ObjectPath::from(key))
            .await
            .map_err(|e| ArtifactError::from_object_store("load", e))?;
        result
            .bytes()
            .await
            .map_err(|e| ArtifactError::from_object_store("load", e))
    }
}

#[async_trait]
impl ArtifactDriver for BlobDriver {
    fn name(&self) -> &str {
        &self.backend
    }

    async fn load(&self, artifact: &Artifact, local_path: &Path) -> ArtifactResult<()> {
        let key = normalize_key(artifact.key());

        if !key.ends_with('/') {
            match self.fetch(&key).await {
                Ok(contents) => {
                    write_local(local_path, &contents).await?;
                    log_artifact_operation("load", &self.backend, &key, "downloaded", None);
                    return Ok(());
                }
                Err(ArtifactError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let keys = self.list_prefix(&key).await?;
        if keys.is_empty() {
            return Err(ArtifactError::not_found(key));
        }

        let mut fetched = Vec::with_capacity(keys.len());
        for object_key in &keys {
            fetched.push((object_key, self.fetch(object_key).await?));
        }
        for (object_key, contents) in fetched {
            let target = local_target(local_path, relative_key(&key, object_key));
            write_local(&target, &contents).await?;
        }

        log_artifact_operation(
            "load",
            &self.backend,
            &key,
            "downloaded",
            Some(&format!("{} objects", keys.len())),
        );
        Ok(())
    }

    async fn save(&self, local_path: &Path, artifact: &Artifact) -> ArtifactResult<()> {
        let key = normalize_key(artifact.key());
        let files = collect_upload_files(local_path)?;

        for (file, relative) in &files {
            let contents = tokio::fs::read(file)
                .await
                .map_err(|e| ArtifactError::io(file, &e))?;
            let object_key = upload_key(&key, relative);
            self.store
                .put(&ObjectPath::from(object_key.as_str()), contents.into())
                .await
                .map_err(|e| ArtifactError::from_object_store("save", e))?;
            debug!(backend = %self.backend, key = %object_key, "⬆️ Uploaded object");
        }

        log_artifact_operation(
            "save",
            &self.backend,
            &key,
            "uploaded",
            Some(&format!("{} files", files.len())),
        );
        Ok(())
    }

    async fn open_stream(&self, artifact: &Artifact) -> ArtifactResult<ByteStream> {
        let key = normalize_key(artifact.key());
        let result = self
            .store
            .get(&ObjectPath::from(key.as_str()))
            .await
            .map_err(|e| ArtifactError::from_object_store("open_stream", e))?;
        Ok(result
            .into_stream()
            .map_err(|e| ArtifactError::from_object_store("open_stream", e))
            .boxed())
    }

    async fn delete(&self, artifact: &Artifact) -> ArtifactResult<()> {
        let key = normalize_key(artifact.key());
        let mut targets = self.list_prefix(&key).await?;
        if self.exists(&key).await? {
            targets.push(key.clone());
        }

        for target in &targets {
            match self.store.delete(&ObjectPath::from(target.as_str())).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(ArtifactError::from_object_store("delete", e)),
            }
        }

        log_artifact_operation(
            "delete",
            &self.backend,
            &key,
            "deleted",
            Some(&format!("{} objects", targets.len())),
        );
        Ok(())
    }

    async fn list_objects(&self, artifact: &Artifact) -> ArtifactResult<Vec<String>> {
        let key = normalize_key(artifact.key());
        if self.exists(&key).await? {
            return Ok(vec![key]);
        }
        self.list_prefix(&key).await
    }

    async fn is_directory(&self, artifact: &Artifact) -> ArtifactResult<bool> {
        let key = normalize_key(artifact.key());
        if self.exists(&key).await? {
            return Ok(false);
        }
        Ok(!self.list_prefix(&key).await?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn artifact(key: &str) -> Artifact {
        Artifact::new(
            "out",
            ArtifactLocation::S3 {
                bucket: "builds".into(),
                key: key.into(),
                endpoint: None,
                region: None,
            },
        )
    }

    async fn seeded() -> (Arc<InMemory>, BlobDriver) {
        let store = Arc::new(InMemory::new());
        for (key, body) in [
            ("logs/main.log", "main"),
            ("logs/init/setup.log", "setup"),
            ("logs.txt", "sibling"),
        ] {
            store
                .put(&ObjectPath::from(key), bytes::Bytes::from(body).into())
                .await
                .unwrap();
        }
        let driver = BlobDriver::new(store.clone(), "memory");
        (store, driver)
    }

    #[tokio::test]
    async fn test_exact_key_loads_only_that_object() {
        let (_, driver) = seeded().await;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("main.log");

        driver.load(&artifact("logs/main.log"), &target).await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "main");
        assert_eq!(
            driver.list_objects(&artifact("logs/main.log")).await.unwrap(),
            vec!["logs/main.log".to_string()]
        );
    }

    #[tokio::test]
    async fn test_prefix_load_mirrors_tree() {
        let (_, driver) = seeded().await;
        let dir = tempfile::tempdir().unwrap();

        driver.load(&artifact("logs/"), dir.path()).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("main.log")).unwrap(),
            "main"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("init").join("setup.log")).unwrap(),
            "setup"
        );
        assert!(!dir.path().join("logs.txt").exists());
        assert!(driver.is_directory(&artifact("logs")).await.unwrap());
        assert!(!driver.is_directory(&artifact("logs.txt")).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_prefix_is_not_found() {
        let (_, driver) = seeded().await;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");

        let err = driver
            .load(&artifact("does/not/exist/"), &target)
            .await
            .unwrap_err();
        assert_eq!(err, ArtifactError::not_found("does/not/exist/"));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_save_directory_and_delete_prefix() {
        let store = Arc::new(InMemory::new());
        let driver = BlobDriver::new(store.clone(), "memory");
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.bin"), b"a").unwrap();
        std::fs::write(dir.path().join("nested").join("b.bin"), b"b").unwrap();

        driver.save(dir.path(), &artifact("out/run-1")).await.unwrap();
        let keys = driver.list_objects(&artifact("out/run-1")).await.unwrap();
        assert_eq!(keys, vec!["out/run-1/a.bin", "out/run-1/nested/b.bin"]);

        driver.delete(&artifact("out/run-1")).await.unwrap();
        assert!(driver.list_objects(&artifact("out/run-1")).await.unwrap().is_empty());
        driver.delete(&artifact("out/run-1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_stream_reads_contents() {
        let (_, driver) = seeded().await;
        let chunks: Vec<bytes::Bytes> = driver
            .open_stream(&artifact("logs/main.log"))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.concat(), b"main");
    }
}
