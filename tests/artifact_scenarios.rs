//! Object-store loads through the retrying driver.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowmill_core::artifacts::{
    Artifact, ArtifactDriver, ArtifactError, ArtifactLocation, ArtifactResult, BlobDriver,
    ByteStream, RetryingDriver,
};
use flowmill_core::resilience::Backoff;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;

const FAST: Backoff = Backoff {
    duration: Duration::from_millis(1),
    factor: 2.0,
    jitter: 0.0,
    steps: 5,
    cap: Duration::from_millis(10),
};

/// Counts loads and optionally fails every one with a transient error
#[derive(Debug)]
struct Counting {
    inner: Arc<dyn ArtifactDriver>,
    loads: AtomicU32,
    flaky: bool,
}

impl Counting {
    fn new(inner: Arc<dyn ArtifactDriver>, flaky: bool) -> Arc<Self> {
        Arc::new(Self {
            inner,
            loads: AtomicU32::new(0),
            flaky,
        })
    }
}

#[async_trait]
impl ArtifactDriver for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    async fn load(&self, artifact: &Artifact, local_path: &Path) -> ArtifactResult<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.flaky {
            return Err(ArtifactError::transient("load", "connection reset"));
        }
        self.inner.load(artifact, local_path).await
    }

    async fn save(&self, local_path: &Path, artifact: &Artifact) -> ArtifactResult<()> {
        self.inner.save(local_path, artifact).await
    }

    async fn open_stream(&self, artifact: &Artifact) -> ArtifactResult<ByteStream> {
        self.inner.open_stream(artifact).await
    }

    async fn delete(&self, artifact: &Artifact) -> ArtifactResult<()> {
        self.inner.delete(artifact).await
    }

    async fn list_objects(&self, artifact: &Artifact) -> ArtifactResult<Vec<String>> {
        self.inner.list_objects(artifact).await
    }

    async fn is_directory(&self, artifact: &Artifact) -> ArtifactResult<bool> {
        self.inner.is_directory(artifact).await
    }
}

fn s3(key: &str) -> Artifact {
    Artifact::new(
        "data",
        ArtifactLocation::S3 {
            bucket: "artifacts".into(),
            key: key.into(),
            endpoint: None,
            region: None,
        },
    )
}

async fn blob_driver() -> Arc<dyn ArtifactDriver> {
    let objects = Arc::new(InMemory::new());
    objects
        .put(
            &ObjectPath::from("present/a.txt"),
            bytes::Bytes::from_static(b"a").into(),
        )
        .await
        .unwrap();
    Arc::new(BlobDriver::new(objects, "memory"))
}

#[tokio::test]
async fn missing_prefix_is_not_found_without_writing() {
    let counting = Counting::new(blob_driver().await, false);
    let driver = RetryingDriver::with_backoff(counting.clone(), FAST);
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("out");

    let err = driver
        .load(&s3("does/not/exist/"), &target)
        .await
        .unwrap_err();
    assert!(matches!(err, ArtifactError::NotFound { .. }));
    assert!(counting.loads.load(Ordering::SeqCst) <= 5);
    assert!(!target.exists());
}

#[tokio::test]
async fn transient_failures_stop_at_configured_steps() {
    let counting = Counting::new(blob_driver().await, true);
    let driver = RetryingDriver::with_backoff(counting.clone(), FAST);
    let dir = tempfile::tempdir().unwrap();

    let err = driver
        .load(&s3("present/a.txt"), &dir.path().join("a.txt"))
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(counting.loads.load(Ordering::SeqCst), FAST.steps);
}

#[tokio::test]
async fn prefix_load_writes_every_object() {
    let driver = RetryingDriver::with_backoff(blob_driver().await, FAST);
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("present");

    driver.load(&s3("present/"), &target).await.unwrap();
    assert_eq!(std::fs::read_to_string(target.join("a.txt")).unwrap(), "a");
}
