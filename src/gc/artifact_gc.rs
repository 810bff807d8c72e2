//! # Artifact GC
//!
//! Workflows whose outputs declare an `artifact_gc` strategy carry the
//! artifact-GC finalizer. Once the workflow completes, `OnCompletion`
//! artifacts are removed; once it is marked for deletion, `OnDeletion`
//! artifacts are removed as well. The finalizer is stripped when nothing
//! with a strategy is left to delete.

use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::errors::{GcError, GcResult};
use super::workflow_key;
use crate::artifacts::{Artifact, ArtifactError, ArtifactGcStrategy, ArtifactLocation, DriverFactory};
use crate::config::GcConfig;
use crate::constants::{events, labels::ARTIFACT_GC_FINALIZER};
use crate::events::publisher::EventPublisher;
use crate::logging::{log_artifact_operation, log_error};
use crate::persistence::OffloadNodeStatusRepo;
use crate::repository::{ArtifactRepository, RepositoryError, RepositoryResolver};
use crate::resilience::Backoff;
use crate::workflow::{Nodes, Workflow, WorkflowStore};
use crate::workqueue::WorkQueue;

const REQUEUE_BACKOFF: Backoff = Backoff {
    duration: std::time::Duration::from_secs(5),
    factor: 2.0,
    jitter: 0.1,
    steps: 10,
    cap: std::time::Duration::from_secs(10 * 60),
};

/// Strategies whose artifacts may be deleted now
pub fn applicable_strategies(workflow: &Workflow) -> Vec<ArtifactGcStrategy> {
    let mut strategies = Vec::with_capacity(2);
    if workflow.is_completed() {
        strategies.push(ArtifactGcStrategy::OnCompletion);
    }
    if workflow.metadata.deletion_timestamp.is_some() {
        strategies.push(ArtifactGcStrategy::OnDeletion);
    }
    strategies
}

fn output_artifacts(nodes: &Nodes) -> impl Iterator<Item = &Artifact> {
    nodes
        .values()
        .filter_map(|node| node.outputs.as_ref())
        .flat_map(|outputs| outputs.artifacts.iter())
        .filter(|artifact| artifact.from.is_none())
}

/// Whether any produced artifact declares a GC strategy
pub fn has_artifact_gc(nodes: &Nodes) -> bool {
    output_artifacts(nodes).any(|a| a.gc_strategy() != ArtifactGcStrategy::Never)
}

/// Add the artifact-GC finalizer when outputs need collecting. Returns true if added.
pub fn ensure_artifact_gc_finalizer(workflow: &mut Workflow) -> bool {
    if workflow.metadata.has_finalizer(ARTIFACT_GC_FINALIZER) || !has_artifact_gc(&workflow.status.nodes) {
        return false;
    }
    workflow
        .metadata
        .finalizers
        .push(ARTIFACT_GC_FINALIZER.to_string());
    true
}

/// Where to delete `artifact` from. Artifacts stored in the workflow's
/// repository family are addressed through the repository's current profile.
pub fn location_for(artifact: &Artifact, repository: Option<&ArtifactRepository>) -> ArtifactLocation {
    match repository {
        Some(repository) if repository.location.driver_name() == artifact.location.driver_name() => {
            repository.location.with_key(artifact.key())
        }
        _ => artifact.location.clone(),
    }
}

/// Result of one artifact GC pass over a workflow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArtifactGcOutcome {
    pub deleted: usize,
    pub finalizer_removed: bool,
}

pub struct ArtifactGcController {
    store: Arc<dyn WorkflowStore>,
    resolver: Arc<RepositoryResolver>,
    drivers: Arc<dyn DriverFactory>,
    offloads: Arc<dyn OffloadNodeStatusRepo>,
    queue: Arc<WorkQueue<String>>,
    failures: DashMap<String, u32>,
    publisher: EventPublisher,
    config: GcConfig,
}

impl std::fmt::Debug for ArtifactGcController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactGcController")
            .field("queue", &self.queue.len())
            .field("config", &self.config)
            .finish()
    }
}

impl ArtifactGcController {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        resolver: Arc<RepositoryResolver>,
        drivers: Arc<dyn DriverFactory>,
        offloads: Arc<dyn OffloadNodeStatusRepo>,
        publisher: EventPublisher,
        config: GcConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            drivers,
            offloads,
            queue: Arc::new(WorkQueue::new()),
            failures: DashMap::new(),
            publisher,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<String>> {
        &self.queue
    }

    /// Queue a workflow that bears the finalizer and has something collectable
    pub fn enqueue(&self, workflow: &Workflow) -> bool {
        if !workflow.metadata.has_finalizer(ARTIFACT_GC_FINALIZER)
            || applicable_strategies(workflow).is_empty()
        {
            return false;
        }
        self.queue
            .add(workflow_key(workflow.namespace(), workflow.name()));
        true
    }

    pub async fn resync(&self) -> GcResult<usize> {
        let workflows = self.store.list("").await?;
        Ok(workflows.iter().filter(|w| self.enqueue(w)).count())
    }

    async fn nodes(&self, workflow: &Workflow) -> GcResult<Nodes> {
        match &workflow.status.offload_node_status_version {
            Some(version) => Ok(self.offloads.get(workflow.uid(), version).await?),
            None => Ok(workflow.status.nodes.clone()),
        }
    }

    async fn repository(&self, workflow: &Workflow) -> GcResult<Option<ArtifactRepository>> {
        let reference = match &workflow.status.artifact_repository_ref {
            Some(reference) => reference.clone(),
            None => {
                self.resolver
                    .resolve(workflow.spec.artifact_repository_ref.as_ref(), workflow.namespace())
                    .await?
            }
        };
        match self.resolver.get(&reference).await {
            Ok(repository) => Ok(Some(repository)),
            Err(RepositoryError::NotConfigured) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_artifact(
        &self,
        artifact: &Artifact,
        repository: Option<&ArtifactRepository>,
    ) -> Result<(), ArtifactError> {
        let location = location_for(artifact, repository);
        let driver = self.drivers.driver_for(&location)?;
        let mut target = artifact.clone();
        target.location = location;
        match driver.delete(&target).await {
            Ok(()) | Err(ArtifactError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete collectable artifacts of the workflow behind `key` and strip
    /// the finalizer once nothing with a strategy remains.
    pub async fn process(&self, key: &str) -> GcResult<ArtifactGcOutcome> {
        let Some((namespace, name)) = key.split_once('/') else {
            return Ok(ArtifactGcOutcome::default());
        };
        let Some(workflow) = self.store.get(namespace, name).await? else {
            return Ok(ArtifactGcOutcome::default());
        };
        if !workflow.metadata.has_finalizer(ARTIFACT_GC_FINALIZER) {
            return Ok(ArtifactGcOutcome::default());
        }
        let strategies = applicable_strategies(&workflow);
        if strategies.is_empty() {
            return Ok(ArtifactGcOutcome::default());
        }

        let nodes = self.nodes(&workflow).await?;
        let repository = self.repository(&workflow).await?;

        let mut deleted = 0;
        let mut failed = Vec::new();
        let mut pending = false;
        for artifact in output_artifacts(&nodes) {
            let strategy = artifact.gc_strategy();
            if strategy == ArtifactGcStrategy::Never {
                continue;
            }
            if !strategies.contains(&strategy) {
                pending = true;
                continue;
            }
            match self.delete_artifact(artifact, repository.as_ref()).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    warn!(workflow = %key, artifact = %artifact.name, error = %e, "Failed to delete artifact");
                    failed.push(e);
                }
            }
        }

        if deleted > 0 {
            log_artifact_operation("gc", "workflow", key, "deleted", Some(&format!("{deleted} artifacts")));
            if let Err(e) = self
                .publisher
                .publish(
                    events::GC_ARTIFACTS_DELETED,
                    json!({ "namespace": namespace, "name": name, "deleted": deleted }),
                )
                .await
            {
                debug!(error = %e, "Failed to publish artifact GC event");
            }
        }

        if let Some(first) = failed.first() {
            return Err(GcError::ArtifactsRemaining {
                workflow: key.to_string(),
                remaining: failed.len(),
                first_error: first.to_string(),
            });
        }
        if pending {
            return Ok(ArtifactGcOutcome {
                deleted,
                finalizer_removed: false,
            });
        }

        let finalizers: Vec<&str> = workflow
            .metadata
            .finalizers
            .iter()
            .map(String::as_str)
            .filter(|f| *f != ARTIFACT_GC_FINALIZER)
            .collect();
        match self
            .store
            .patch(namespace, name, &json!({ "metadata": { "finalizers": finalizers } }))
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        info!(workflow = %key, deleted, "🧹 Artifact GC finished, finalizer removed");
        Ok(ArtifactGcOutcome {
            deleted,
            finalizer_removed: true,
        })
    }

    async fn handle(&self, key: &str) {
        match self.process(key).await {
            Ok(_) => {
                self.failures.remove(key);
            }
            Err(e) if e.kind().is_retryable() => {
                let attempt = {
                    let mut count = self.failures.entry(key.to_string()).or_insert(0);
                    let attempt = *count;
                    *count = count.saturating_add(1);
                    attempt
                };
                let delay = REQUEUE_BACKOFF.delay_for(attempt);
                warn!(workflow = %key, error = %e, attempt, delay_ms = delay.as_millis() as u64, "Artifact GC failed, requeueing");
                self.queue.add_after(key.to_string(), delay);
            }
            Err(e) => {
                self.failures.remove(key);
                log_error("artifact_gc", "process", &e.to_string(), Some(key));
            }
        }
    }

    pub fn run(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let workers = self.config.artifact_gc_workers.max(1);
        info!(workers, "🧹 Starting artifact GC workers");

        let mut handles = Vec::with_capacity(workers + 1);
        let queue = Arc::clone(&self.queue);
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            token.cancelled().await;
            queue.shut_down();
        }));

        for worker in 0..workers {
            let controller = Arc::clone(self);
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let key = tokio::select! {
                        _ = token.cancelled() => break,
                        key = controller.queue.get() => match key {
                            Some(key) => key,
                            None => break,
                        },
                    };
                    controller.handle(&key).await;
                    controller.queue.done(&key);
                }
                debug!(worker, "Artifact GC worker stopped");
            }));
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{ArtifactDriver, BlobDriver, SingleDriverFactory};
    use crate::gc::test_support::{completed_workflow, running_workflow, with_outputs};
    use crate::persistence::InMemoryOffloadRepo;
    use crate::repository::InMemoryConfigMaps;
    use crate::state_machine::WorkflowPhase;
    use crate::workflow::InMemoryWorkflowStore;
    use chrono::Utc;
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;
    use object_store::ObjectStore;
    use std::time::Duration;

    fn artifact(key: &str, strategy: ArtifactGcStrategy) -> Artifact {
        Artifact::new(
            key,
            ArtifactLocation::S3 {
                bucket: "artifacts".into(),
                key: key.into(),
                endpoint: None,
                region: None,
            },
        )
        .with_gc(strategy)
    }

    struct Harness {
        controller: ArtifactGcController,
        store: Arc<InMemoryWorkflowStore>,
        objects: Arc<InMemory>,
    }

    async fn harness() -> Harness {
        let objects = Arc::new(InMemory::new());
        for key in ["wf/done.txt", "wf/keep.txt", "wf/forever.txt"] {
            objects
                .put(&ObjectPath::from(key), bytes::Bytes::from_static(b"data").into())
                .await
                .unwrap();
        }
        let driver: Arc<dyn ArtifactDriver> = Arc::new(BlobDriver::new(objects.clone(), "memory"));
        let store = Arc::new(InMemoryWorkflowStore::new());
        let controller = ArtifactGcController::new(
            store.clone(),
            Arc::new(RepositoryResolver::new(
                Arc::new(InMemoryConfigMaps::new()),
                "flowmill",
                None,
            )),
            Arc::new(SingleDriverFactory(driver)),
            Arc::new(InMemoryOffloadRepo::new(Duration::from_secs(300))),
            EventPublisher::new(8),
            GcConfig::default(),
        );
        Harness {
            controller,
            store,
            objects,
        }
    }

    async fn exists(objects: &InMemory, key: &str) -> bool {
        objects.head(&ObjectPath::from(key)).await.is_ok()
    }

    fn gc_workflow() -> Workflow {
        let mut workflow = completed_workflow("wf", WorkflowPhase::Succeeded, Utc::now());
        with_outputs(
            &mut workflow,
            vec![
                artifact("wf/done.txt", ArtifactGcStrategy::OnCompletion),
                artifact("wf/keep.txt", ArtifactGcStrategy::OnDeletion),
                artifact("wf/forever.txt", ArtifactGcStrategy::Never),
            ],
        );
        assert!(ensure_artifact_gc_finalizer(&mut workflow));
        assert!(!ensure_artifact_gc_finalizer(&mut workflow));
        workflow
    }

    #[test]
    fn test_applicable_strategies() {
        let mut workflow = running_workflow("wf");
        assert!(applicable_strategies(&workflow).is_empty());

        workflow.metadata.deletion_timestamp = Some(Utc::now());
        assert_eq!(applicable_strategies(&workflow), vec![ArtifactGcStrategy::OnDeletion]);

        let mut done = completed_workflow("wf", WorkflowPhase::Failed, Utc::now());
        done.metadata.deletion_timestamp = Some(Utc::now());
        assert_eq!(
            applicable_strategies(&done),
            vec![ArtifactGcStrategy::OnCompletion, ArtifactGcStrategy::OnDeletion]
        );
    }

    #[test]
    fn test_location_uses_repository_profile() {
        let repository: ArtifactRepository = serde_yaml::from_str(
            "s3:\n  bucket: artifacts\n  key: \"\"\n  endpoint: http://minio:9000\n",
        )
        .unwrap();
        let located = location_for(&artifact("wf/a.txt", ArtifactGcStrategy::OnCompletion), Some(&repository));
        assert_eq!(
            located,
            ArtifactLocation::S3 {
                bucket: "artifacts".into(),
                key: "wf/a.txt".into(),
                endpoint: Some("http://minio:9000".into()),
                region: None,
            }
        );

        let file = Artifact::new("f", ArtifactLocation::File { path: "/tmp/f".into() });
        assert_eq!(location_for(&file, Some(&repository)), file.location);
    }

    #[tokio::test]
    async fn test_completion_then_deletion() {
        let h = harness().await;
        h.store.create(gc_workflow()).await.unwrap();

        let outcome = h.controller.process("default/wf").await.unwrap();
        assert_eq!(
            outcome,
            ArtifactGcOutcome {
                deleted: 1,
                finalizer_removed: false
            }
        );
        assert!(!exists(&h.objects, "wf/done.txt").await);
        assert!(exists(&h.objects, "wf/keep.txt").await);

        h.store
            .patch(
                "default",
                "wf",
                &serde_json::json!({ "metadata": { "deletionTimestamp": Utc::now() } }),
            )
            .await
            .unwrap();
        let outcome = h.controller.process("default/wf").await.unwrap();
        assert!(outcome.finalizer_removed);
        assert!(!exists(&h.objects, "wf/keep.txt").await);
        assert!(exists(&h.objects, "wf/forever.txt").await);

        // last finalizer gone while marked for deletion
        assert!(h.store.get("default", "wf").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_requires_finalizer() {
        let h = harness().await;
        let mut workflow = gc_workflow();
        assert!(h.controller.enqueue(&workflow));

        workflow.metadata.finalizers.clear();
        assert!(!h.controller.enqueue(&workflow));
        assert_eq!(h.controller.queue().len(), 1);
    }
}
