//! Deletes completed workflows once their TTL strategy says they have expired.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::artifact_gc::ArtifactGcController;
use super::errors::GcResult;
use super::workflow_key;
use crate::config::GcConfig;
use crate::constants::{events, timing};
use crate::events::publisher::EventPublisher;
use crate::logging::{log_error, log_workflow_operation};
use crate::workflow::{Workflow, WorkflowStore};
use crate::workqueue::WorkQueue;

/// Time left until `workflow` expires; `None` when it has no applicable TTL.
/// Negative when the TTL has already passed.
pub fn expires_in(workflow: &Workflow, now: DateTime<Utc>) -> Option<chrono::Duration> {
    if !workflow.is_completed() {
        return None;
    }
    let ttl = workflow
        .spec
        .ttl_strategy
        .as_ref()?
        .ttl_for(workflow.status.phase)?;
    let finished_at = workflow.status.finished_at?;
    let ttl = chrono::Duration::seconds(i64::try_from(ttl).ok()?);
    Some(finished_at + ttl - now)
}

#[derive(Debug)]
pub struct TtlController {
    store: Arc<dyn WorkflowStore>,
    queue: Arc<WorkQueue<String>>,
    publisher: EventPublisher,
    config: GcConfig,
    artifact_gc: Option<Arc<ArtifactGcController>>,
}

impl TtlController {
    pub fn new(store: Arc<dyn WorkflowStore>, publisher: EventPublisher, config: GcConfig) -> Self {
        Self {
            store,
            queue: Arc::new(WorkQueue::new()),
            publisher,
            config,
            artifact_gc: None,
        }
    }

    /// Workflows left behind by a delete because of finalizers are handed
    /// to `artifact_gc` for `OnDeletion` collection.
    pub fn with_artifact_gc(mut self, artifact_gc: Arc<ArtifactGcController>) -> Self {
        self.artifact_gc = Some(artifact_gc);
        self
    }

    pub fn queue(&self) -> &Arc<WorkQueue<String>> {
        &self.queue
    }

    /// Schedule deletion of a completed workflow. Returns the delay it was queued with.
    pub fn enqueue(&self, workflow: &Workflow, now: DateTime<Utc>) -> Option<Duration> {
        let remaining = expires_in(workflow, now)?;
        let delay = remaining.to_std().unwrap_or_default() + timing::TTL_EXTRA_DELAY;
        let key = workflow_key(workflow.namespace(), workflow.name());
        debug!(workflow = %key, delay_secs = delay.as_secs(), phase = %workflow.status.phase, "Queueing workflow for TTL delete");
        self.queue.add_after(key, delay);
        Some(delay)
    }

    /// Enqueue every completed workflow with a TTL, as after an informer resync
    pub async fn resync(&self) -> GcResult<usize> {
        let now = Utc::now();
        let workflows = self.store.list("").await?;
        Ok(workflows
            .iter()
            .filter_map(|workflow| self.enqueue(workflow, now))
            .count())
    }

    /// Delete the workflow behind `key` if its TTL has passed. A workflow
    /// that is no longer completed (it was retried) or has no TTL is left
    /// alone; one whose TTL moved into the future is queued again. A
    /// workflow that is already gone is not an error.
    pub async fn delete(&self, key: &str) -> GcResult<bool> {
        let Some((namespace, name)) = key.split_once('/') else {
            return Ok(false);
        };
        let Some(workflow) = self.store.get(namespace, name).await? else {
            return Ok(false);
        };
        if !workflow.is_completed() {
            info!(workflow = %key, "Workflow is running again, skipping TTL delete");
            return Ok(false);
        }
        let now = Utc::now();
        match expires_in(&workflow, now) {
            None => {
                debug!(workflow = %key, "Workflow has no TTL, skipping delete");
                return Ok(false);
            }
            Some(remaining) if remaining > chrono::Duration::zero() => {
                debug!(workflow = %key, remaining_secs = remaining.num_seconds(), "TTL not reached yet, requeueing");
                self.enqueue(&workflow, now);
                return Ok(false);
            }
            Some(_) => {}
        }

        match self
            .store
            .delete(namespace, name, self.config.propagation_policy)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(workflow = %key, "Workflow already deleted");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(artifact_gc) = &self.artifact_gc {
            if let Some(pending) = self.store.get(namespace, name).await? {
                if artifact_gc.enqueue(&pending) {
                    debug!(workflow = %key, "Deletion waits on artifact GC");
                }
            }
        }

        log_workflow_operation("ttl_delete", None, Some(name), Some(namespace), "Deleted", None);
        if let Err(e) = self
            .publisher
            .publish(events::GC_WORKFLOW_DELETED, json!({ "namespace": namespace, "name": name }))
            .await
        {
            debug!(error = %e, "Failed to publish TTL delete event");
        }
        Ok(true)
    }

    pub fn run(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let workers = self.config.ttl_workers.max(1);
        info!(workers, "🧹 Starting TTL workers");

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
                    if let Err(e) = controller.delete(&key).await {
                        log_error("ttl_controller", "delete", &e.to_string(), Some(&key));
                    }
                    controller.queue.done(&key);
                }
                debug!(worker, "TTL worker stopped");
            }));
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{
        Artifact, ArtifactDriver, ArtifactGcStrategy, ArtifactLocation, BlobDriver, SingleDriverFactory,
    };
    use crate::constants::labels::ARTIFACT_GC_FINALIZER;
    use crate::gc::artifact_gc::ensure_artifact_gc_finalizer;
    use crate::gc::test_support::{completed_workflow, running_workflow, with_outputs};
    use crate::persistence::InMemoryOffloadRepo;
    use crate::repository::{InMemoryConfigMaps, RepositoryResolver};
    use crate::state_machine::WorkflowPhase;
    use crate::workflow::{InMemoryWorkflowStore, TtlStrategy};
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;
    use object_store::ObjectStore;

    fn strategy() -> TtlStrategy {
        TtlStrategy {
            seconds_after_completion: Some(30),
            seconds_after_success: Some(10),
            seconds_after_failure: Some(60),
        }
    }

    #[test]
    fn test_ttl_priority_by_phase() {
        let now = Utc::now();
        let mut workflow = completed_workflow("wf", WorkflowPhase::Failed, now);
        workflow.spec.ttl_strategy = Some(strategy());
        assert_eq!(expires_in(&workflow, now), Some(chrono::Duration::seconds(60)));

        workflow.status.phase = WorkflowPhase::Succeeded;
        assert_eq!(expires_in(&workflow, now), Some(chrono::Duration::seconds(10)));

        workflow.spec.ttl_strategy = Some(TtlStrategy {
            seconds_after_completion: Some(30),
            ..TtlStrategy::default()
        });
        assert_eq!(expires_in(&workflow, now), Some(chrono::Duration::seconds(30)));

        workflow.spec.ttl_strategy = None;
        assert_eq!(expires_in(&workflow, now), None);
    }

    #[test]
    fn test_running_workflow_never_expires() {
        let mut workflow = running_workflow("wf");
        workflow.spec.ttl_strategy = Some(strategy());
        assert_eq!(expires_in(&workflow, Utc::now()), None);
    }

    #[tokio::test]
    async fn test_enqueue_adds_extra_second() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let controller = TtlController::new(store, EventPublisher::new(8), GcConfig::default());
        let now = Utc::now();

        let mut expired = completed_workflow("old", WorkflowPhase::Succeeded, now - chrono::Duration::hours(1));
        expired.spec.ttl_strategy = Some(strategy());
        assert_eq!(controller.enqueue(&expired, now), Some(Duration::from_secs(1)));

        let mut fresh = completed_workflow("new", WorkflowPhase::Succeeded, now);
        fresh.spec.ttl_strategy = Some(strategy());
        assert_eq!(controller.enqueue(&fresh, now), Some(Duration::from_secs(11)));
    }

    #[tokio::test]
    async fn test_delete_handles_missing_and_retried() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let publisher = EventPublisher::new(8);
        let mut received = publisher.subscribe();
        let controller = TtlController::new(store.clone(), publisher, GcConfig::default());

        let mut expired = completed_workflow("done", WorkflowPhase::Succeeded, Utc::now() - chrono::Duration::hours(1));
        expired.spec.ttl_strategy = Some(strategy());
        let done = store.create(expired).await.unwrap();
        let mut retried = running_workflow("retried");
        retried.spec.ttl_strategy = Some(strategy());
        store.create(retried).await.unwrap();

        assert!(controller.delete(&workflow_key(done.namespace(), "done")).await.unwrap());
        assert!(store.get("default", "done").await.unwrap().is_none());
        assert_eq!(received.recv().await.unwrap().name, events::GC_WORKFLOW_DELETED);

        assert!(!controller.delete("default/done").await.unwrap());
        assert!(!controller.delete("default/retried").await.unwrap());
        assert!(store.get("default", "retried").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_rechecks_ttl_on_dequeue() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let controller = TtlController::new(store.clone(), EventPublisher::new(8), GcConfig::default());

        // completed again after a retry; an older, earlier deadline may still be parked
        let mut fresh = completed_workflow("fresh", WorkflowPhase::Succeeded, Utc::now());
        fresh.spec.ttl_strategy = Some(TtlStrategy {
            seconds_after_completion: Some(3600),
            ..TtlStrategy::default()
        });
        store.create(fresh).await.unwrap();

        assert!(!controller.delete("default/fresh").await.unwrap());
        assert!(store.get("default", "fresh").await.unwrap().is_some());
        assert_eq!(controller.queue().waiting_len(), 1);
    }

    #[tokio::test]
    async fn test_delete_skips_workflow_without_ttl() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let controller = TtlController::new(store.clone(), EventPublisher::new(8), GcConfig::default());
        store
            .create(completed_workflow("kept", WorkflowPhase::Failed, Utc::now() - chrono::Duration::days(30)))
            .await
            .unwrap();

        assert!(!controller.delete("default/kept").await.unwrap());
        assert!(store.get("default", "kept").await.unwrap().is_some());
        assert!(controller.queue().is_empty());
        assert_eq!(controller.queue().waiting_len(), 0);
    }

    #[tokio::test]
    async fn test_ttl_delete_runs_on_deletion_artifact_gc() {
        let objects = Arc::new(InMemory::new());
        for key in ["wf/done.txt", "wf/keep.txt"] {
            objects
                .put(&ObjectPath::from(key), bytes::Bytes::from_static(b"data").into())
                .await
                .unwrap();
        }
        let driver: Arc<dyn ArtifactDriver> = Arc::new(BlobDriver::new(objects.clone(), "memory"));
        let store = Arc::new(InMemoryWorkflowStore::new());
        let artifact_gc = Arc::new(ArtifactGcController::new(
            store.clone(),
            Arc::new(RepositoryResolver::new(Arc::new(InMemoryConfigMaps::new()), "flowmill", None)),
            Arc::new(SingleDriverFactory(driver)),
            Arc::new(InMemoryOffloadRepo::new(Duration::from_secs(300))),
            EventPublisher::new(8),
            GcConfig::default(),
        ));
        let controller = TtlController::new(store.clone(), EventPublisher::new(8), GcConfig::default())
            .with_artifact_gc(artifact_gc.clone());

        let mut workflow = completed_workflow("wf", WorkflowPhase::Succeeded, Utc::now() - chrono::Duration::hours(1));
        workflow.spec.ttl_strategy = Some(strategy());
        let located = |key: &str, gc: ArtifactGcStrategy| {
            Artifact::new(
                key,
                ArtifactLocation::S3 {
                    bucket: "artifacts".into(),
                    key: key.into(),
                    endpoint: None,
                    region: None,
                },
            )
            .with_gc(gc)
        };
        with_outputs(
            &mut workflow,
            vec![
                located("wf/done.txt", ArtifactGcStrategy::OnCompletion),
                located("wf/keep.txt", ArtifactGcStrategy::OnDeletion),
            ],
        );
        assert!(ensure_artifact_gc_finalizer(&mut workflow));
        store.create(workflow).await.unwrap();

        let first = artifact_gc.process("default/wf").await.unwrap();
        assert!(!first.finalizer_removed);
        assert!(objects.head(&ObjectPath::from("wf/keep.txt")).await.is_ok());

        assert!(controller.delete("default/wf").await.unwrap());
        let pending = store.get("default", "wf").await.unwrap().unwrap();
        assert!(pending.metadata.deletion_timestamp.is_some());
        assert!(pending.metadata.has_finalizer(ARTIFACT_GC_FINALIZER));
        assert_eq!(artifact_gc.queue().len(), 1);

        let key = artifact_gc.queue().get().await.unwrap();
        let outcome = artifact_gc.process(&key).await.unwrap();
        artifact_gc.queue().done(&key);
        // the already collected OnCompletion artifact counts again
        assert_eq!(outcome.deleted, 2);
        assert!(outcome.finalizer_removed);
        assert!(objects.head(&ObjectPath::from("wf/keep.txt")).await.is_err());
        assert!(store.get("default", "wf").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_workers_delete_expired_workflows() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let controller = Arc::new(TtlController::new(
            store.clone(),
            EventPublisher::new(8),
            GcConfig::default(),
        ));
        let mut workflow = completed_workflow("wf", WorkflowPhase::Failed, Utc::now() - chrono::Duration::hours(2));
        workflow.spec.ttl_strategy = Some(strategy());
        store.create(workflow).await.unwrap();

        assert_eq!(controller.resync().await.unwrap(), 1);
        let shutdown = CancellationToken::new();
        let handles = controller.run(shutdown.clone());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !store.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(store.is_empty());
    }
}
