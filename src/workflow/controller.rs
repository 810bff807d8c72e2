//! Workflow controller: a pool of workers draining a de-duplicating work
//! queue of workflow uids, plus the user operations that edit a workflow's
//! spec (suspend, resume, terminate, retry).

use chrono::Utc;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::errors::{RuntimeError, WorkflowError, WorkflowResult};
use super::operator::{ReconcileOutcome, WorkflowOperator};
use super::store::WorkflowStore;
use super::types::Workflow;
use crate::config::ControllerConfig;
use crate::constants::events;
use crate::error::ErrorKind;
use crate::gc::{ArtifactGcController, TtlController};
use crate::logging::{log_error, log_workflow_operation};
use crate::resilience::{retry_on, Backoff};
use crate::workqueue::WorkQueue;

/// Backoff for reconciles that failed or hit an admission quota
const RECONCILE_BACKOFF: Backoff = Backoff {
    duration: std::time::Duration::from_secs(1),
    factor: 2.0,
    jitter: 0.1,
    steps: 10,
    cap: std::time::Duration::from_secs(5 * 60),
};

#[derive(Debug)]
pub struct WorkflowController {
    store: Arc<dyn WorkflowStore>,
    operator: Arc<WorkflowOperator>,
    queue: Arc<WorkQueue<Uuid>>,
    failures: DashMap<Uuid, u32>,
    config: ControllerConfig,
    conflict_backoff: Backoff,
    ttl: Option<Arc<TtlController>>,
    artifact_gc: Option<Arc<ArtifactGcController>>,
}

impl WorkflowController {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        operator: Arc<WorkflowOperator>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            operator,
            queue: Arc::new(WorkQueue::new()),
            failures: DashMap::new(),
            config,
            conflict_backoff: Backoff::DEFAULT,
            ttl: None,
            artifact_gc: None,
        }
    }

    /// Hand completed workflows to the TTL and artifact collectors
    pub fn with_gc(mut self, ttl: Arc<TtlController>, artifact_gc: Arc<ArtifactGcController>) -> Self {
        self.ttl = Some(ttl);
        self.artifact_gc = Some(artifact_gc);
        self
    }

    pub fn with_conflict_backoff(mut self, backoff: Backoff) -> Self {
        self.conflict_backoff = backoff;
        self
    }

    pub fn queue(&self) -> &Arc<WorkQueue<Uuid>> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn enqueue(&self, uid: Uuid) {
        self.queue.add(uid);
    }

    /// Queue every workflow in the watched namespace
    pub async fn enqueue_all(&self) -> WorkflowResult<usize> {
        let namespace = self.config.namespace.clone().unwrap_or_default();
        let workflows = self.store.list(&namespace).await?;
        let mut queued = 0;
        for workflow in workflows.iter().filter(|w| !w.is_completed()) {
            self.queue.add(workflow.uid());
            queued += 1;
        }
        Ok(queued)
    }

    /// Load, operate and write back one workflow
    pub async fn reconcile(&self, uid: Uuid) -> WorkflowResult<ReconcileOutcome> {
        let mut workflow = self
            .store
            .get_by_uid(uid)
            .await?
            .ok_or(WorkflowError::NotFound { uid })?;
        let before = workflow.clone();
        let outcome = self.operator.operate(&mut workflow).await?;
        if workflow != before {
            self.store.update(&workflow).await?;
        }
        if workflow.is_completed() {
            if let Some(ttl) = &self.ttl {
                ttl.enqueue(&workflow, Utc::now());
            }
            if let Some(artifact_gc) = &self.artifact_gc {
                artifact_gc.enqueue(&workflow);
            }
        }
        Ok(outcome)
    }

    /// Reconcile `uid` and schedule what comes next
    pub async fn process(&self, uid: Uuid) {
        match self.reconcile(uid).await {
            Ok(outcome) if outcome.requeue => {
                if outcome.backoff {
                    let delay = RECONCILE_BACKOFF.delay_for(self.record_failure(uid));
                    self.queue.add_after(uid, delay);
                } else {
                    self.failures.remove(&uid);
                    self.queue.add_after(uid, self.config.requeue_interval());
                }
            }
            Ok(outcome) => {
                self.failures.remove(&uid);
                debug!(%uid, phase = %outcome.phase, "Workflow reconciled to completion");
            }
            Err(WorkflowError::NotFound { .. }) => {
                self.failures.remove(&uid);
            }
            Err(e) if e.kind().is_retryable() => {
                let attempt = self.record_failure(uid);
                let delay = RECONCILE_BACKOFF.delay_for(attempt);
                warn!(%uid, error = %e, attempt, delay_ms = delay.as_millis() as u64, "Reconcile failed, requeueing");
                self.queue.add_after(uid, delay);
            }
            Err(e) => {
                self.failures.remove(&uid);
                log_error("workflow_controller", "reconcile", &e.to_string(), Some(&uid.to_string()));
            }
        }
    }

    fn record_failure(&self, uid: Uuid) -> u32 {
        let mut count = self.failures.entry(uid).or_insert(0);
        let attempt = *count;
        *count = count.saturating_add(1);
        attempt
    }

    /// Start the worker pool. Workers stop when `shutdown` is cancelled.
    pub fn run(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let workers = self.config.workflow_workers.max(1);
        info!(workers, "🚀 Starting workflow workers");

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
                    let uid = tokio::select! {
                        _ = token.cancelled() => break,
                        uid = controller.queue.get() => match uid {
                            Some(uid) => uid,
                            None => break,
                        },
                    };
                    controller.process(uid).await;
                    controller.queue.done(&uid);
                }
                debug!(worker, "Workflow worker stopped");
            }));
        }
        handles
    }

    /// Read-modify-write a workflow, retrying on version conflicts
    async fn modify<F, Fut>(&self, namespace: &str, name: &str, change: F) -> WorkflowResult<Workflow>
    where
        F: Fn(Workflow) -> Fut,
        Fut: Future<Output = WorkflowResult<Workflow>>,
    {
        let change = &change;
        let updated = retry_on(
            &self.conflict_backoff,
            |e: &WorkflowError| e.kind() == ErrorKind::Transient,
            || async move {
                let current = self
                    .store
                    .get(namespace, name)
                    .await?
                    .ok_or_else(|| RuntimeError::NotFound {
                        kind: "workflow".to_string(),
                        name: format!("{namespace}/{name}"),
                    })?;
                let workflow = change(current).await?;
                Ok::<_, WorkflowError>(self.store.update(&workflow).await?)
            },
        )
        .await?;
        self.queue.add(updated.uid());
        Ok(updated)
    }

    pub async fn suspend(&self, namespace: &str, name: &str) -> WorkflowResult<Workflow> {
        let workflow = self
            .modify(namespace, name, |mut workflow| async move {
                reject_completed(&workflow)?;
                workflow.spec.suspend = true;
                Ok(workflow)
            })
            .await?;
        self.announce(events::WORKFLOW_SUSPENDED, "suspend", &workflow).await;
        Ok(workflow)
    }

    pub async fn resume(&self, namespace: &str, name: &str) -> WorkflowResult<Workflow> {
        let workflow = self
            .modify(namespace, name, |mut workflow| async move {
                reject_completed(&workflow)?;
                workflow.spec.suspend = false;
                Ok(workflow)
            })
            .await?;
        self.announce(events::WORKFLOW_RESUMED, "resume", &workflow).await;
        Ok(workflow)
    }

    pub async fn terminate(&self, namespace: &str, name: &str) -> WorkflowResult<Workflow> {
        let workflow = self
            .modify(namespace, name, |mut workflow| async move {
                reject_completed(&workflow)?;
                workflow.spec.terminate = true;
                Ok(workflow)
            })
            .await?;
        self.announce(events::WORKFLOW_TERMINATED, "terminate", &workflow).await;
        Ok(workflow)
    }

    /// Retry a completed workflow; see [`WorkflowOperator::retry`]
    pub async fn retry(&self, namespace: &str, name: &str) -> WorkflowResult<Workflow> {
        let operator = &self.operator;
        self.modify(namespace, name, |mut workflow| async move {
            operator.retry(&mut workflow).await?;
            Ok(workflow)
        })
        .await
    }

    async fn announce(&self, event: &str, operation: &str, workflow: &Workflow) {
        log_workflow_operation(
            operation,
            Some(&workflow.uid().to_string()),
            Some(workflow.name()),
            Some(workflow.namespace()),
            &workflow.status.phase.to_string(),
            None,
        );
        let context = serde_json::json!({
            "workflow_uid": workflow.uid(),
            "workflow_name": workflow.name(),
            "namespace": workflow.namespace(),
        });
        if let Err(e) = self.operator.publisher().publish(event, context).await {
            warn!(event, error = %e, "Failed to publish workflow event");
        }
    }
}

fn reject_completed(workflow: &Workflow) -> WorkflowResult<()> {
    if workflow.is_completed() {
        return Err(WorkflowError::AlreadyCompleted {
            uid: workflow.uid(),
        });
    }
    Ok(())
}
