//! Retention GC: keeps at most N finished workflows per terminal phase,
//! deleting the oldest first.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::errors::GcResult;
use super::workflow_key;
use crate::constants::events;
use crate::events::publisher::EventPublisher;
use crate::logging::log_error;
use crate::objects::PropagationPolicy;
use crate::state_machine::WorkflowPhase;
use crate::workflow::{Workflow, WorkflowStore};

/// Maximum number of finished workflows kept per phase; `None` keeps all
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errored: Option<usize>,
}

impl RetentionPolicy {
    pub fn is_set(&self) -> bool {
        self.completed.is_some() || self.failed.is_some() || self.errored.is_some()
    }

    pub fn limit_for(&self, phase: WorkflowPhase) -> Option<usize> {
        match phase {
            WorkflowPhase::Succeeded => self.completed,
            WorkflowPhase::Failed => self.failed,
            WorkflowPhase::Error => self.errored,
            _ => None,
        }
    }

    /// `namespace/name` of every workflow over its phase's limit, oldest first
    pub fn select_for_deletion(&self, workflows: &[Workflow]) -> Vec<String> {
        let mut selected = Vec::new();
        for phase in [WorkflowPhase::Succeeded, WorkflowPhase::Failed, WorkflowPhase::Error] {
            let Some(limit) = self.limit_for(phase) else {
                continue;
            };
            let mut finished: Vec<&Workflow> = workflows
                .iter()
                .filter(|w| w.status.phase == phase)
                .collect();
            if finished.len() <= limit {
                continue;
            }
            finished.sort_by_key(|w| (w.status.finished_at, w.metadata.creation_timestamp));
            let excess = finished.len() - limit;
            selected.extend(
                finished
                    .into_iter()
                    .take(excess)
                    .map(|w| workflow_key(w.namespace(), w.name())),
            );
        }
        selected
    }
}

#[derive(Debug)]
pub struct RetentionGc {
    store: Arc<dyn WorkflowStore>,
    policy: RetentionPolicy,
    propagation: PropagationPolicy,
    publisher: EventPublisher,
}

impl RetentionGc {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        policy: RetentionPolicy,
        propagation: PropagationPolicy,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            store,
            policy,
            propagation,
            publisher,
        }
    }

    pub async fn run_once(&self) -> GcResult<usize> {
        if !self.policy.is_set() {
            return Ok(0);
        }
        let workflows = self.store.list("").await?;
        let mut deleted = 0;
        for key in self.policy.select_for_deletion(&workflows) {
            let Some((namespace, name)) = key.split_once('/') else {
                continue;
            };
            info!(workflow = %key, "Deleting workflow over retention limit");
            match self.store.delete(namespace, name, self.propagation).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            if let Err(e) = self
                .publisher
                .publish(
                    events::GC_WORKFLOW_DELETED,
                    json!({ "namespace": namespace, "name": name, "reason": "retention" }),
                )
                .await
            {
                debug!(error = %e, "Failed to publish retention delete event");
            }
        }
        Ok(deleted)
    }

    pub fn run(self, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            log_error("retention_gc", "run_once", &e.to_string(), None);
                        }
                    }
                }
            }
        })
    }
}
