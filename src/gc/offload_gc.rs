//! Periodic removal of offloaded node-status maps that no live workflow points at.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::errors::GcResult;
use crate::constants::events;
use crate::events::publisher::EventPublisher;
use crate::logging::{log_error, log_persistence_operation};
use crate::persistence::OffloadNodeStatusRepo;
use crate::workflow::WorkflowStore;

#[derive(Debug)]
pub struct OffloadGc {
    store: Arc<dyn WorkflowStore>,
    offloads: Arc<dyn OffloadNodeStatusRepo>,
    publisher: EventPublisher,
    /// Namespace to sweep; empty sweeps every namespace
    namespace: String,
}

impl OffloadGc {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        offloads: Arc<dyn OffloadNodeStatusRepo>,
        publisher: EventPublisher,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            offloads,
            publisher,
            namespace: namespace.into(),
        }
    }

    /// Delete every old offload whose workflow is gone or has moved to
    /// another version. Returns how many were deleted.
    pub async fn run_once(&self) -> GcResult<usize> {
        if !self.offloads.is_enabled() {
            return Ok(0);
        }
        let old = self.offloads.list_old_offloads(&self.namespace).await?;
        debug!(candidates = old.len(), "Sweeping old offloads");

        let mut deleted = 0;
        for key in old {
            let live = self
                .store
                .get_by_uid(key.uid)
                .await?
                .and_then(|workflow| workflow.status.offload_node_status_version);
            if live.as_deref() == Some(key.version.as_str()) {
                continue;
            }
            self.offloads.delete(key.uid, &key.version).await?;
            let uid = key.uid.to_string();
            log_persistence_operation("offload_gc", "offload", Some(&uid), "deleted", None);
            deleted += 1;
        }

        if deleted > 0 {
            info!(deleted, "🧹 Deleted offloads that are not live");
            if let Err(e) = self
                .publisher
                .publish(events::GC_OFFLOAD_DELETED, json!({ "deleted": deleted }))
                .await
            {
                debug!(error = %e, "Failed to publish offload GC event");
            }
        }
        Ok(deleted)
    }

    pub fn run(self, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            log_error("offload_gc", "run_once", &e.to_string(), None);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::test_support::running_workflow;
    use crate::persistence::InMemoryOffloadRepo;
    use crate::workflow::{InMemoryWorkflowStore, NodeStatus, Nodes};
    use crate::state_machine::NodePhase;
    use uuid::Uuid;

    fn nodes(name: &str) -> Nodes {
        let mut nodes = Nodes::new();
        nodes.insert(name.to_string(), NodeStatus::new(name, name, "main", NodePhase::Succeeded));
        nodes
    }

    #[tokio::test]
    async fn test_only_unreferenced_offloads_are_deleted() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let offloads = Arc::new(InMemoryOffloadRepo::new(Duration::ZERO));

        let live = store.create(running_workflow("live")).await.unwrap();
        let live_version = offloads.save(live.uid(), "default", &nodes("a")).await.unwrap();
        let mut referenced = live.clone();
        referenced.status.offload_node_status_version = Some(live_version.clone());
        store.update(&referenced).await.unwrap();

        let inline = store.create(running_workflow("inline")).await.unwrap();
        offloads.save(inline.uid(), "default", &nodes("b")).await.unwrap();

        let orphan = Uuid::new_v4();
        offloads.save(orphan, "default", &nodes("c")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let gc = OffloadGc::new(store, offloads.clone(), EventPublisher::new(8), "");
        assert_eq!(gc.run_once().await.unwrap(), 2);
        assert_eq!(offloads.len(), 1);
        assert!(offloads.get(live.uid(), &live_version).await.is_ok());
    }
}
