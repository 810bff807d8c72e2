//! Workflow object store seam.
//!
//! Updates carry the `resource_version` they were read at; a stale version is
//! rejected with [`RuntimeError::Conflict`] and the caller re-reads.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::errors::RuntimeError;
use super::types::Workflow;
use crate::objects::{apply_merge_patch, PropagationPolicy};

#[async_trait]
pub trait WorkflowStore: Send + Sync + fmt::Debug {
    async fn get_by_uid(&self, uid: Uuid) -> Result<Option<Workflow>, RuntimeError>;

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Workflow>, RuntimeError>;

    /// Workflows of a namespace; an empty namespace lists all of them
    async fn list(&self, namespace: &str) -> Result<Vec<Workflow>, RuntimeError>;

    /// Insert a new workflow, assigning a uid when it has none
    async fn create(&self, workflow: Workflow) -> Result<Workflow, RuntimeError>;

    /// Replace a workflow. Fails with `Conflict` when the stored
    /// `resource_version` differs from the one in `workflow`.
    async fn update(&self, workflow: &Workflow) -> Result<Workflow, RuntimeError>;

    /// Apply a JSON merge patch without a version check
    async fn patch(&self, namespace: &str, name: &str, patch: &Value)
        -> Result<Workflow, RuntimeError>;

    /// Delete a workflow. One that still carries finalizers only gets its
    /// `deletion_timestamp` set and is removed once the last finalizer is
    /// patched away. A missing workflow yields `NotFound`.
    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        propagation: PropagationPolicy,
    ) -> Result<(), RuntimeError>;
}

#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    workflows: DashMap<Uuid, Workflow>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a workflow that is being deleted and has no finalizers left
    fn remove_if_finalized(&self, workflow: &Workflow) {
        if workflow.metadata.deletion_timestamp.is_some() && workflow.metadata.finalizers.is_empty()
        {
            self.workflows.remove(&workflow.uid());
        }
    }

    fn find(&self, namespace: &str, name: &str) -> Option<Uuid> {
        self.workflows
            .iter()
            .find(|entry| entry.metadata.namespace == namespace && entry.metadata.name == name)
            .map(|entry| *entry.key())
    }

    fn not_found(name: &str) -> RuntimeError {
        RuntimeError::NotFound {
            kind: "workflow".to_string(),
            name: name.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn get_by_uid(&self, uid: Uuid) -> Result<Option<Workflow>, RuntimeError> {
        Ok(self.workflows.get(&uid).map(|entry| entry.value().clone()))
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Workflow>, RuntimeError> {
        Ok(self
            .find(namespace, name)
            .and_then(|uid| self.workflows.get(&uid).map(|entry| entry.value().clone())))
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Workflow>, RuntimeError> {
        let mut workflows: Vec<Workflow> = self
            .workflows
            .iter()
            .filter(|entry| namespace.is_empty() || entry.metadata.namespace == namespace)
            .map(|entry| entry.value().clone())
            .collect();
        workflows.sort_by(|a, b| {
            (a.namespace(), a.name()).cmp(&(b.namespace(), b.name()))
        });
        Ok(workflows)
    }

    async fn create(&self, mut workflow: Workflow) -> Result<Workflow, RuntimeError> {
        if self.find(workflow.namespace(), workflow.name()).is_some() {
            return Err(RuntimeError::Conflict {
                name: workflow.name().to_string(),
                message: "already exists".to_string(),
            });
        }
        if workflow.metadata.uid.is_nil() {
            workflow.metadata.uid = Uuid::new_v4();
        }
        if workflow.metadata.creation_timestamp.is_none() {
            workflow.metadata.creation_timestamp = Some(chrono::Utc::now());
        }
        workflow.metadata.resource_version = 1;
        workflow.metadata.generation = workflow.metadata.generation.max(1);
        self.workflows.insert(workflow.uid(), workflow.clone());
        Ok(workflow)
    }

    async fn update(&self, workflow: &Workflow) -> Result<Workflow, RuntimeError> {
        let mut entry = self
            .workflows
            .get_mut(&workflow.uid())
            .ok_or_else(|| Self::not_found(workflow.name()))?;
        if entry.metadata.resource_version != workflow.metadata.resource_version {
            return Err(RuntimeError::Conflict {
                name: workflow.name().to_string(),
                message: format!(
                    "resource version {} is stale, current is {}",
                    workflow.metadata.resource_version, entry.metadata.resource_version
                ),
            });
        }
        let mut updated = workflow.clone();
        updated.metadata.resource_version += 1;
        *entry = updated.clone();
        drop(entry);
        self.remove_if_finalized(&updated);
        Ok(updated)
    }

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Workflow, RuntimeError> {
        let uid = self.find(namespace, name).ok_or_else(|| Self::not_found(name))?;
        let mut entry = self
            .workflows
            .get_mut(&uid)
            .ok_or_else(|| Self::not_found(name))?;
        let mut document = serde_json::to_value(&*entry).map_err(|e| RuntimeError::Rejected {
            status: 422,
            message: e.to_string(),
        })?;
        apply_merge_patch(&mut document, patch);
        let mut patched: Workflow =
            serde_json::from_value(document).map_err(|e| RuntimeError::Rejected {
                status: 422,
                message: e.to_string(),
            })?;
        patched.metadata.resource_version = entry.metadata.resource_version + 1;
        *entry = patched.clone();
        drop(entry);
        self.remove_if_finalized(&patched);
        Ok(patched)
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        _propagation: PropagationPolicy,
    ) -> Result<(), RuntimeError> {
        let uid = self.find(namespace, name).ok_or_else(|| Self::not_found(name))?;
        let mut entry = self
            .workflows
            .get_mut(&uid)
            .ok_or_else(|| Self::not_found(name))?;
        if entry.metadata.finalizers.is_empty() {
            drop(entry);
            self.workflows.remove(&uid);
            return Ok(());
        }
        if entry.metadata.deletion_timestamp.is_none() {
            entry.metadata.deletion_timestamp = Some(chrono::Utc::now());
            entry.metadata.resource_version += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::ObjectMeta;
    use crate::template::{BaseTemplate, ContainerTemplate, EmbeddedTemplate, TemplateType};
    use crate::workflow::types::WorkflowSpec;
    use serde_json::json;

    fn workflow(name: &str) -> Workflow {
        let container = ContainerTemplate {
            base: BaseTemplate::new(TemplateType::Container, "main"),
            image: "alpine:3.20".into(),
            ..ContainerTemplate::default()
        };
        Workflow::new(
            ObjectMeta::named("default", name),
            WorkflowSpec::new(EmbeddedTemplate::Container(container)),
        )
    }

    #[tokio::test]
    async fn test_update_rejects_stale_version() {
        let store = InMemoryWorkflowStore::new();
        let created = store.create(workflow("wf")).await.unwrap();
        assert!(!created.uid().is_nil());

        let mut first = created.clone();
        first.spec.suspend = true;
        store.update(&first).await.unwrap();

        let mut stale = created;
        stale.spec.terminate = true;
        let err = store.update(&stale).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_patch_and_delete() {
        let store = InMemoryWorkflowStore::new();
        store.create(workflow("wf")).await.unwrap();
        let patched = store
            .patch("default", "wf", &json!({"metadata": {"labels": {"team": "data"}}}))
            .await
            .unwrap();
        assert_eq!(patched.metadata.labels["team"], "data");
        assert_eq!(patched.metadata.resource_version, 2);

        store
            .delete("default", "wf", PropagationPolicy::Background)
            .await
            .unwrap();
        let err = store
            .delete("default", "wf", PropagationPolicy::Background)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let store = InMemoryWorkflowStore::new();
        store.create(workflow("wf")).await.unwrap();
        store
            .patch("default", "wf", &json!({"metadata": {"finalizers": ["keep"]}}))
            .await
            .unwrap();

        store
            .delete("default", "wf", PropagationPolicy::Background)
            .await
            .unwrap();
        let pending = store.get("default", "wf").await.unwrap().unwrap();
        let marked_at = pending.metadata.deletion_timestamp;
        assert!(marked_at.is_some());

        // a repeated delete keeps the first timestamp
        store
            .delete("default", "wf", PropagationPolicy::Background)
            .await
            .unwrap();
        let again = store.get("default", "wf").await.unwrap().unwrap();
        assert_eq!(again.metadata.deletion_timestamp, marked_at);
        assert_eq!(again.metadata.resource_version, pending.metadata.resource_version);

        store
            .patch("default", "wf", &json!({"metadata": {"finalizers": []}}))
            .await
            .unwrap();
        assert!(store.get("default", "wf").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_update_stripping_last_finalizer_removes() {
        let store = InMemoryWorkflowStore::new();
        let mut created = store.create(workflow("wf")).await.unwrap();
        created.metadata.finalizers.push("keep".into());
        store.update(&created).await.unwrap();
        store
            .delete("default", "wf", PropagationPolicy::Foreground)
            .await
            .unwrap();

        let mut pending = store.get("default", "wf").await.unwrap().unwrap();
        pending.metadata.finalizers.clear();
        store.update(&pending).await.unwrap();
        assert!(store.is_empty());
    }
}
