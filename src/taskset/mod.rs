//! # Task Sets
//!
//! Agent-executed workflow steps (HTTP calls, plugin invocations) run outside
//! of pods. The controller records them in one [`TaskSet`] per workflow; an
//! agent executes the tasks and writes results back into the task set status,
//! where the next reconcile picks them up.
//!
//! Every store update is retried on conflict with [`Backoff::DEFAULT`].

pub mod agent;
pub mod store;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::error::ErrorKind;
use crate::objects::{ObjectMeta, OwnerReference};
use crate::resilience::{retry_on, Backoff};
use crate::state_machine::NodePhase;
use crate::template::{AgentExecutor, Arguments};
use crate::workflow::NodeIo;

pub use agent::TaskAgent;
pub use store::{InMemoryTaskSetStore, TaskSetStore};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskSetError {
    #[error("task set {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error("task set {name} already exists")]
    AlreadyExists { name: String },

    #[error("conflict updating task set {name}: {message}")]
    Conflict { name: String, message: String },

    #[error("task set store unavailable: {message}")]
    Transient { message: String },

    #[error("task {node_id} cannot be executed: {message}")]
    Unsupported { node_id: String, message: String },
}

impl TaskSetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } | Self::Conflict { .. } | Self::Transient { .. } => {
                ErrorKind::Transient
            }
            Self::Unsupported { .. } => ErrorKind::Validation,
        }
    }

    fn is_retriable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

pub type TaskSetResult<T> = Result<T, TaskSetError>;

/// What an agent runs for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTask {
    /// Display name of the node
    pub name: String,
    pub executor: AgentExecutor,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub arguments: Arguments,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEntry {
    pub node_id: String,
    pub task: AgentTask,
}

/// Result an agent reports for a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub phase: NodePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<NodeIo>,
}

impl TaskResult {
    pub fn succeeded(outputs: Option<NodeIo>) -> Self {
        Self {
            phase: NodePhase::Succeeded,
            message: None,
            outputs,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            phase: NodePhase::Failed,
            message: Some(message.into()),
            outputs: None,
        }
    }

    pub fn errored(message: impl Into<String>) -> Self {
        Self {
            phase: NodePhase::Error,
            message: Some(message.into()),
            outputs: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSetSpec {
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSetStatus {
    /// Node id to the result reported by the agent
    #[serde(default)]
    pub nodes: BTreeMap<String, TaskResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSet {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: TaskSetSpec,
    #[serde(default)]
    pub status: TaskSetStatus,
}

impl TaskSet {
    pub fn contains(&self, node_id: &str) -> bool {
        self.spec.tasks.iter().any(|entry| entry.node_id == node_id)
    }

    /// Tasks without a reported result
    pub fn pending(&self) -> impl Iterator<Item = &TaskEntry> {
        self.spec
            .tasks
            .iter()
            .filter(|entry| !self.status.nodes.contains_key(&entry.node_id))
    }
}

/// Workflow identity a task set belongs to
#[derive(Debug, Clone, Copy)]
pub struct TaskOwner<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    pub uid: uuid::Uuid,
}

impl TaskOwner<'_> {
    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: "flowmill.io/v1".to_string(),
            kind: "Workflow".to_string(),
            name: self.name.to_string(),
            uid: self.uid,
            controller: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskSetManager {
    store: Arc<dyn TaskSetStore>,
    backoff: Backoff,
}

impl TaskSetManager {
    pub fn new(store: Arc<dyn TaskSetStore>) -> Self {
        Self {
            store,
            backoff: Backoff::DEFAULT,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskSetStore> {
        &self.store
    }

    /// Add a task for `node_id`. Creates the workflow's task set on first use;
    /// a node already present is left untouched.
    pub async fn schedule(
        &self,
        owner: TaskOwner<'_>,
        node_id: &str,
        task: &AgentTask,
    ) -> TaskSetResult<()> {
        let store = &self.store;
        retry_on(&self.backoff, TaskSetError::is_retriable, || async move {
            match store.get(owner.namespace, owner.name).await? {
                None => {
                    let mut metadata = ObjectMeta::named(owner.namespace, owner.name);
                    metadata.owner_references.push(owner.owner_reference());
                    let task_set = TaskSet {
                        metadata,
                        spec: TaskSetSpec {
                            tasks: vec![TaskEntry {
                                node_id: node_id.to_string(),
                                task: task.clone(),
                            }],
                        },
                        status: TaskSetStatus::default(),
                    };
                    store.create(task_set).await?;
                    debug!(workflow = %owner.name, node_id = %node_id, "🧾 Created task set");
                    Ok(())
                }
                Some(task_set) if task_set.contains(node_id) => Ok(()),
                Some(mut task_set) => {
                    task_set.spec.tasks.push(TaskEntry {
                        node_id: node_id.to_string(),
                        task: task.clone(),
                    });
                    store.update(&task_set).await?;
                    debug!(workflow = %owner.name, node_id = %node_id, "🧾 Appended task");
                    Ok(())
                }
            }
        })
        .await
    }

    /// Result reported for `node_id`, if any
    pub async fn result(
        &self,
        namespace: &str,
        name: &str,
        node_id: &str,
    ) -> TaskSetResult<Option<TaskResult>> {
        Ok(self
            .store
            .get(namespace, name)
            .await?
            .and_then(|task_set| task_set.status.nodes.get(node_id).cloned()))
    }

    /// Record a result reported by an agent
    pub async fn record_result(
        &self,
        namespace: &str,
        name: &str,
        node_id: &str,
        result: &TaskResult,
    ) -> TaskSetResult<()> {
        let store = &self.store;
        retry_on(&self.backoff, TaskSetError::is_retriable, || async move {
            let mut task_set =
                store
                    .get(namespace, name)
                    .await?
                    .ok_or_else(|| TaskSetError::NotFound {
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                    })?;
            task_set
                .status
                .nodes
                .insert(node_id.to_string(), result.clone());
            store.update(&task_set).await.map(|_| ())
        })
        .await
    }
}
