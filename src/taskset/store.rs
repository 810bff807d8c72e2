use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use super::{TaskSet, TaskSetError, TaskSetResult};

/// Object store holding task sets, keyed by (namespace, name)
#[async_trait]
pub trait TaskSetStore: Send + Sync + fmt::Debug {
    async fn get(&self, namespace: &str, name: &str) -> TaskSetResult<Option<TaskSet>>;

    async fn list(&self, namespace: &str) -> TaskSetResult<Vec<TaskSet>>;

    /// Fails with `AlreadyExists` when a task set of that name exists
    async fn create(&self, task_set: TaskSet) -> TaskSetResult<TaskSet>;

    /// Fails with `Conflict` when `resource_version` is stale
    async fn update(&self, task_set: &TaskSet) -> TaskSetResult<TaskSet>;

    async fn delete(&self, namespace: &str, name: &str) -> TaskSetResult<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryTaskSetStore {
    task_sets: DashMap<(String, String), TaskSet>,
    conflicts_to_inject: AtomicU32,
}

impl InMemoryTaskSetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` updates with a conflict
    pub fn fail_next_updates(&self, count: u32) {
        self.conflicts_to_inject.store(count, Ordering::SeqCst);
    }

    fn key(namespace: &str, name: &str) -> (String, String) {
        (namespace.to_string(), name.to_string())
    }
}

#[async_trait]
impl TaskSetStore for InMemoryTaskSetStore {
    async fn get(&self, namespace: &str, name: &str) -> TaskSetResult<Option<TaskSet>> {
        Ok(self
            .task_sets
            .get(&Self::key(namespace, name))
            .map(|entry| entry.value().clone()))
    }

    async fn list(&self, namespace: &str) -> TaskSetResult<Vec<TaskSet>> {
        let mut task_sets: Vec<TaskSet> = self
            .task_sets
            .iter()
            .filter(|entry| namespace.is_empty() || entry.key().0 == namespace)
            .map(|entry| entry.value().clone())
            .collect();
        task_sets.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(task_sets)
    }

    async fn create(&self, mut task_set: TaskSet) -> TaskSetResult<TaskSet> {
        let key = Self::key(&task_set.metadata.namespace, &task_set.metadata.name);
        match self.task_sets.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(TaskSetError::AlreadyExists {
                name: task_set.metadata.name.clone(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                task_set.metadata.resource_version = 1;
                slot.insert(task_set.clone());
                Ok(task_set)
            }
        }
    }

    async fn update(&self, task_set: &TaskSet) -> TaskSetResult<TaskSet> {
        let name = task_set.metadata.name.clone();
        let injected = self
            .conflicts_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TaskSetError::Conflict {
                name,
                message: "injected conflict".to_string(),
            });
        }

        let mut entry = self
            .task_sets
            .get_mut(&Self::key(&task_set.metadata.namespace, &name))
            .ok_or_else(|| TaskSetError::NotFound {
                namespace: task_set.metadata.namespace.clone(),
                name: name.clone(),
            })?;
        if entry.metadata.resource_version != task_set.metadata.resource_version {
            return Err(TaskSetError::Conflict {
                name,
                message: format!(
                    "resource version {} is stale",
                    task_set.metadata.resource_version
                ),
            });
        }
        let mut updated = task_set.clone();
        updated.metadata.resource_version += 1;
        *entry = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> TaskSetResult<()> {
        self.task_sets
            .remove(&Self::key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| TaskSetError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }
}
