//! In-memory offload store and archive for single-process use and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use super::errors::{PersistenceError, PersistenceResult};
use super::{node_status_version, ArchivedWorkflow, OffloadKey, OffloadNodeStatusRepo, WorkflowArchive};
use crate::workflow::Nodes;

#[derive(Debug, Clone)]
struct OffloadRecord {
    namespace: String,
    nodes: Nodes,
    updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct InMemoryOffloadRepo {
    records: RwLock<BTreeMap<OffloadKey, OffloadRecord>>,
    offload_ttl: Duration,
}

impl Default for InMemoryOffloadRepo {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

fn older_than(ttl: Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero())
}

impl InMemoryOffloadRepo {
    pub fn new(offload_ttl: Duration) -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            offload_ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl OffloadNodeStatusRepo for InMemoryOffloadRepo {
    async fn save(&self, uid: Uuid, namespace: &str, nodes: &Nodes) -> PersistenceResult<String> {
        let version = node_status_version(nodes)?;
        let cutoff = older_than(self.offload_ttl);
        let mut records = self.records.write();
        records.insert(
            OffloadKey::new(uid, version.clone()),
            OffloadRecord {
                namespace: namespace.to_string(),
                nodes: nodes.clone(),
                updated_at: Utc::now(),
            },
        );
        records.retain(|key, record| {
            key.uid != uid || key.version == version || record.updated_at >= cutoff
        });
        Ok(version)
    }

    async fn get(&self, uid: Uuid, version: &str) -> PersistenceResult<Nodes> {
        self.records
            .read()
            .get(&OffloadKey::new(uid, version))
            .map(|record| record.nodes.clone())
            .ok_or_else(|| PersistenceError::NotFound {
                uid,
                version: version.to_string(),
            })
    }

    async fn list(&self, namespace: &str) -> PersistenceResult<BTreeMap<OffloadKey, Nodes>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|(_, record)| namespace.is_empty() || record.namespace == namespace)
            .map(|(key, record)| (key.clone(), record.nodes.clone()))
            .collect())
    }

    async fn list_old_offloads(&self, namespace: &str) -> PersistenceResult<Vec<OffloadKey>> {
        let cutoff = older_than(self.offload_ttl);
        Ok(self
            .records
            .read()
            .iter()
            .filter(|(_, record)| namespace.is_empty() || record.namespace == namespace)
            .filter(|(_, record)| record.updated_at < cutoff)
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn delete(&self, uid: Uuid, version: &str) -> PersistenceResult<()> {
        self.records.write().remove(&OffloadKey::new(uid, version));
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
pub struct InMemoryWorkflowArchive {
    rows: RwLock<BTreeMap<Uuid, ArchivedWorkflow>>,
}

#[async_trait]
impl WorkflowArchive for InMemoryWorkflowArchive {
    async fn archive(&self, workflow: &ArchivedWorkflow) -> PersistenceResult<()> {
        self.rows.write().insert(workflow.uid, workflow.clone());
        Ok(())
    }

    async fn list(
        &self,
        namespace: &str,
        limit: usize,
        offset: usize,
    ) -> PersistenceResult<Vec<ArchivedWorkflow>> {
        let mut rows: Vec<ArchivedWorkflow> = self
            .rows
            .read()
            .values()
            .filter(|row| namespace.is_empty() || row.namespace == namespace)
            .cloned()
            .collect();
        // newest first, rows without a start time last
        rows.sort_by(|a, b| {
            b.started_at
                .is_some()
                .cmp(&a.started_at.is_some())
                .then_with(|| b.started_at.cmp(&a.started_at))
                .then_with(|| a.uid.cmp(&b.uid))
        });
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn get(&self, uid: Uuid) -> PersistenceResult<Option<ArchivedWorkflow>> {
        Ok(self.rows.read().get(&uid).cloned())
    }

    async fn delete(&self, uid: Uuid) -> PersistenceResult<()> {
        self.rows.write().remove(&uid);
        Ok(())
    }

    async fn delete_expired(&self, ttl: Duration) -> PersistenceResult<u64> {
        let cutoff = older_than(ttl);
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|_, row| row.finished_at.map(|at| at >= cutoff).unwrap_or(true));
        Ok((before - rows.len()) as u64)
    }
}
