//! MySQL offload store and workflow archive.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::MySqlPool;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use super::errors::{PersistenceError, PersistenceResult};
use super::rows::{cutoff, parse_uid, HistoryRow, OffloadRow};
use super::{
    node_status_version, with_retry, ArchivedWorkflow, OffloadKey, OffloadNodeStatusRepo,
    SqlSettings, WorkflowArchive,
};
use crate::workflow::Nodes;

const BACKEND: &str = "mysql";

#[derive(Debug, Clone)]
pub struct MySqlOffloadRepo {
    pool: MySqlPool,
    settings: SqlSettings,
}

impl MySqlOffloadRepo {
    pub fn new(pool: MySqlPool, settings: SqlSettings) -> Self {
        Self { pool, settings }
    }
}

#[async_trait]
impl OffloadNodeStatusRepo for MySqlOffloadRepo {
    async fn save(&self, uid: Uuid, namespace: &str, nodes: &Nodes) -> PersistenceResult<String> {
        let version = node_status_version(nodes)?;
        let encoded = serde_json::to_string(nodes)?;
        let uid_key = uid.to_string();
        let (uid_text, version_text, nodes_json) =
            (uid_key.as_str(), version.as_str(), encoded.as_str());
        let old_cutoff = cutoff(self.settings.offload_ttl);

        with_retry(
            BACKEND,
            "offload.save",
            &self.settings.write,
            self.settings.query_timeout,
            || async move {
                sqlx::query(
                    r#"
                    INSERT INTO workflow_offloads (uid, version, namespace, nodes_json, updatedat)
                    VALUES (?, ?, ?, ?, ?)
                    ON DUPLICATE KEY UPDATE updatedat = VALUES(updatedat)
                    "#,
                )
                .bind(uid_text)
                .bind(version_text)
                .bind(namespace)
                .bind(nodes_json)
                .bind(Utc::now())
                .execute(&self.pool)
                .await
                .map_err(|e| PersistenceError::from_sqlx("offload.save", e))?;

                // superseded versions of this workflow past the TTL
                sqlx::query(
                    "DELETE FROM workflow_offloads WHERE uid = ? AND version <> ? AND updatedat < ?",
                )
                .bind(uid_text)
                .bind(version_text)
                .bind(old_cutoff)
                .execute(&self.pool)
                .await
                .map_err(|e| PersistenceError::from_sqlx("offload.save", e))?;
                Ok(())
            },
        )
        .await?;
        Ok(version)
    }

    async fn get(&self, uid: Uuid, version: &str) -> PersistenceResult<Nodes> {
        let uid_key = uid.to_string();
        let uid_text = uid_key.as_str();
        let row = with_retry(
            BACKEND,
            "offload.get",
            &self.settings.read,
            self.settings.query_timeout,
            || async move {
                sqlx::query_as::<_, OffloadRow>(
                    "SELECT uid, version, nodes_json FROM workflow_offloads WHERE uid = ? AND version = ?",
                )
                .bind(uid_text)
                .bind(version)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| PersistenceError::from_sqlx("offload.get", e))
            },
        )
        .await?
        .ok_or_else(|| PersistenceError::NotFound {
            uid,
            version: version.to_string(),
        })?;
        row.into_entry().map(|(_, nodes)| nodes)
    }

    async fn list(&self, namespace: &str) -> PersistenceResult<BTreeMap<OffloadKey, Nodes>> {
        let rows = with_retry(
            BACKEND,
            "offload.list",
            &self.settings.read,
            self.settings.query_timeout,
            || async move {
                sqlx::query_as::<_, OffloadRow>(
                    "SELECT uid, version, nodes_json FROM workflow_offloads WHERE (? = '' OR namespace = ?)",
                )
                .bind(namespace)
                .bind(namespace)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| PersistenceError::from_sqlx("offload.list", e))
            },
        )
        .await?;
        rows.into_iter().map(OffloadRow::into_entry).collect()
    }

    async fn list_old_offloads(&self, namespace: &str) -> PersistenceResult<Vec<OffloadKey>> {
        let old_cutoff = cutoff(self.settings.offload_ttl);
        let rows: Vec<(String, String)> = with_retry(
            BACKEND,
            "offload.list_old",
            &self.settings.read,
            self.settings.query_timeout,
            || async move {
                sqlx::query_as::<_, (String, String)>(
                    r#"
                    SELECT uid, version FROM workflow_offloads
                    WHERE (? = '' OR namespace = ?) AND updatedat < ?
                    ORDER BY uid, version
                    "#,
                )
                .bind(namespace)
                .bind(namespace)
                .bind(old_cutoff)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| PersistenceError::from_sqlx("offload.list_old", e))
            },
        )
        .await?;
        rows.into_iter()
            .map(|(uid, version)| Ok(OffloadKey::new(parse_uid(&uid)?, version)))
            .collect()
    }

    async fn delete(&self, uid: Uuid, version: &str) -> PersistenceResult<()> {
        let uid_key = uid.to_string();
        let uid_text = uid_key.as_str();
        with_retry(
            BACKEND,
            "offload.delete",
            &self.settings.write,
            self.settings.query_timeout,
            || async move {
                sqlx::query("DELETE FROM workflow_offloads WHERE uid = ? AND version = ?")
                    .bind(uid_text)
                    .bind(version)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| PersistenceError::from_sqlx("offload.delete", e))?;
                Ok(())
            },
        )
        .await
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct MySqlWorkflowArchive {
    pool: MySqlPool,
    settings: SqlSettings,
}

impl MySqlWorkflowArchive {
    pub fn new(pool: MySqlPool, settings: SqlSettings) -> Self {
        Self { pool, settings }
    }
}

#[async_trait]
impl WorkflowArchive for MySqlWorkflowArchive {
    async fn archive(&self, workflow: &ArchivedWorkflow) -> PersistenceResult<()> {
        let uid_key = workflow.uid.to_string();
        let encoded = serde_json::to_string(&workflow.workflow)?;
        let (uid_text, workflow_json) = (uid_key.as_str(), encoded.as_str());

        with_retry(
            BACKEND,
            "archive.save",
            &self.settings.write,
            self.settings.query_timeout,
            || async move {
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(|e| PersistenceError::from_sqlx("archive.save", e))?;
                sqlx::query("DELETE FROM workflow_history WHERE uid = ?")
                    .bind(uid_text)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| PersistenceError::from_sqlx("archive.save", e))?;
                sqlx::query(
                    r#"
                    INSERT INTO workflow_history
                        (uid, name, namespace, phase, startedat, finishedat, workflow_json)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(uid_text)
                .bind(&workflow.name)
                .bind(&workflow.namespace)
                .bind(&workflow.phase)
                .bind(workflow.started_at)
                .bind(workflow.finished_at)
                .bind(workflow_json)
                .execute(&mut *tx)
                .await
                .map_err(|e| PersistenceError::from_sqlx("archive.save", e))?;
                tx.commit()
                    .await
                    .map_err(|e| PersistenceError::from_sqlx("archive.save", e))
            },
        )
        .await
    }

    async fn list(
        &self,
        namespace: &str,
        limit: usize,
        offset: usize,
    ) -> PersistenceResult<Vec<ArchivedWorkflow>> {
        let rows = with_retry(
            BACKEND,
            "archive.list",
            &self.settings.read,
            self.settings.query_timeout,
            || async move {
                sqlx::query_as::<_, HistoryRow>(
                    r#"
                    SELECT uid, name, namespace, phase, startedat, finishedat, workflow_json
                    FROM workflow_history
                    WHERE (? = '' OR namespace = ?)
                    ORDER BY startedat IS NULL, startedat DESC, uid
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(namespace)
                .bind(namespace)
                .bind(limit as u64)
                .bind(offset as u64)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| PersistenceError::from_sqlx("archive.list", e))
            },
        )
        .await?;
        rows.into_iter().map(HistoryRow::into_archived).collect()
    }

    async fn get(&self, uid: Uuid) -> PersistenceResult<Option<ArchivedWorkflow>> {
        let uid_key = uid.to_string();
        let uid_text = uid_key.as_str();
        let row = with_retry(
            BACKEND,
            "archive.get",
            &self.settings.read,
            self.settings.query_timeout,
            || async move {
                sqlx::query_as::<_, HistoryRow>(
                    r#"
                    SELECT uid, name, namespace, phase, startedat, finishedat, workflow_json
                    FROM workflow_history WHERE uid = ?
                    "#,
                )
                .bind(uid_text)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| PersistenceError::from_sqlx("archive.get", e))
            },
        )
        .await?;
        row.map(HistoryRow::into_archived).transpose()
    }

    async fn delete(&self, uid: Uuid) -> PersistenceResult<()> {
        let uid_key = uid.to_string();
        let uid_text = uid_key.as_str();
        with_retry(
            BACKEND,
            "archive.delete",
            &self.settings.write,
            self.settings.query_timeout,
            || async move {
                sqlx::query("DELETE FROM workflow_history WHERE uid = ?")
                    .bind(uid_text)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| PersistenceError::from_sqlx("archive.delete", e))?;
                Ok(())
            },
        )
        .await
    }

    async fn delete_expired(&self, ttl: Duration) -> PersistenceResult<u64> {
        let expired_before = cutoff(ttl);
        with_retry(
            BACKEND,
            "archive.delete_expired",
            &self.settings.write,
            self.settings.query_timeout,
            || async move {
                let result = sqlx::query("DELETE FROM workflow_history WHERE finishedat < ?")
                    .bind(expired_before)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| PersistenceError::from_sqlx("archive.delete_expired", e))?;
                Ok(result.rows_affected())
            },
        )
        .await
    }
}
