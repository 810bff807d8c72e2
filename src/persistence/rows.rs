//! Row shapes shared by the SQL backends.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::time::Duration;
use uuid::Uuid;

use super::errors::{PersistenceError, PersistenceResult};
use super::{ArchivedWorkflow, OffloadKey};
use crate::workflow::Nodes;

#[derive(Debug, FromRow)]
pub(crate) struct OffloadRow {
    pub uid: String,
    pub version: String,
    pub nodes_json: String,
}

#[derive(Debug, FromRow)]
pub(crate) struct HistoryRow {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub startedat: Option<DateTime<Utc>>,
    pub finishedat: Option<DateTime<Utc>>,
    pub workflow_json: String,
}

pub(crate) fn parse_uid(raw: &str) -> PersistenceResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| PersistenceError::Serialization {
        message: format!("invalid uid '{raw}': {e}"),
    })
}

impl OffloadRow {
    pub(crate) fn into_entry(self) -> PersistenceResult<(OffloadKey, Nodes)> {
        let nodes: Nodes = serde_json::from_str(&self.nodes_json)?;
        Ok((OffloadKey::new(parse_uid(&self.uid)?, self.version), nodes))
    }
}

impl HistoryRow {
    pub(crate) fn into_archived(self) -> PersistenceResult<ArchivedWorkflow> {
        Ok(ArchivedWorkflow {
            uid: parse_uid(&self.uid)?,
            name: self.name,
            namespace: self.namespace,
            phase: self.phase,
            started_at: self.startedat,
            finished_at: self.finishedat,
            workflow: serde_json::from_str(&self.workflow_json)?,
        })
    }
}

pub(crate) fn cutoff(ttl: Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero())
}
