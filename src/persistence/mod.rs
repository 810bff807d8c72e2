//! # Persistence
//!
//! Offloads large node-status maps to SQL and archives finished workflows.
//!
//! ## Overview
//!
//! - [`OffloadNodeStatusRepo`]: node-status maps keyed by (workflow uid,
//!   version). The version is a content hash, so saving the same nodes twice
//!   is idempotent.
//! - [`WorkflowArchive`]: one row per finished workflow in `workflow_history`.
//!
//! Backends: PostgreSQL ([`postgres`]), MySQL ([`mysql`]) and in-memory
//! ([`memory`]). Every SQL call retries transient failures with the read or
//! write backoff profile. A transient failure that outlives the budget is
//! reported as [`PersistenceError::RetriesExhausted`], which is permanent.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use flowmill_core::config::PersistenceConfig;
//! use flowmill_core::persistence::connect;
//!
//! # async fn example() -> Result<(), flowmill_core::persistence::PersistenceError> {
//! let mut config = PersistenceConfig::default();
//! config.enabled = true;
//! config.url = Some("postgres://flowmill@localhost/flowmill".into());
//! let stores = connect(&config).await?;
//! assert!(stores.offloads.is_enabled());
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod memory;
pub mod mysql;
pub mod postgres;
mod rows;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::{PersistenceConfig, SqlDriver};
use crate::logging::log_persistence_operation;
use crate::resilience::{retry_on, Backoff};
use crate::workflow::Nodes;

pub use errors::{PersistenceError, PersistenceResult};
pub use memory::{InMemoryOffloadRepo, InMemoryWorkflowArchive};
pub use mysql::{MySqlOffloadRepo, MySqlWorkflowArchive};
pub use postgres::{PostgresOffloadRepo, PostgresWorkflowArchive};

/// Identity of one offloaded node-status map
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OffloadKey {
    pub uid: Uuid,
    pub version: String,
}

impl OffloadKey {
    pub fn new(uid: Uuid, version: impl Into<String>) -> Self {
        Self {
            uid,
            version: version.into(),
        }
    }
}

impl fmt::Display for OffloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.uid, self.version)
    }
}

/// Content hash identifying a node-status map
pub fn node_status_version(nodes: &Nodes) -> PersistenceResult<String> {
    let encoded = serde_json::to_vec(nodes)?;
    let digest = Sha256::digest(&encoded);
    Ok(format!("sha256:{}", &hex::encode(digest)[..32]))
}

#[async_trait]
pub trait OffloadNodeStatusRepo: Send + Sync + fmt::Debug {
    /// Store `nodes` and return their version
    async fn save(&self, uid: Uuid, namespace: &str, nodes: &Nodes) -> PersistenceResult<String>;

    async fn get(&self, uid: Uuid, version: &str) -> PersistenceResult<Nodes>;

    /// Every offload in a namespace; an empty namespace means all of them
    async fn list(&self, namespace: &str) -> PersistenceResult<BTreeMap<OffloadKey, Nodes>>;

    /// Offloads older than the offload TTL, candidates for garbage collection
    async fn list_old_offloads(&self, namespace: &str) -> PersistenceResult<Vec<OffloadKey>>;

    async fn delete(&self, uid: Uuid, version: &str) -> PersistenceResult<()>;

    fn is_enabled(&self) -> bool;
}

/// Offload store used when persistence is switched off
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledOffloadRepo;

#[async_trait]
impl OffloadNodeStatusRepo for DisabledOffloadRepo {
    async fn save(&self, _uid: Uuid, _namespace: &str, _nodes: &Nodes) -> PersistenceResult<String> {
        Err(PersistenceError::Disabled)
    }

    async fn get(&self, _uid: Uuid, _version: &str) -> PersistenceResult<Nodes> {
        Err(PersistenceError::Disabled)
    }

    async fn list(&self, _namespace: &str) -> PersistenceResult<BTreeMap<OffloadKey, Nodes>> {
        Err(PersistenceError::Disabled)
    }

    async fn list_old_offloads(&self, _namespace: &str) -> PersistenceResult<Vec<OffloadKey>> {
        Err(PersistenceError::Disabled)
    }

    async fn delete(&self, _uid: Uuid, _version: &str) -> PersistenceResult<()> {
        Err(PersistenceError::Disabled)
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// A finished workflow or deployment kept in `workflow_history`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedWorkflow {
    pub uid: Uuid,
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// The full object as JSON
    pub workflow: Value,
}

#[async_trait]
pub trait WorkflowArchive: Send + Sync + fmt::Debug {
    /// Store the workflow, replacing any earlier row with the same uid
    async fn archive(&self, workflow: &ArchivedWorkflow) -> PersistenceResult<()>;

    /// Newest first
    async fn list(
        &self,
        namespace: &str,
        limit: usize,
        offset: usize,
    ) -> PersistenceResult<Vec<ArchivedWorkflow>>;

    async fn get(&self, uid: Uuid) -> PersistenceResult<Option<ArchivedWorkflow>>;

    async fn delete(&self, uid: Uuid) -> PersistenceResult<()>;

    /// Remove rows finished more than `ttl` ago; returns how many
    async fn delete_expired(&self, ttl: Duration) -> PersistenceResult<u64>;
}

/// Retry profiles and limits shared by the SQL backends
#[derive(Debug, Clone, Copy)]
pub struct SqlSettings {
    pub read: Backoff,
    pub write: Backoff,
    pub query_timeout: Duration,
    pub offload_ttl: Duration,
}

impl Default for SqlSettings {
    fn default() -> Self {
        Self {
            read: Backoff::PERSISTENCE_READ,
            write: Backoff::PERSISTENCE_WRITE,
            query_timeout: crate::constants::timing::SQL_QUERY_TIMEOUT,
            offload_ttl: Duration::from_secs(300),
        }
    }
}

impl SqlSettings {
    pub fn from_config(config: &PersistenceConfig) -> Self {
        Self {
            query_timeout: Duration::from_secs(config.query_timeout_seconds),
            offload_ttl: Duration::from_secs(config.offload_ttl_seconds),
            ..Self::default()
        }
    }
}

/// Run one SQL operation under a timeout with bounded retries. A transient
/// failure that survives every attempt comes back as `RetriesExhausted`.
pub(crate) async fn with_retry<T, F, Fut>(
    backend: &str,
    operation: &str,
    backoff: &Backoff,
    query_timeout: Duration,
    mut call: F,
) -> PersistenceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PersistenceResult<T>>,
{
    let started = Instant::now();
    let result = retry_on(backoff, PersistenceError::is_transient, || {
        let attempt = call();
        async move {
            tokio::time::timeout(query_timeout, attempt)
                .await
                .unwrap_or_else(|_| {
                    Err(PersistenceError::Timeout {
                        operation: operation.to_string(),
                        seconds: query_timeout.as_secs(),
                    })
                })
        }
    })
    .await;

    let elapsed = started.elapsed().as_millis() as u64;
    match result {
        Ok(value) => {
            log_persistence_operation(operation, backend, None, "ok", Some(elapsed));
            Ok(value)
        }
        Err(e) if e.is_transient() => {
            log_persistence_operation(operation, backend, None, "retries_exhausted", Some(elapsed));
            Err(PersistenceError::RetriesExhausted {
                operation: operation.to_string(),
                attempts: backoff.steps,
                message: e.to_string(),
            })
        }
        Err(e) => {
            log_persistence_operation(operation, backend, None, "failed", Some(elapsed));
            Err(e)
        }
    }
}

/// The configured offload store and archive
#[derive(Debug, Clone)]
pub struct PersistenceStores {
    pub offloads: Arc<dyn OffloadNodeStatusRepo>,
    pub archive: Arc<dyn WorkflowArchive>,
}

/// Connect the backend named in configuration, creating its tables.
/// With persistence disabled, offloads are refused and the archive is kept in
/// memory.
pub async fn connect(config: &PersistenceConfig) -> PersistenceResult<PersistenceStores> {
    if !config.enabled {
        return Ok(PersistenceStores {
            offloads: Arc::new(DisabledOffloadRepo),
            archive: Arc::new(InMemoryWorkflowArchive::default()),
        });
    }
    let url = config.url.as_deref().ok_or_else(|| PersistenceError::Database {
        operation: "connect".to_string(),
        message: "persistence.url is required when persistence is enabled".to_string(),
        transient: false,
    })?;
    let settings = SqlSettings::from_config(config);

    match config.driver {
        SqlDriver::Postgres => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(url)
                .await
                .map_err(|e| PersistenceError::from_sqlx("connect", e))?;
            schema::ensure_postgres(&pool).await?;
            Ok(PersistenceStores {
                offloads: Arc::new(PostgresOffloadRepo::new(pool.clone(), settings)),
                archive: Arc::new(PostgresWorkflowArchive::new(pool, settings)),
            })
        }
        SqlDriver::Mysql => {
            let pool = sqlx::mysql::MySqlPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(url)
                .await
                .map_err(|e| PersistenceError::from_sqlx("connect", e))?;
            schema::ensure_mysql(&pool).await?;
            Ok(PersistenceStores {
                offloads: Arc::new(MySqlOffloadRepo::new(pool.clone(), settings)),
                archive: Arc::new(MySqlWorkflowArchive::new(pool, settings)),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{NodePhase, NodeStatus};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn nodes(phase: NodePhase) -> Nodes {
        let mut nodes = Nodes::new();
        nodes.insert("n1".into(), NodeStatus::new("n1", "ci.build", "build", phase));
        nodes
    }

    #[test]
    fn test_version_is_content_hash() {
        let a = node_status_version(&nodes(NodePhase::Running)).unwrap();
        let b = node_status_version(&nodes(NodePhase::Running)).unwrap();
        let c = node_status_version(&nodes(NodePhase::Succeeded)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("sha256:"));
    }

    #[tokio::test]
    async fn test_transient_failures_become_permanent() {
        let calls = AtomicU32::new(0);
        let result: PersistenceResult<()> = with_retry(
            "test",
            "save",
            &Backoff::PERSISTENCE_WRITE.without_delay(),
            Duration::from_secs(1),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(PersistenceError::from_sqlx("save", sqlx::Error::PoolTimedOut)) }
            },
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, PersistenceError::RetriesExhausted { attempts: 5, .. }));
        assert!(!err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_disabled_repo_refuses_offloads() {
        let repo = DisabledOffloadRepo;
        assert!(!repo.is_enabled());
        assert_eq!(
            repo.save(Uuid::new_v4(), "ns", &Nodes::new()).await,
            Err(PersistenceError::Disabled)
        );
    }
}
