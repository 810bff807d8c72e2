//! # Heartbeats
//!
//! Pods of a deployment report in periodically. Each report updates the
//! per-deployment instance snapshot held in [`InstancesCache`], and the
//! resulting count of available pods decides the deployment's state.
//!
//! Reports are ordered by their `date`: a report no newer than what is stored
//! for its pod is dropped, so applying two reports in either order leaves the
//! same snapshot behind. Entries nobody refreshed within the cache TTL expire.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::constants::{timing, StatusCode, TerminalStatus};
use crate::deployment::{commit_state, DeploymentError, DeploymentStore};
use crate::error::ErrorKind;
use crate::events::publisher::EventPublisher;
use crate::lock_group::LockGroup;
use crate::state_machine::DeploymentState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeartbeatType {
    BirthCry,
    HeartBeat,
    TombStone,
    ArtifactLoadStart,
    ArtifactLoadFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    pub name: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub containers: Vec<ContainerStatus>,
}

impl PodStatus {
    /// A running pod with one ready container
    pub fn ready(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            containers: vec![ContainerStatus {
                name: "main".into(),
                ready: true,
            }],
            phase: "Running".into(),
            name,
        }
    }

    /// Available when any of its containers is ready
    pub fn is_available(&self) -> bool {
        self.containers.iter().any(|c| c.ready)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatData {
    #[serde(rename = "type")]
    pub kind: HeartbeatType,
    pub pod_status: PodStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub date: DateTime<Utc>,
    /// Key of the deployment the pod belongs to
    pub key: String,
    pub data: HeartbeatData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodEntry {
    pub status: PodStatus,
    pub mtime: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}

/// Pods of one deployment as last reported
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceSnapshot {
    pub pods: BTreeMap<String, PodEntry>,
    /// Removal time of pods that reported a tombstone
    tombstones: BTreeMap<String, (DateTime<Utc>, DateTime<Utc>)>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl InstanceSnapshot {
    /// Drop entries not refreshed within `ttl` of `now`
    pub fn expire(&mut self, now: DateTime<Utc>, ttl: Duration) {
        let fresh = |refreshed_at: DateTime<Utc>| {
            (now - refreshed_at).to_std().map_or(true, |age| age <= ttl)
        };
        self.pods.retain(|_, entry| fresh(entry.refreshed_at));
        self.tombstones
            .retain(|_, (_, refreshed_at)| fresh(*refreshed_at));
    }

    fn newest(&self, pod: &str) -> Option<DateTime<Utc>> {
        let stored = self.pods.get(pod).map(|entry| entry.mtime);
        let removed = self.tombstones.get(pod).map(|(mtime, _)| *mtime);
        stored.max(removed)
    }

    /// Apply one report. Returns whether the pod set changed.
    pub fn apply(&mut self, heartbeat: &Heartbeat, now: DateTime<Utc>) -> bool {
        self.last_seen = Some(self.last_seen.map_or(now, |seen| seen.max(now)));

        let pod = &heartbeat.data.pod_status.name;
        if self.newest(pod).is_some_and(|newest| heartbeat.date <= newest) {
            return false;
        }

        match heartbeat.data.kind {
            HeartbeatType::TombStone => {
                self.tombstones.insert(pod.clone(), (heartbeat.date, now));
                self.pods.remove(pod).is_some()
            }
            _ => {
                self.tombstones.remove(pod);
                self.pods.insert(
                    pod.clone(),
                    PodEntry {
                        status: heartbeat.data.pod_status.clone(),
                        mtime: heartbeat.date,
                        refreshed_at: now,
                    },
                );
                true
            }
        }
    }

    /// Replace the pod set with what the runtime reports
    pub fn replace(&mut self, pods: &[PodStatus], now: DateTime<Utc>) {
        self.pods = pods
            .iter()
            .map(|pod| {
                (
                    pod.name.clone(),
                    PodEntry {
                        status: pod.clone(),
                        mtime: now,
                        refreshed_at: now,
                    },
                )
            })
            .collect();
        self.tombstones.clear();
    }

    pub fn available(&self) -> usize {
        self.pods
            .values()
            .filter(|entry| entry.status.is_available())
            .count()
    }
}

/// Per-deployment pod snapshots. Callers hold the deployment's lock from the
/// shared [`LockGroup`] while mutating an entry.
#[derive(Debug)]
pub struct InstancesCache {
    snapshots: DashMap<String, InstanceSnapshot>,
    ttl: Duration,
}

impl Default for InstancesCache {
    fn default() -> Self {
        Self::new(timing::INSTANCE_CACHE_TTL)
    }
}

impl InstancesCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            snapshots: DashMap::new(),
            ttl,
        }
    }

    /// Start accepting heartbeats for `key`
    pub fn register(&self, key: &str) {
        self.snapshots.entry(key.to_string()).or_default();
    }

    pub fn unregister(&self, key: &str) {
        self.snapshots.remove(key);
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.snapshots.contains_key(key)
    }

    /// Forget every pod of `key` but keep accepting heartbeats
    pub fn clear(&self, key: &str) {
        if let Some(mut snapshot) = self.snapshots.get_mut(key) {
            *snapshot = InstanceSnapshot::default();
        }
    }

    pub fn snapshot(&self, key: &str) -> Option<InstanceSnapshot> {
        self.snapshots.get(key).map(|s| s.value().clone())
    }

    /// When a heartbeat for `key` was last received
    pub fn freshness(&self, key: &str) -> Option<DateTime<Utc>> {
        self.snapshots.get(key).and_then(|s| s.last_seen)
    }

    /// Expire stale entries, then apply `heartbeat`. `None` when `key` is not registered.
    pub fn apply(&self, heartbeat: &Heartbeat, now: DateTime<Utc>) -> Option<InstanceSnapshot> {
        let mut snapshot = self.snapshots.get_mut(&heartbeat.key)?;
        snapshot.expire(now, self.ttl);
        snapshot.apply(heartbeat, now);
        Some(snapshot.clone())
    }

    pub fn replace(&self, key: &str, pods: &[PodStatus], now: DateTime<Utc>) {
        self.snapshots
            .entry(key.to_string())
            .or_default()
            .replace(pods, now);
    }
}

/// State a deployment moves to after a heartbeat, with the message recorded on it
pub fn next_state(
    current: DeploymentState,
    kind: HeartbeatType,
    available: usize,
    pods: usize,
    desired: u32,
) -> Option<(DeploymentState, Option<String>)> {
    if !matches!(
        current,
        DeploymentState::Waiting
            | DeploymentState::Active
            | DeploymentState::Error
            | DeploymentState::Upgrading
    ) {
        return None;
    }

    if available == desired as usize && pods >= desired as usize {
        return Some((DeploymentState::Active, None));
    }

    match current {
        DeploymentState::Waiting | DeploymentState::Upgrading
            if kind != HeartbeatType::ArtifactLoadFailed =>
        {
            Some((current, None))
        }
        _ => Some((
            DeploymentState::Error,
            Some(format!("{available} of {desired} available")),
        )),
    }
}

#[derive(Error, Debug)]
pub enum HeartbeatError {
    #[error("no deployment registered for heartbeat key {key}")]
    Unregistered { key: String },

    #[error(transparent)]
    Deployment(#[from] DeploymentError),
}

impl HeartbeatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unregistered { .. } => ErrorKind::NotFound,
            Self::Deployment(e) => e.kind(),
        }
    }
}

pub type HeartbeatResult<T> = Result<T, HeartbeatError>;

/// Applies heartbeats under the deployment's lock and commits state changes
#[derive(Debug, Clone)]
pub struct HeartbeatProcessor {
    cache: Arc<InstancesCache>,
    locks: Arc<LockGroup>,
    store: Arc<dyn DeploymentStore>,
    publisher: EventPublisher,
}

impl HeartbeatProcessor {
    pub fn new(
        cache: Arc<InstancesCache>,
        locks: Arc<LockGroup>,
        store: Arc<dyn DeploymentStore>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            cache,
            locks,
            store,
            publisher,
        }
    }

    /// Returns the deployment's state after the heartbeat, or `None` when the
    /// deployment no longer exists.
    pub async fn handle(&self, heartbeat: &Heartbeat) -> HeartbeatResult<Option<DeploymentState>> {
        let _guard = self.locks.lock(&heartbeat.key).await;

        let snapshot = self
            .cache
            .apply(heartbeat, Utc::now())
            .ok_or_else(|| HeartbeatError::Unregistered {
                key: heartbeat.key.clone(),
            })?;

        let Some(mut deployment) = self
            .store
            .get(&heartbeat.key)
            .await
            .map_err(DeploymentError::from)?
        else {
            return Ok(None);
        };

        let available = snapshot.available();
        let Some((to, message)) = next_state(
            deployment.state,
            heartbeat.data.kind,
            available,
            snapshot.pods.len(),
            deployment.min_scale(),
        ) else {
            return Ok(Some(deployment.state));
        };

        if to == deployment.state {
            return Ok(Some(to));
        }

        debug!(
            deployment = %heartbeat.key,
            from = %deployment.state,
            to = %to,
            available,
            "💓 Heartbeat changes deployment state"
        );
        let detail = message.map(|m| TerminalStatus::new(StatusCode::DeploymentDegraded, m));
        commit_state(
            self.store.as_ref(),
            &self.publisher,
            &mut deployment,
            to,
            detail,
        )
        .await?;
        Ok(Some(to))
    }
}
