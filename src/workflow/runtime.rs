//! Pod runtime seam.
//!
//! The operator only creates, observes, deadlines and deletes pods. Anything
//! that can do that (a cluster API client, a local executor, the in-memory
//! runtime below) plugs in through [`PodRuntime`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::RuntimeError;
use super::pod::PodSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Observed state of a pod
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodObservation {
    pub phase: PodPhase,
    /// Machine readable failure reason such as `Evicted` or `OOMKilled`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Termination message of the `wait` container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_termination_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PodObservation {
    pub fn new(phase: PodPhase) -> Self {
        Self {
            phase,
            ..Self::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_termination_message(mut self, message: impl Into<String>) -> Self {
        self.wait_termination_message = Some(message.into());
        self
    }
}

/// Pod failures caused by the platform rather than the container. These are
/// retried; anything else fails the node unless the step opted into
/// `auto_retry`.
pub fn is_retryable_reason(reason: Option<&str>) -> bool {
    matches!(
        reason,
        Some("Evicted" | "NodeLost" | "Preempted" | "UnexpectedAdmissionError" | "Shutdown")
    )
}

#[async_trait]
pub trait PodRuntime: Send + Sync + fmt::Debug {
    /// Create a pod. Creating a pod that already exists is not an error.
    async fn create_pod(&self, pod: &PodSpec) -> Result<(), RuntimeError>;

    async fn get_pod(&self, namespace: &str, name: &str)
        -> Result<Option<PodObservation>, RuntimeError>;

    /// Ask the runtime to stop the pod once `seconds` have elapsed since it started
    async fn set_active_deadline(
        &self,
        namespace: &str,
        name: &str,
        seconds: u64,
    ) -> Result<(), RuntimeError>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), RuntimeError>;
}

#[derive(Debug, Clone)]
struct PodRecord {
    spec: PodSpec,
    observation: PodObservation,
}

/// Runtime keeping pods in memory. Pods stay `Pending` until a caller moves
/// them with [`InMemoryPodRuntime::set_observation`].
#[derive(Debug, Default)]
pub struct InMemoryPodRuntime {
    pods: DashMap<(String, String), PodRecord>,
    create_failures: Mutex<Vec<RuntimeError>>,
}

impl InMemoryPodRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(namespace: &str, name: &str) -> (String, String) {
        (namespace.to_string(), name.to_string())
    }

    /// Make the next `create_pod` calls fail, one error per call
    pub fn fail_next_creates(&self, errors: impl IntoIterator<Item = RuntimeError>) {
        let mut failures = self.create_failures.lock();
        failures.extend(errors);
    }

    pub fn set_observation(&self, namespace: &str, name: &str, observation: PodObservation) -> bool {
        match self.pods.get_mut(&Self::key(namespace, name)) {
            Some(mut record) => {
                record.observation = observation;
                true
            }
            None => false,
        }
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<PodSpec> {
        self.pods
            .get(&Self::key(namespace, name))
            .map(|record| record.spec.clone())
    }

    /// Every pod in a namespace, sorted by name
    pub fn pods(&self, namespace: &str) -> Vec<PodSpec> {
        let mut pods: Vec<PodSpec> = self
            .pods
            .iter()
            .filter(|entry| entry.key().0 == namespace)
            .map(|entry| entry.value().spec.clone())
            .collect();
        pods.sort_by(|a, b| a.name.cmp(&b.name));
        pods
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }
}

#[async_trait]
impl PodRuntime for InMemoryPodRuntime {
    async fn create_pod(&self, pod: &PodSpec) -> Result<(), RuntimeError> {
        {
            let mut failures = self.create_failures.lock();
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }
        self.pods
            .entry(Self::key(&pod.namespace, &pod.name))
            .or_insert_with(|| PodRecord {
                spec: pod.clone(),
                observation: PodObservation::new(PodPhase::Pending),
            });
        Ok(())
    }

    async fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodObservation>, RuntimeError> {
        Ok(self
            .pods
            .get(&Self::key(namespace, name))
            .map(|record| record.observation.clone()))
    }

    async fn set_active_deadline(
        &self,
        namespace: &str,
        name: &str,
        seconds: u64,
    ) -> Result<(), RuntimeError> {
        let mut record = self
            .pods
            .get_mut(&Self::key(namespace, name))
            .ok_or_else(|| RuntimeError::NotFound {
                kind: "pod".to_string(),
                name: name.to_string(),
            })?;
        record.spec.active_deadline_seconds = Some(seconds);
        if seconds == 0 && !matches!(record.observation.phase, PodPhase::Succeeded | PodPhase::Failed) {
            record.observation = PodObservation::new(PodPhase::Failed)
                .with_reason("DeadlineExceeded")
                .with_message("Pod was active on the node longer than the specified deadline");
        }
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), RuntimeError> {
        self.pods
            .remove(&Self::key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound {
                kind: "pod".to_string(),
                name: name.to_string(),
            })
    }
}
