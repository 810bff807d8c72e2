//! Services a deployment depends on, with in-memory implementations.
//!
//! The fixture manager hands out fixture instances and volumes, admission
//! control keeps a cpu/memory reservation per deployment id, and the runtime
//! materializes the workload. The store keeps the latest generation of every
//! deployment.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use super::errors::CollaboratorError;
use super::types::{Deployment, RuntimeStatus};
use crate::heartbeat::PodStatus;
use crate::persistence::PersistenceResult;
use crate::template::{EmbeddedFixture, FixtureAssignments, VolumeRequirement};

#[async_trait]
pub trait FixtureManager: Send + Sync + fmt::Debug {
    async fn reserve(
        &self,
        deployment: &Deployment,
        requirements: &BTreeMap<String, EmbeddedFixture>,
        volumes: &BTreeMap<String, VolumeRequirement>,
    ) -> Result<FixtureAssignments, CollaboratorError>;

    async fn release(&self, deployment: &Deployment) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait AdmissionControl: Send + Sync + fmt::Debug {
    /// Reserve, or replace the reservation of, `deployment_id` for `ttl`
    async fn reserve(
        &self,
        deployment_id: &str,
        cpu: f64,
        mem: f64,
        ttl: Duration,
    ) -> Result<(), CollaboratorError>;

    async fn release(&self, deployment_id: &str) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait DeploymentRuntime: Send + Sync + fmt::Debug {
    async fn create(&self, deployment: &Deployment) -> Result<(), CollaboratorError>;

    async fn upgrade(&self, deployment: &Deployment) -> Result<(), CollaboratorError>;

    async fn delete(&self, deployment: &Deployment) -> Result<(), CollaboratorError>;

    async fn scale(&self, deployment: &Deployment, replicas: u32) -> Result<(), CollaboratorError>;

    async fn status(&self, deployment: &Deployment) -> Result<RuntimeStatus, CollaboratorError>;
}

/// Latest generation of every deployment, keyed by `application/name`
#[async_trait]
pub trait DeploymentStore: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> PersistenceResult<Option<Deployment>>;

    async fn list(&self) -> PersistenceResult<Vec<Deployment>>;

    async fn upsert(&self, deployment: &Deployment) -> PersistenceResult<()>;
}

/// One-shot failures keyed by operation name
#[derive(Debug, Default)]
struct Faults(Mutex<HashMap<&'static str, CollaboratorError>>);

impl Faults {
    fn inject(&self, operation: &'static str, error: CollaboratorError) {
        self.0.lock().insert(operation, error);
    }

    fn check(&self, operation: &'static str) -> Result<(), CollaboratorError> {
        match self.0.lock().remove(operation) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryFixtureManager {
    assignments: DashMap<String, FixtureAssignments>,
    faults: Faults,
}

impl InMemoryFixtureManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `reserve` or `release`
    pub fn fail_next(&self, operation: &'static str, error: CollaboratorError) {
        self.faults.inject(operation, error);
    }

    pub fn is_reserved(&self, deployment_id: &str) -> bool {
        self.assignments.contains_key(deployment_id)
    }
}

#[async_trait]
impl FixtureManager for InMemoryFixtureManager {
    async fn reserve(
        &self,
        deployment: &Deployment,
        requirements: &BTreeMap<String, EmbeddedFixture>,
        _volumes: &BTreeMap<String, VolumeRequirement>,
    ) -> Result<FixtureAssignments, CollaboratorError> {
        self.faults.check("reserve")?;
        let assignment: FixtureAssignments = requirements
            .iter()
            .map(|(name, requirement)| {
                let attributes = requirement
                    .attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                    .collect();
                (name.clone(), attributes)
            })
            .collect();
        self.assignments
            .insert(deployment.deployment_id.clone(), assignment.clone());
        Ok(assignment)
    }

    async fn release(&self, deployment: &Deployment) -> Result<(), CollaboratorError> {
        self.faults.check("release")?;
        self.assignments.remove(&deployment.deployment_id);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reservation {
    pub cpu: f64,
    pub mem: f64,
    pub ttl: Duration,
}

#[derive(Debug, Default)]
pub struct InMemoryAdmission {
    reservations: DashMap<String, Reservation>,
    history: Mutex<Vec<(String, Reservation)>>,
    faults: Faults,
}

impl InMemoryAdmission {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, operation: &'static str, error: CollaboratorError) {
        self.faults.inject(operation, error);
    }

    pub fn reservation(&self, deployment_id: &str) -> Option<Reservation> {
        self.reservations.get(deployment_id).map(|r| *r.value())
    }

    /// Every reservation request in arrival order
    pub fn requests(&self) -> Vec<(String, Reservation)> {
        self.history.lock().clone()
    }
}

#[async_trait]
impl AdmissionControl for InMemoryAdmission {
    async fn reserve(
        &self,
        deployment_id: &str,
        cpu: f64,
        mem: f64,
        ttl: Duration,
    ) -> Result<(), CollaboratorError> {
        self.faults.check("reserve")?;
        let reservation = Reservation { cpu, mem, ttl };
        self.reservations
            .insert(deployment_id.to_string(), reservation);
        self.history
            .lock()
            .push((deployment_id.to_string(), reservation));
        Ok(())
    }

    async fn release(&self, deployment_id: &str) -> Result<(), CollaboratorError> {
        self.faults.check("release")?;
        self.reservations.remove(deployment_id);
        Ok(())
    }
}

/// Runtime whose workloads report exactly the replicas they were asked for
#[derive(Debug, Default)]
pub struct InMemoryDeploymentRuntime {
    workloads: DashMap<String, RuntimeStatus>,
    faults: Faults,
}

impl InMemoryDeploymentRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, operation: &'static str, error: CollaboratorError) {
        self.faults.inject(operation, error);
    }

    pub fn replicas(&self, deployment_id: &str) -> Option<u32> {
        self.workloads
            .get(deployment_id)
            .map(|w| w.desired_replicas)
    }

    /// Override what `status` reports for a workload
    pub fn set_status(&self, deployment_id: &str, status: RuntimeStatus) {
        self.workloads.insert(deployment_id.to_string(), status);
    }

    fn ready(deployment: &Deployment, replicas: u32) -> RuntimeStatus {
        let pods = (0..replicas)
            .map(|i| PodStatus::ready(format!("{}-{}-{i}", deployment.name, deployment.id.simple())))
            .collect();
        RuntimeStatus {
            desired_replicas: replicas,
            available_replicas: replicas,
            pods,
            failures: Vec::new(),
        }
    }
}

#[async_trait]
impl DeploymentRuntime for InMemoryDeploymentRuntime {
    async fn create(&self, deployment: &Deployment) -> Result<(), CollaboratorError> {
        self.faults.check("create")?;
        self.workloads.insert(
            deployment.deployment_id.clone(),
            Self::ready(deployment, deployment.min_scale()),
        );
        Ok(())
    }

    async fn upgrade(&self, deployment: &Deployment) -> Result<(), CollaboratorError> {
        self.faults.check("upgrade")?;
        self.workloads.insert(
            deployment.deployment_id.clone(),
            Self::ready(deployment, deployment.min_scale()),
        );
        Ok(())
    }

    async fn delete(&self, deployment: &Deployment) -> Result<(), CollaboratorError> {
        self.faults.check("delete")?;
        self.workloads.remove(&deployment.deployment_id);
        Ok(())
    }

    async fn scale(&self, deployment: &Deployment, replicas: u32) -> Result<(), CollaboratorError> {
        self.faults.check("scale")?;
        self.workloads.insert(
            deployment.deployment_id.clone(),
            Self::ready(deployment, replicas),
        );
        Ok(())
    }

    async fn status(&self, deployment: &Deployment) -> Result<RuntimeStatus, CollaboratorError> {
        self.faults.check("status")?;
        self.workloads
            .get(&deployment.deployment_id)
            .map(|w| w.value().clone())
            .ok_or_else(|| CollaboratorError::new(404, format!("{} has no workload", deployment.key())))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDeploymentStore {
    deployments: DashMap<String, Deployment>,
}

impl InMemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for InMemoryDeploymentStore {
    async fn get(&self, key: &str) -> PersistenceResult<Option<Deployment>> {
        Ok(self.deployments.get(key).map(|d| d.value().clone()))
    }

    async fn list(&self) -> PersistenceResult<Vec<Deployment>> {
        let mut deployments: Vec<Deployment> =
            self.deployments.iter().map(|d| d.value().clone()).collect();
        deployments.sort_by_key(Deployment::key);
        Ok(deployments)
    }

    async fn upsert(&self, deployment: &Deployment) -> PersistenceResult<()> {
        self.deployments
            .insert(deployment.key(), deployment.clone());
        Ok(())
    }
}
