//! # Deployment Lifecycle
//!
//! Create, upgrade, scale, stop, start and terminate, each under the
//! deployment's lock from the shared [`LockGroup`].
//!
//! Reservations taken while creating a deployment are pushed onto a
//! [`Rollback`] stack. A 4xx-class failure drains the stack in reverse and
//! terminates the deployment; a 5xx-class failure leaves the deployment in
//! `Init` with its reservations in place so the monitor can retry.

use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::collaborators::{AdmissionControl, DeploymentRuntime, DeploymentStore, FixtureManager};
use super::errors::{CollaboratorError, DeploymentError, DeploymentResult};
use super::resources::{max_resources, max_resources_for_upgrade};
use super::types::Deployment;
use crate::config::{CostModel, DeploymentConfig};
use crate::constants::{events, StatusCode, TerminalStatus};
use crate::events::publisher::EventPublisher;
use crate::heartbeat::{HeartbeatProcessor, InstancesCache};
use crate::lock_group::LockGroup;
use crate::logging::{log_deployment_operation, log_error};
use crate::persistence::WorkflowArchive;
use crate::state_machine::{DeploymentState, DeploymentStateMachine, StateMachineError};
use crate::template::{substitute, EmbeddedTemplate, Scale, TemplateError};

/// Move `deployment` to `to` through the transition table and persist it
pub async fn commit_state(
    store: &dyn DeploymentStore,
    publisher: &EventPublisher,
    deployment: &mut Deployment,
    to: DeploymentState,
    detail: Option<TerminalStatus>,
) -> DeploymentResult<()> {
    let message = detail.as_ref().map(|d| d.to_string());
    let mut machine = DeploymentStateMachine::new(deployment.key(), deployment.state, publisher.clone());
    machine.transition(to, message.as_deref()).await?;

    deployment.state = to;
    deployment.status_detail = detail;
    deployment.updated_at = Utc::now();
    store.upsert(deployment).await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Reserved {
    Heartbeat,
    Fixtures,
    Resources,
    /// A resize replaced this reservation
    Resized { cpu: f64, mem: f64 },
}

/// Reservations to undo if an operation fails part way
struct Rollback<'a> {
    manager: &'a DeploymentManager,
    stack: Vec<Reserved>,
}

impl<'a> Rollback<'a> {
    fn new(manager: &'a DeploymentManager) -> Self {
        Self {
            manager,
            stack: Vec::new(),
        }
    }

    fn push(&mut self, reserved: Reserved) {
        self.stack.push(reserved);
    }

    /// Release everything in reverse order. Release failures are logged, not returned.
    async fn drain(mut self, deployment: &Deployment) {
        while let Some(reserved) = self.stack.pop() {
            let result = match reserved {
                Reserved::Heartbeat => {
                    self.manager.instances.unregister(&deployment.key());
                    Ok(())
                }
                Reserved::Fixtures => self.manager.fixtures.release(deployment).await,
                Reserved::Resources => {
                    self.manager
                        .admission
                        .release(&deployment.deployment_id)
                        .await
                }
                Reserved::Resized { cpu, mem } => {
                    self.manager
                        .admission
                        .reserve(
                            &deployment.deployment_id,
                            cpu,
                            mem,
                            self.manager.reservation_ttl(),
                        )
                        .await
                }
            };
            if let Err(e) = result {
                log_error(
                    "deployment",
                    "rollback",
                    &e.to_string(),
                    Some(&format!("{} {reserved:?}", deployment.key())),
                );
            }
        }
    }
}

pub struct DeploymentManager {
    store: Arc<dyn DeploymentStore>,
    fixtures: Arc<dyn FixtureManager>,
    admission: Arc<dyn AdmissionControl>,
    runtime: Arc<dyn DeploymentRuntime>,
    history: Arc<dyn WorkflowArchive>,
    instances: Arc<InstancesCache>,
    locks: Arc<LockGroup>,
    publisher: EventPublisher,
    config: DeploymentConfig,
    cost_model: CostModel,
}

impl std::fmt::Debug for DeploymentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentManager")
            .field("config", &self.config)
            .field("locks", &self.locks.len())
            .finish()
    }
}

impl DeploymentManager {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        fixtures: Arc<dyn FixtureManager>,
        admission: Arc<dyn AdmissionControl>,
        runtime: Arc<dyn DeploymentRuntime>,
        history: Arc<dyn WorkflowArchive>,
        publisher: EventPublisher,
        config: DeploymentConfig,
    ) -> Self {
        let instances = Arc::new(InstancesCache::new(Duration::from_secs(config.cache_ttl_seconds)));
        Self {
            store,
            fixtures,
            admission,
            runtime,
            history,
            instances,
            locks: Arc::new(LockGroup::new()),
            publisher,
            config,
            cost_model: CostModel::default(),
        }
    }

    pub fn with_cost_model(mut self, cost_model: CostModel) -> Self {
        self.cost_model = cost_model;
        self
    }

    pub fn store(&self) -> &Arc<dyn DeploymentStore> {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<dyn DeploymentRuntime> {
        &self.runtime
    }

    pub fn admission(&self) -> &Arc<dyn AdmissionControl> {
        &self.admission
    }

    pub fn history(&self) -> &Arc<dyn WorkflowArchive> {
        &self.history
    }

    pub fn instances(&self) -> &Arc<InstancesCache> {
        &self.instances
    }

    pub fn locks(&self) -> &Arc<LockGroup> {
        &self.locks
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    pub fn cost_model(&self) -> &CostModel {
        &self.cost_model
    }

    /// A heartbeat processor sharing this manager's cache, locks and store
    pub fn heartbeat_processor(&self) -> HeartbeatProcessor {
        HeartbeatProcessor::new(
            self.instances.clone(),
            self.locks.clone(),
            self.store.clone(),
            self.publisher.clone(),
        )
    }

    pub(crate) fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.config.reservation_ttl_seconds)
    }

    /// Resources a deployment must hold. An upgrading deployment holds the
    /// envelope over its archived predecessor when that is still on record.
    pub(crate) async fn reservation_envelope(&self, deployment: &Deployment) -> DeploymentResult<(f64, f64)> {
        if deployment.state == DeploymentState::Upgrading {
            if let Some(previous_id) = deployment.previous_id {
                if let Some(archived) = self.history.get(previous_id).await? {
                    let previous = Deployment::from_archive(&archived)?;
                    return max_resources_for_upgrade(&previous, deployment);
                }
            }
        }
        Ok(max_resources(deployment))
    }

    pub async fn get(&self, key: &str) -> DeploymentResult<Deployment> {
        self.store
            .get(key)
            .await?
            .ok_or_else(|| DeploymentError::NotFound {
                key: key.to_string(),
            })
    }

    pub(crate) async fn mark(
        &self,
        deployment: &mut Deployment,
        to: DeploymentState,
        detail: Option<TerminalStatus>,
    ) -> DeploymentResult<()> {
        commit_state(self.store.as_ref(), &self.publisher, deployment, to, detail).await
    }

    async fn publish(&self, event: &str, deployment: &Deployment) {
        let context = json!({
            "key": deployment.key(),
            "id": deployment.id,
            "deployment_id": deployment.deployment_id,
            "state": deployment.state.to_string(),
        });
        if let Err(e) = self.publisher.publish(event, context).await {
            warn!(event, error = %e, "Failed to publish deployment event");
        }
    }

    fn check(deployment: &Deployment, to: DeploymentState) -> DeploymentResult<()> {
        DeploymentStateMachine::new(deployment.key(), deployment.state, EventPublisher::new(1))
            .check(to)
            .map_err(DeploymentError::from)
    }

    /// Create a new deployment and bring it to `Waiting`
    pub async fn create(&self, deployment: Deployment) -> DeploymentResult<Deployment> {
        let _guard = self.locks.lock(&deployment.key()).await;
        let mut deployment = deployment;
        if self.store.get(&deployment.key()).await?.is_none() {
            self.store.upsert(&deployment).await?;
        }
        self.create_locked(&mut deployment).await?;
        Ok(deployment)
    }

    pub(crate) async fn create_locked(&self, deployment: &mut Deployment) -> DeploymentResult<()> {
        Self::check(deployment, DeploymentState::Waiting)?;
        let mut rollback = Rollback::new(self);

        self.instances.register(&deployment.key());
        rollback.push(Reserved::Heartbeat);

        let result = self.reserve_and_launch(deployment, &mut rollback).await;
        match result {
            Ok(()) => {}
            Err(e) if Self::is_fatal(&e) => {
                let detail = TerminalStatus::new(
                    e.status_code().unwrap_or(StatusCode::CreatingDeployment),
                    e.to_string(),
                );
                rollback.drain(deployment).await;
                self.mark(deployment, DeploymentState::Terminated, Some(detail))
                    .await?;
                return Err(e);
            }
            Err(e) => {
                log_deployment_operation(
                    "create",
                    &deployment.key(),
                    &deployment.state.to_string(),
                    Some(&format!("will retry: {e}")),
                );
                return Err(e);
            }
        }

        self.mark(deployment, DeploymentState::Waiting, None).await?;
        self.publish(events::DEPLOYMENT_CREATED, deployment).await;
        info!(deployment = %deployment.key(), cpu = deployment.cpu, mem = deployment.mem, "🚀 Deployment created");
        Ok(())
    }

    /// 4xx-class failures and capacity refusals end the deployment
    fn is_fatal(error: &DeploymentError) -> bool {
        match error {
            DeploymentError::Collaborator { source, .. } => {
                source.is_client_error() || source.is_not_enough_resource()
            }
            DeploymentError::DynamicFixture { .. } | DeploymentError::Template(_) => true,
            _ => false,
        }
    }

    async fn reserve_and_launch(
        &self,
        deployment: &mut Deployment,
        rollback: &mut Rollback<'_>,
    ) -> DeploymentResult<()> {
        self.reserve_fixtures(deployment).await?;
        rollback.push(Reserved::Fixtures);

        let (cpu, mem) = max_resources(deployment);
        self.admission
            .reserve(&deployment.deployment_id, cpu, mem, self.reservation_ttl())
            .await
            .map_err(|e| DeploymentError::collaborator(StatusCode::ReserveResource, e))?;
        rollback.push(Reserved::Resources);
        deployment.cpu = cpu;
        deployment.mem = mem;

        self.runtime
            .create(deployment)
            .await
            .map_err(|e| DeploymentError::collaborator(StatusCode::CreatingDeployment, e))
    }

    /// Reserve managed fixtures and volumes, substituting the assignment into the template
    async fn reserve_fixtures(&self, deployment: &mut Deployment) -> DeploymentResult<()> {
        let mut requirements = BTreeMap::new();
        for group in &deployment.template.fixtures {
            for (name, requirement) in group {
                if requirement.is_dynamic() {
                    return Err(DeploymentError::DynamicFixture { name: name.clone() });
                }
                requirements.insert(name.clone(), requirement.clone());
            }
        }
        if requirements.is_empty() && deployment.template.volumes.is_empty() {
            return Ok(());
        }

        let assignment = self
            .fixtures
            .reserve(deployment, &requirements, &deployment.template.volumes)
            .await
            .map_err(|e| DeploymentError::collaborator(StatusCode::ReservingFixture, e))?;
        if assignment.is_empty() {
            return Ok(());
        }

        let template = EmbeddedTemplate::Deployment(deployment.template.clone());
        match substitute(&template, &deployment.arguments, &assignment)? {
            EmbeddedTemplate::Deployment(substituted) => deployment.template = substituted,
            other => {
                return Err(TemplateError::internal(format!(
                    "substituting deployment {} produced a {}",
                    deployment.key(),
                    other.template_type()
                ))
                .into())
            }
        }
        deployment.fixtures = assignment;
        Ok(())
    }

    /// Replace the running generation with `next`
    pub async fn upgrade(&self, next: Deployment) -> DeploymentResult<Deployment> {
        let key = next.key();
        let _guard = self.locks.lock(&key).await;
        let current = self.get(&key).await?;
        Self::check(&current, DeploymentState::Upgrading)?;

        let mut next = next;
        let previous = if next.id != current.id {
            self.history.archive(&current.to_archive()?).await?;
            current.clone()
        } else {
            // resubmission of the same generation: size against the archived predecessor
            let previous_id = current.previous_id.ok_or_else(|| {
                DeploymentError::from(TemplateError::internal(format!(
                    "upgrade resubmitted for {key} without a previous generation"
                )))
            })?;
            let archived = self
                .history
                .get(previous_id)
                .await?
                .ok_or(crate::persistence::PersistenceError::ArchiveNotFound { uid: previous_id })?;
            Deployment::from_archive(&archived)?
        };

        self.reserve_fixtures(&mut next).await?;
        let (cpu, mem) = max_resources_for_upgrade(&previous, &next)?;
        self.admission
            .reserve(&next.deployment_id, cpu, mem, self.reservation_ttl())
            .await
            .map_err(|e| DeploymentError::collaborator(StatusCode::ReserveResource, e))?;

        next.previous_id = Some(previous.id);
        next.state = current.state;
        next.cpu = cpu;
        next.mem = mem;
        self.mark(&mut next, DeploymentState::Upgrading, None).await?;
        self.instances.register(&key);

        if let Err(e) = self.runtime.upgrade(&next).await {
            let error = DeploymentError::collaborator(StatusCode::UpgradingDeployment, e);
            let detail = TerminalStatus::new(StatusCode::UpgradingDeployment, error.to_string());
            self.mark(&mut next, DeploymentState::Error, Some(detail)).await?;
            return Err(error);
        }

        let (cpu, mem) = max_resources(&next);
        match self
            .admission
            .reserve(&next.deployment_id, cpu, mem, self.reservation_ttl())
            .await
        {
            Ok(()) => {
                next.cpu = cpu;
                next.mem = mem;
                self.store.upsert(&next).await?;
            }
            // the upgrade envelope stays reserved until the extender's next pass
            Err(e) => warn!(deployment = %key, error = %e, "Failed to shrink upgrade reservation"),
        }

        self.publish(events::DEPLOYMENT_UPGRADED, &next).await;
        Ok(next)
    }

    /// Change the instance count. Deployments with volumes stay at one instance.
    /// An upgrading deployment keeps rolling out; any other lands in `Waiting`.
    pub async fn scale(&self, key: &str, scale: Scale) -> DeploymentResult<Deployment> {
        let _guard = self.locks.lock(key).await;
        let mut deployment = self.get(key).await?;

        if deployment.has_volumes() && scale.min > 1 {
            return Err(DeploymentError::ScaleRejected {
                message: format!(
                    "cannot scale past 1 instance: deployment {key} mounts volumes"
                ),
            });
        }
        if deployment.state.rejects_scale() {
            return Err(DeploymentError::ScaleRejected {
                message: format!("cannot scale deployment {key} in state {}", deployment.state),
            });
        }

        let mut resized = deployment.clone();
        resized.template.scale = scale;
        let (cpu, mem) = self.reservation_envelope(&resized).await?;
        let mut rollback = Rollback::new(self);
        self.admission
            .reserve(&deployment.deployment_id, cpu, mem, self.reservation_ttl())
            .await
            .map_err(|e| DeploymentError::collaborator(StatusCode::ReserveResource, e))?;
        rollback.push(Reserved::Resized {
            cpu: deployment.cpu,
            mem: deployment.mem,
        });

        if let Err(e) = self.runtime.scale(&deployment, scale.min).await {
            let error = DeploymentError::collaborator(StatusCode::ScalingDeployment, e);
            rollback.drain(&deployment).await;
            let detail = TerminalStatus::new(StatusCode::ScalingDeployment, error.to_string());
            self.mark(&mut deployment, DeploymentState::Error, Some(detail))
                .await?;
            return Err(error);
        }

        deployment.template.scale = scale;
        deployment.cpu = cpu;
        deployment.mem = mem;
        if deployment.state == DeploymentState::Upgrading {
            deployment.updated_at = Utc::now();
            self.store.upsert(&deployment).await?;
        } else {
            self.mark(&mut deployment, DeploymentState::Waiting, None)
                .await?;
        }
        self.publish(events::DEPLOYMENT_SCALED, &deployment).await;
        Ok(deployment)
    }

    /// Scale to zero, keeping the reservation
    pub async fn stop(&self, key: &str) -> DeploymentResult<Deployment> {
        let _guard = self.locks.lock(key).await;
        let mut deployment = self.get(key).await?;
        self.stop_locked(&mut deployment).await?;
        Ok(deployment)
    }

    pub(crate) async fn stop_locked(&self, deployment: &mut Deployment) -> DeploymentResult<()> {
        Self::check(deployment, DeploymentState::Stopped)?;
        if deployment.state == DeploymentState::Stopped {
            return Ok(());
        }
        if deployment.state != DeploymentState::Stopping {
            self.mark(deployment, DeploymentState::Stopping, None).await?;
        }

        if let Err(e) = self.runtime.scale(deployment, 0).await {
            let error = DeploymentError::collaborator(StatusCode::ScalingDeployment, e);
            let detail = TerminalStatus::new(StatusCode::ScalingDeployment, error.to_string());
            self.mark(deployment, DeploymentState::Stopping, Some(detail))
                .await?;
            return Err(error);
        }

        self.mark(deployment, DeploymentState::Stopped, None).await?;
        self.instances.clear(&deployment.key());
        Ok(())
    }

    /// Scale a stopped deployment back to its configured minimum
    pub async fn start(&self, key: &str) -> DeploymentResult<Deployment> {
        let _guard = self.locks.lock(key).await;
        let mut deployment = self.get(key).await?;
        if deployment.state != DeploymentState::Stopped {
            return Err(StateMachineError::InvalidStateTransition {
                from: deployment.state.to_string(),
                to: "Started".to_string(),
            }
            .into());
        }
        self.instances.register(key);

        if let Err(e) = self
            .runtime
            .scale(&deployment, deployment.min_scale())
            .await
        {
            let error = DeploymentError::collaborator(StatusCode::ScalingDeployment, e);
            let detail = TerminalStatus::new(StatusCode::ScalingDeployment, error.to_string());
            self.mark(&mut deployment, DeploymentState::Stopped, Some(detail))
                .await?;
            return Err(error);
        }

        self.mark(&mut deployment, DeploymentState::Waiting, None)
            .await?;
        Ok(deployment)
    }

    /// Release everything the deployment holds and archive it
    pub async fn terminate(
        &self,
        key: &str,
        detail: Option<TerminalStatus>,
    ) -> DeploymentResult<Deployment> {
        let _guard = self.locks.lock(key).await;
        let mut deployment = self.get(key).await?;
        self.terminate_locked(&mut deployment, detail).await?;
        Ok(deployment)
    }

    pub(crate) async fn terminate_locked(
        &self,
        deployment: &mut Deployment,
        detail: Option<TerminalStatus>,
    ) -> DeploymentResult<()> {
        Self::check(deployment, DeploymentState::Terminated)?;
        if deployment.state == DeploymentState::Terminated {
            return Ok(());
        }
        // Init goes straight to Terminated once everything is released
        let from_init = deployment.state == DeploymentState::Init;
        if !from_init && deployment.state != DeploymentState::Terminating {
            self.mark(deployment, DeploymentState::Terminating, detail.clone())
                .await?;
        }
        let key = deployment.key();
        self.instances.unregister(&key);

        let released: Result<(), (StatusCode, CollaboratorError)> = async {
            if !deployment.template.fixtures.is_empty() || deployment.has_volumes() {
                self.fixtures
                    .release(deployment)
                    .await
                    .map_err(|e| (StatusCode::ReleasingFixture, e))?;
            }
            self.admission
                .release(&deployment.deployment_id)
                .await
                .map_err(|e| (StatusCode::ReleaseResource, e))?;
            self.runtime
                .delete(deployment)
                .await
                .map_err(|e| (StatusCode::DeletingDeployment, e))
        }
        .await;

        if let Err((step, e)) = released {
            let error = DeploymentError::collaborator(step, e);
            if !from_init {
                let status = TerminalStatus::new(step, error.to_string());
                self.mark(deployment, DeploymentState::Terminating, Some(status))
                    .await?;
            }
            return Err(error);
        }

        let detail = detail.unwrap_or_else(|| {
            deployment
                .status_detail
                .clone()
                .unwrap_or_else(|| TerminalStatus::new(StatusCode::DeletingDeployment, "deployment is terminated"))
        });
        self.mark(deployment, DeploymentState::Terminated, Some(detail))
            .await?;
        self.history.archive(&deployment.to_archive()?).await?;
        self.publish(events::DEPLOYMENT_TERMINATED, deployment).await;
        log_deployment_operation("terminate", &key, "Terminated", None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::collaborators::{
        InMemoryAdmission, InMemoryDeploymentRuntime, InMemoryDeploymentStore,
        InMemoryFixtureManager,
    };
    use crate::deployment::test_support::deployment_with;
    use crate::persistence::InMemoryWorkflowArchive;
    use crate::template::VolumeRequirement;

    struct Harness {
        manager: DeploymentManager,
        fixtures: Arc<InMemoryFixtureManager>,
        admission: Arc<InMemoryAdmission>,
        runtime: Arc<InMemoryDeploymentRuntime>,
        history: Arc<InMemoryWorkflowArchive>,
    }

    fn harness() -> Harness {
        let fixtures = Arc::new(InMemoryFixtureManager::new());
        let admission = Arc::new(InMemoryAdmission::new());
        let runtime = Arc::new(InMemoryDeploymentRuntime::new());
        let history = Arc::new(InMemoryWorkflowArchive::default());
        let manager = DeploymentManager::new(
            Arc::new(InMemoryDeploymentStore::new()),
            fixtures.clone(),
            admission.clone(),
            runtime.clone(),
            history.clone(),
            EventPublisher::new(64),
            DeploymentConfig::default(),
        );
        Harness {
            manager,
            fixtures,
            admission,
            runtime,
            history,
        }
    }

    fn with_volume(mut deployment: Deployment) -> Deployment {
        deployment.template.volumes.insert(
            "data".into(),
            VolumeRequirement {
                name: Some("data".into()),
                ..Default::default()
            },
        );
        deployment
    }

    #[tokio::test]
    async fn test_create_reserves_and_waits() {
        let h = harness();
        let deployment = h
            .manager
            .create(deployment_with(2, "1", "256", None))
            .await
            .unwrap();

        assert_eq!(deployment.state, DeploymentState::Waiting);
        let reservation = h.admission.reservation(&deployment.deployment_id).unwrap();
        assert_eq!((reservation.cpu, reservation.mem), (2.0, 512.0));
        assert_eq!(h.runtime.replicas(&deployment.deployment_id), Some(2));
        assert!(h.manager.instances().is_registered(&deployment.key()));
    }

    #[tokio::test]
    async fn test_client_error_terminates_and_releases() {
        let h = harness();
        h.runtime
            .fail_next("create", CollaboratorError::new(400, "invalid image"));
        let deployment = with_volume(deployment_with(1, "1", "64", None));
        let key = deployment.key();
        let id = deployment.deployment_id.clone();

        let err = h.manager.create(deployment).await.unwrap_err();
        assert!(matches!(
            err,
            DeploymentError::Collaborator {
                step: StatusCode::CreatingDeployment,
                ..
            }
        ));

        let stored = h.manager.get(&key).await.unwrap();
        assert_eq!(stored.state, DeploymentState::Terminated);
        assert_eq!(
            stored.status_detail.unwrap().code,
            StatusCode::CreatingDeployment
        );
        assert!(h.admission.reservation(&id).is_none());
        assert!(!h.fixtures.is_reserved(&id));
        assert!(!h.manager.instances().is_registered(&key));
    }

    #[tokio::test]
    async fn test_server_error_stays_in_init() {
        let h = harness();
        h.runtime
            .fail_next("create", CollaboratorError::new(503, "apiserver unavailable"));
        let deployment = deployment_with(1, "1", "64", None);
        let key = deployment.key();
        let id = deployment.deployment_id.clone();

        assert!(h.manager.create(deployment).await.is_err());
        let stored = h.manager.get(&key).await.unwrap();
        assert_eq!(stored.state, DeploymentState::Init);
        assert!(h.admission.reservation(&id).is_some());
    }

    #[tokio::test]
    async fn test_not_enough_resource_is_terminal() {
        let h = harness();
        h.admission
            .fail_next("reserve", CollaboratorError::new(500, "not enough cpu"));
        let deployment = deployment_with(1, "8", "64", None);
        let key = deployment.key();

        let err = h.manager.create(deployment).await.unwrap_err();
        assert_eq!(err.status_code(), Some(StatusCode::NotEnoughResource));
        let stored = h.manager.get(&key).await.unwrap();
        assert_eq!(stored.state, DeploymentState::Terminated);
        assert_eq!(
            stored.status_detail.unwrap().code,
            StatusCode::NotEnoughResource
        );
    }

    #[tokio::test]
    async fn test_scale_rules() {
        let h = harness();
        let deployment = h
            .manager
            .create(with_volume(deployment_with(1, "1", "64", None)))
            .await
            .unwrap();
        let key = deployment.key();

        let err = h
            .manager
            .scale(&key, Scale { min: 3, max: None })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("scale past 1 instance"));

        let plain = h
            .manager
            .create(deployment_with(1, "1", "64", None))
            .await
            .unwrap();
        let scaled = h
            .manager
            .scale(&plain.key(), Scale { min: 3, max: None })
            .await
            .unwrap();
        assert_eq!(scaled.min_scale(), 3);
        assert_eq!(scaled.cpu, 3.0);
        assert_eq!(h.runtime.replicas(&plain.deployment_id), Some(3));

        h.manager.stop(&plain.key()).await.unwrap();
        let err = h
            .manager
            .scale(&plain.key(), Scale { min: 2, max: None })
            .await
            .unwrap_err();
        assert!(matches!(err, DeploymentError::ScaleRejected { .. }));
    }

    #[tokio::test]
    async fn test_scale_while_upgrading() {
        let h = harness();
        let mut current = h
            .manager
            .create(deployment_with(5, "1", "100", Some(("rolling_update", "2", "0"))))
            .await
            .unwrap();
        h.manager
            .mark(&mut current, DeploymentState::Active, None)
            .await
            .unwrap();
        let next = current.next_generation(deployment_with(5, "1", "100", None).template);
        let upgraded = h.manager.upgrade(next).await.unwrap();

        let scaled = h
            .manager
            .scale(&upgraded.key(), Scale { min: 6, max: None })
            .await
            .unwrap();
        assert_eq!(scaled.state, DeploymentState::Upgrading);
        assert_eq!(scaled.min_scale(), 6);
        assert_eq!(h.runtime.replicas(&scaled.deployment_id), Some(6));
        // still sized over the previous generation
        assert_eq!((scaled.cpu, scaled.mem), (7.0, 700.0));
        let held = h.admission.reservation(&scaled.deployment_id).unwrap();
        assert_eq!((held.cpu, held.mem), (scaled.cpu, scaled.mem));
    }

    #[tokio::test]
    async fn test_scale_failure_restores_reservation() {
        let h = harness();
        let deployment = h
            .manager
            .create(deployment_with(2, "1", "64", None))
            .await
            .unwrap();
        h.runtime
            .fail_next("scale", CollaboratorError::new(500, "apiserver timeout"));

        let err = h
            .manager
            .scale(&deployment.key(), Scale { min: 4, max: None })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(StatusCode::ScalingDeployment));

        let held = h.admission.reservation(&deployment.deployment_id).unwrap();
        assert_eq!((held.cpu, held.mem), (2.0, 128.0));
        let requests = h.admission.requests();
        assert_eq!(requests[requests.len() - 2].1.cpu, 4.0);

        let stored = h.manager.get(&deployment.key()).await.unwrap();
        assert_eq!(stored.state, DeploymentState::Error);
        assert_eq!(stored.min_scale(), 2);
        assert_eq!((stored.cpu, stored.mem), (2.0, 128.0));
        assert_eq!(h.runtime.replicas(&deployment.deployment_id), Some(2));
    }

    #[tokio::test]
    async fn test_stop_start_keeps_reservation() {
        let h = harness();
        let deployment = h
            .manager
            .create(deployment_with(2, "1", "64", None))
            .await
            .unwrap();
        let key = deployment.key();

        let stopped = h.manager.stop(&key).await.unwrap();
        assert_eq!(stopped.state, DeploymentState::Stopped);
        assert_eq!(h.runtime.replicas(&deployment.deployment_id), Some(0));
        assert!(h.admission.reservation(&deployment.deployment_id).is_some());

        let started = h.manager.start(&key).await.unwrap();
        assert_eq!(started.state, DeploymentState::Waiting);
        assert_eq!(h.runtime.replicas(&deployment.deployment_id), Some(2));
    }

    #[tokio::test]
    async fn test_upgrade_reserves_envelope_then_shrinks() {
        let h = harness();
        let mut current = h
            .manager
            .create(deployment_with(5, "1", "100", Some(("rolling_update", "2", "0"))))
            .await
            .unwrap();
        h.manager
            .mark(&mut current, DeploymentState::Active, None)
            .await
            .unwrap();
        let next = current.next_generation(deployment_with(5, "1", "100", None).template);

        let upgraded = h.manager.upgrade(next).await.unwrap();
        assert_eq!(upgraded.state, DeploymentState::Upgrading);
        assert_eq!(upgraded.previous_id, Some(current.id));

        let requests = h.admission.requests();
        let envelope = requests[requests.len() - 2].1;
        assert_eq!((envelope.cpu, envelope.mem), (7.0, 700.0));
        let settled = requests[requests.len() - 1].1;
        assert_eq!((settled.cpu, settled.mem), (5.0, 500.0));
        assert!(h.history.get(current.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_upgrade_rejected_from_init() {
        let h = harness();
        h.runtime
            .fail_next("create", CollaboratorError::new(503, "busy"));
        let deployment = deployment_with(1, "1", "64", None);
        let _ = h.manager.create(deployment.clone()).await;

        let err = h
            .manager
            .upgrade(deployment.next_generation(deployment.template.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, DeploymentError::StateMachine(_)));

        let err = h.manager.start(&deployment.key()).await.unwrap_err();
        assert!(matches!(err, DeploymentError::StateMachine(_)));

        let terminated = h.manager.terminate(&deployment.key(), None).await.unwrap();
        assert_eq!(terminated.state, DeploymentState::Terminated);
    }

    #[tokio::test]
    async fn test_terminate_releases_and_archives() {
        let h = harness();
        let deployment = h
            .manager
            .create(with_volume(deployment_with(1, "1", "64", None)))
            .await
            .unwrap();
        assert!(h.fixtures.is_reserved(&deployment.deployment_id));

        let terminated = h.manager.terminate(&deployment.key(), None).await.unwrap();
        assert_eq!(terminated.state, DeploymentState::Terminated);
        assert!(h.admission.reservation(&deployment.deployment_id).is_none());
        assert!(!h.fixtures.is_reserved(&deployment.deployment_id));
        assert_eq!(h.runtime.replicas(&deployment.deployment_id), None);

        let archived = h.history.get(deployment.id).await.unwrap().unwrap();
        assert_eq!(archived.phase, "Terminated");

        // terminating twice is a no-op
        h.manager.terminate(&deployment.key(), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_retries_after_runtime_failure() {
        let h = harness();
        let deployment = h
            .manager
            .create(deployment_with(1, "1", "64", None))
            .await
            .unwrap();
        h.runtime
            .fail_next("delete", CollaboratorError::new(500, "timeout"));

        assert!(h.manager.terminate(&deployment.key(), None).await.is_err());
        let stored = h.manager.get(&deployment.key()).await.unwrap();
        assert_eq!(stored.state, DeploymentState::Terminating);
        assert_eq!(
            stored.status_detail.unwrap().code,
            StatusCode::DeletingDeployment
        );

        let terminated = h.manager.terminate(&deployment.key(), None).await.unwrap();
        assert_eq!(terminated.state, DeploymentState::Terminated);
    }
}
