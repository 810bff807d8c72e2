use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::TerminalStatus;
use crate::heartbeat::PodStatus;
use crate::persistence::ArchivedWorkflow;
use crate::state_machine::DeploymentState;
use crate::template::{Arguments, EmbeddedDeployment, FixtureAssignments};

use super::errors::{DeploymentError, DeploymentResult};

/// One generation of a deployment.
///
/// `id` changes with every upgrade; `deployment_id` stays the same for the
/// life of the deployment and keys its admission reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub deployment_id: String,
    pub application_name: String,
    pub name: String,
    pub template: EmbeddedDeployment,
    #[serde(default)]
    pub arguments: Arguments,
    #[serde(default)]
    pub state: DeploymentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_detail: Option<TerminalStatus>,
    #[serde(default)]
    pub fixtures: FixtureAssignments,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<Uuid>,
    pub launched_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Reserved cpu cores at the current scale
    #[serde(default)]
    pub cpu: f64,
    /// Reserved memory MiB at the current scale
    #[serde(default)]
    pub mem: f64,
    #[serde(default)]
    pub cost_cents: f64,
}

impl Deployment {
    pub fn new(
        application_name: impl Into<String>,
        name: impl Into<String>,
        template: EmbeddedDeployment,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            deployment_id: Uuid::new_v4().to_string(),
            application_name: application_name.into(),
            name: name.into(),
            template,
            arguments: Arguments::new(),
            state: DeploymentState::Init,
            status_detail: None,
            fixtures: FixtureAssignments::new(),
            previous_id: None,
            launched_at: now,
            updated_at: now,
            cpu: 0.0,
            mem: 0.0,
            cost_cents: 0.0,
        }
    }

    /// A new generation of this deployment with a different template
    pub fn next_generation(&self, template: EmbeddedDeployment) -> Self {
        Self {
            id: Uuid::new_v4(),
            template,
            previous_id: Some(self.id),
            status_detail: None,
            fixtures: FixtureAssignments::new(),
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// `application/name`; the lock and heartbeat key
    pub fn key(&self) -> String {
        format!("{}/{}", self.application_name, self.name)
    }

    pub fn min_scale(&self) -> u32 {
        self.template.scale.min
    }

    pub fn has_volumes(&self) -> bool {
        !self.template.volumes.is_empty()
    }

    pub fn run_seconds(&self, now: DateTime<Utc>) -> f64 {
        (now - self.launched_at).num_milliseconds().max(0) as f64 / 1000.0
    }

    pub fn to_archive(&self) -> DeploymentResult<ArchivedWorkflow> {
        let body = serde_json::to_value(self).map_err(|e| DeploymentError::Serialization {
            key: self.key(),
            message: e.to_string(),
        })?;
        Ok(ArchivedWorkflow {
            uid: self.id,
            name: self.name.clone(),
            namespace: self.application_name.clone(),
            phase: self.state.to_string(),
            started_at: Some(self.launched_at),
            finished_at: self.state.is_terminal().then_some(self.updated_at),
            workflow: body,
        })
    }

    pub fn from_archive(archived: &ArchivedWorkflow) -> DeploymentResult<Self> {
        serde_json::from_value(archived.workflow.clone()).map_err(|e| {
            DeploymentError::Serialization {
                key: format!("{}/{}", archived.namespace, archived.name),
                message: e.to_string(),
            }
        })
    }
}

/// What the runtime reports about a deployment's workload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub desired_replicas: u32,
    pub available_replicas: u32,
    #[serde(default)]
    pub pods: Vec<PodStatus>,
    /// `(reason, message)` of pods that failed to start
    #[serde(default)]
    pub failures: Vec<(String, String)>,
}

impl RuntimeStatus {
    pub fn is_healthy(&self, min_scale: u32) -> bool {
        self.available_replicas == self.desired_replicas && self.pods.len() >= min_scale as usize
    }
}
