//! Workflow object, its status and the node tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::artifacts::Artifact;
use crate::constants::TerminalStatus;
use crate::objects::ObjectMeta;
use crate::repository::{ArtifactRepositoryRef, ArtifactRepositoryRefStatus};
use crate::state_machine::{NodePhase, WorkflowPhase};
use crate::template::{Arguments, EmbeddedTemplate, FixtureAssignments};

/// Node id to node status
pub type Nodes = BTreeMap<String, NodeStatus>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeType {
    /// A container run as a pod
    #[default]
    Pod,
    /// A workflow template: sequential step groups
    Steps,
    /// One parallel step group
    StepGroup,
    /// Attempts of one container step
    Retry,
    /// Step executed by an agent through the task set
    Task,
    /// Dynamic fixture containers run before the first step group
    Fixtures,
    /// A step flagged `skipped`
    Skipped,
}

/// Parameters and artifacts flowing in or out of a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeIo {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl NodeIo {
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.artifacts.is_empty()
    }

    pub fn artifact(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }

    /// Insert or replace an artifact by name, keeping names sorted
    pub fn upsert_artifact(&mut self, artifact: Artifact) {
        self.artifacts.retain(|a| a.name != artifact.name);
        self.artifacts.push(artifact);
        self.artifacts.sort_by(|a, b| a.name.cmp(&b.name));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub id: String,
    /// Fully qualified name, e.g. `ci[0].build(1)`
    pub name: String,
    #[serde(default)]
    pub node_type: NodeType,
    pub template_name: String,
    pub phase: NodePhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    /// Leaf descendants the next step group depends on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbound: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<NodeIo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<NodeIo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    /// Failure tolerated through the step's `ignore_error` flag
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ignored: bool,
    /// Requested CPU cores, for the cost model
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cpu_cores: f64,
    /// Requested memory in MiB, for the cost model
    #[serde(default, skip_serializing_if = "is_zero")]
    pub mem_mib: f64,
}

fn is_zero(value: &f64) -> bool {
    *value == 0.0
}

impl NodeStatus {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        template_name: impl Into<String>,
        phase: NodePhase,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            node_type: NodeType::Pod,
            template_name: template_name.into(),
            phase,
            children: Vec::new(),
            outbound: Vec::new(),
            inputs: None,
            outputs: None,
            started_at: None,
            finished_at: None,
            message: None,
            pod_name: None,
            ignored: false,
            cpu_cores: 0.0,
            mem_mib: 0.0,
        }
    }

    pub fn with_type(mut self, node_type: NodeType) -> Self {
        self.node_type = node_type;
        self
    }

    /// Completed successfully, or failed with the failure ignored
    pub fn counts_as_success(&self) -> bool {
        self.phase.is_successful() || (self.phase.is_completed() && self.ignored)
    }

    pub fn add_child(&mut self, child_id: &str) {
        if !self.children.iter().any(|c| c == child_id) {
            self.children.push(child_id.to_string());
        }
    }

    /// Seconds between start and finish, or until `now` while running
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> f64 {
        match self.started_at {
            Some(started) => {
                let end = self.finished_at.unwrap_or(now);
                (end - started).num_milliseconds().max(0) as f64 / 1000.0
            }
            None => 0.0,
        }
    }
}

/// Deterministic node id for a node name within a workflow
pub fn node_id(workflow_uid: Uuid, node_name: &str) -> String {
    Uuid::new_v5(&workflow_uid, node_name.as_bytes()).to_string()
}

/// When a completed workflow is deleted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtlStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_after_completion: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_after_success: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_after_failure: Option<u64>,
}

impl TtlStrategy {
    pub fn is_set(&self) -> bool {
        self.seconds_after_completion.is_some()
            || self.seconds_after_success.is_some()
            || self.seconds_after_failure.is_some()
    }

    /// TTL for a completed phase: failure, then success, then completion
    pub fn ttl_for(&self, phase: WorkflowPhase) -> Option<u64> {
        let specific = match phase {
            WorkflowPhase::Failed | WorkflowPhase::Error => self.seconds_after_failure,
            WorkflowPhase::Succeeded => self.seconds_after_success,
            _ => None,
        };
        specific.or(self.seconds_after_completion)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    /// Entrypoint: an embedded workflow or container
    pub template: EmbeddedTemplate,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub arguments: Arguments,
    /// Attributes of managed fixtures assigned to this run
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fixtures: FixtureAssignments,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub suspend: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub terminate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_repository_ref: Option<ArtifactRepositoryRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_strategy: Option<TtlStrategy>,
    /// Attempts per container step; the controller default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<u32>,
}

impl WorkflowSpec {
    pub fn new(template: EmbeddedTemplate) -> Self {
        Self {
            template,
            arguments: Arguments::new(),
            fixtures: FixtureAssignments::new(),
            suspend: false,
            terminate: false,
            artifact_repository_ref: None,
            ttl_strategy: None,
            retry_limit: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    #[serde(default)]
    pub phase: WorkflowPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: Nodes,
    /// Set when `nodes` lives in the offload store instead of the object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offload_node_status_version: Option<String>,
    /// Repository chosen on the first reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_repository_ref: Option<ArtifactRepositoryRefStatus>,
    /// Entrypoint after argument substitution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_template: Option<EmbeddedTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<TerminalStatus>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub estimated_cost_cents: f64,
    /// Generation the status was computed for
    #[serde(default)]
    pub observed_generation: u64,
}

impl WorkflowStatus {
    pub fn is_offloaded(&self) -> bool {
        self.offload_node_status_version.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub metadata: ObjectMeta,
    pub spec: WorkflowSpec,
    #[serde(default)]
    pub status: WorkflowStatus,
}

impl Workflow {
    pub fn new(metadata: ObjectMeta, spec: WorkflowSpec) -> Self {
        Self {
            metadata,
            spec,
            status: WorkflowStatus::default(),
        }
    }

    pub fn uid(&self) -> Uuid {
        self.metadata.uid
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn is_completed(&self) -> bool {
        self.status.phase.is_completed()
    }

    pub fn node_by_name(&self, name: &str) -> Option<&NodeStatus> {
        self.status.nodes.get(&node_id(self.uid(), name))
    }
}
