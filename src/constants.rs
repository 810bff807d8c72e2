//! # System Constants
//!
//! Event names, well-known labels and annotations, timing boundaries and the
//! terminal status codes surfaced on workflows and deployments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle events published through the [`EventPublisher`](crate::events::EventPublisher)
pub mod events {
    // Workflow lifecycle events
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_SUCCEEDED: &str = "workflow.succeeded";
    pub const WORKFLOW_FAILED: &str = "workflow.failed";
    pub const WORKFLOW_ERRORED: &str = "workflow.errored";
    pub const WORKFLOW_SUSPENDED: &str = "workflow.suspended";
    pub const WORKFLOW_RESUMED: &str = "workflow.resumed";
    pub const WORKFLOW_TERMINATED: &str = "workflow.terminated";
    pub const WORKFLOW_RETRIED: &str = "workflow.retried";
    pub const WORKFLOW_OFFLOADED: &str = "workflow.offloaded";

    // Node lifecycle events
    pub const NODE_PHASE_CHANGED: &str = "node.phase_changed";
    pub const NODE_RETRY_SCHEDULED: &str = "node.retry_scheduled";

    // Deployment lifecycle events
    pub const DEPLOYMENT_STATE_CHANGED: &str = "deployment.state_changed";
    pub const DEPLOYMENT_CREATED: &str = "deployment.created";
    pub const DEPLOYMENT_UPGRADED: &str = "deployment.upgraded";
    pub const DEPLOYMENT_SCALED: &str = "deployment.scaled";
    pub const DEPLOYMENT_TERMINATED: &str = "deployment.terminated";

    // Garbage collection events
    pub const GC_WORKFLOW_DELETED: &str = "gc.workflow_deleted";
    pub const GC_ARTIFACTS_DELETED: &str = "gc.artifacts_deleted";
    pub const GC_OFFLOAD_DELETED: &str = "gc.offload_deleted";
}

/// Labels, annotations and finalizers understood by the controller
pub mod labels {
    pub const ARTIFACT_GC_FINALIZER: &str = "workflows.flowmill.io/artifact-gc";
    pub const DEFAULT_ARTIFACT_REPOSITORY: &str = "default-artifact-repository";
    pub const CONFIGMAP_TYPE: &str = "configmap-type";
    pub const EXECUTOR_PLUGIN: &str = "ExecutorPlugin";
    pub const WORKFLOW_UID: &str = "workflows.flowmill.io/workflow-uid";
    pub const NODE_ID: &str = "workflows.flowmill.io/node-id";
    pub const DEPLOYMENT_ID: &str = "deployments.flowmill.io/deployment-id";
}

/// Timing boundaries for controllers and remote calls
pub mod timing {
    use std::time::Duration;

    pub const DEPLOYMENT_INIT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
    pub const DEPLOYMENT_MONITOR_INTERVAL: Duration = Duration::from_secs(60);
    pub const RESERVATION_EXTENDER_INTERVAL: Duration = Duration::from_secs(20 * 60);
    pub const HEART_BEAT_GRACE_PERIOD: Duration = Duration::from_secs(3 * 60);
    pub const INSTANCE_CACHE_TTL: Duration = Duration::from_secs(120);
    pub const OBJECT_STORE_LIST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const SQL_QUERY_TIMEOUT: Duration = Duration::from_secs(60);
    pub const RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(300);
    pub const TTL_EXTRA_DELAY: Duration = Duration::from_secs(1);
}

/// Supported template schema version
pub const SUPPORTED_TEMPLATE_VERSION: u32 = 1;

/// Recursion bound when following workflow step references
pub const MAX_TEMPLATE_DEPTH: usize = 50;

/// Maximum length of a DNS-1123 label
pub const MAX_DNS_LABEL_LENGTH: usize = 63;

/// Maximum length of an external route DNS name
pub const MAX_EXTERNAL_DNS_NAME_LENGTH: usize = 2000;

/// Stable terminal codes surfaced on workflow and deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    CreatingDeployment,
    DeletingDeployment,
    ReservingFixture,
    ReleasingFixture,
    DeploymentDegraded,
    InstanceComingUp,
    InstanceScalingDown,
    DeploymentTimeout,
    ScalingDeployment,
    ReserveResource,
    ReleaseResource,
    NotEnoughResource,
    UpgradingDeployment,
    LimitSpendingExceeded,
    LimitTimeExceeded,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreatingDeployment => "CreatingDeployment",
            Self::DeletingDeployment => "DeletingDeployment",
            Self::ReservingFixture => "ReservingFixture",
            Self::ReleasingFixture => "ReleasingFixture",
            Self::DeploymentDegraded => "DeploymentDegraded",
            Self::InstanceComingUp => "InstanceComingUp",
            Self::InstanceScalingDown => "InstanceScalingDown",
            Self::DeploymentTimeout => "DeploymentTimeout",
            Self::ScalingDeployment => "ScalingDeployment",
            Self::ReserveResource => "ReserveResource",
            Self::ReleaseResource => "ReleaseResource",
            Self::NotEnoughResource => "NotEnoughResource",
            Self::UpgradingDeployment => "UpgradingDeployment",
            Self::LimitSpendingExceeded => "LimitSpendingExceeded",
            Self::LimitTimeExceeded => "LimitTimeExceeded",
        };
        write!(f, "{name}")
    }
}

/// User-visible failure record: `{code, message, detail}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalStatus {
    pub code: StatusCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl TerminalStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {} ({detail})", self.code, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}
