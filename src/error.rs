//! # Error Handling
//!
//! Crate-wide error classification and the top-level error wrapper.
//!
//! Every component owns its own `thiserror` enum. Each of those enums maps onto
//! an [`ErrorKind`], which is what retry loops and status reporting consult.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::artifacts::ArtifactError;
use crate::config::ConfigurationError;
use crate::deployment::DeploymentError;
use crate::gc::GcError;
use crate::heartbeat::HeartbeatError;
use crate::persistence::PersistenceError;
use crate::plugin::PluginError;
use crate::repository::RepositoryError;
use crate::state_machine::StateMachineError;
use crate::taskset::TaskSetError;
use crate::template::TemplateError;
use crate::workflow::WorkflowError;

/// Conceptual error kinds shared by every component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Template structure, parameter resolution, CIDR, resource limits, state transitions
    Validation,
    /// Workflow, template, object-store key or persistence row is missing
    NotFound,
    /// Network, rate limiting, SQL contention, object-store 5xx
    Transient,
    /// 4xx other than 429/404
    PermanentRemote,
    /// Admission rejected; retried at the workflow level but surfaced on the node
    Quota,
    /// Marshaling failures and invariant violations
    Internal,
}

impl ErrorKind {
    /// Whether the owner of the retry budget should try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Quota)
    }

    /// Whether the error should short-circuit upward and become user visible
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::NotFound => write!(f, "not_found"),
            Self::Transient => write!(f, "transient"),
            Self::PermanentRemote => write!(f, "permanent_remote"),
            Self::Quota => write!(f, "quota"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Top-level error for callers that drive several components at once
#[derive(Debug, Error)]
pub enum FlowmillError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Deployment(#[from] DeploymentError),

    #[error(transparent)]
    Heartbeat(#[from] HeartbeatError),

    #[error(transparent)]
    Gc(#[from] GcError),

    #[error(transparent)]
    TaskSet(#[from] TaskSetError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl FlowmillError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Template(e) => e.kind(),
            Self::Artifact(e) => e.kind(),
            Self::Repository(e) => e.kind(),
            Self::Persistence(e) => e.kind(),
            Self::StateMachine(e) => e.kind(),
            Self::Workflow(e) => e.kind(),
            Self::Deployment(e) => e.kind(),
            Self::Heartbeat(e) => e.kind(),
            Self::Gc(e) => e.kind(),
            Self::TaskSet(e) => e.kind(),
            Self::Plugin(e) => e.kind(),
            Self::Configuration(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowmillError>;
