use thiserror::Error;

use crate::constants::StatusCode;
use crate::error::ErrorKind;
use crate::persistence::PersistenceError;
use crate::state_machine::StateMachineError;
use crate::template::TemplateError;

/// Failure reported by a fixture manager, admission controller or runtime
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{status}: {message}")]
pub struct CollaboratorError {
    pub status: u16,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// 4xx: the request itself is wrong and retrying will not help
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status) && self.status != 429
    }

    /// Admission refused for lack of capacity
    pub fn is_not_enough_resource(&self) -> bool {
        self.message.contains("not enough")
    }
}

#[derive(Error, Debug)]
pub enum DeploymentError {
    #[error("deployment {key} not found")]
    NotFound { key: String },

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error("{message}")]
    ScaleRejected { message: String },

    #[error("deployments cannot request dynamic fixture {name}")]
    DynamicFixture { name: String },

    #[error("{step} failed: {source}")]
    Collaborator {
        step: StatusCode,
        #[source]
        source: CollaboratorError,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("failed to encode deployment {key}: {message}")]
    Serialization { key: String, message: String },
}

impl DeploymentError {
    pub fn collaborator(step: StatusCode, source: CollaboratorError) -> Self {
        Self::Collaborator { step, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::StateMachine(e) => e.kind(),
            Self::ScaleRejected { .. } | Self::DynamicFixture { .. } => ErrorKind::Validation,
            Self::Collaborator { source, .. } if source.is_not_enough_resource() => ErrorKind::Quota,
            Self::Collaborator { source, .. } if source.status == 404 => ErrorKind::NotFound,
            Self::Collaborator { source, .. } if source.is_client_error() => {
                ErrorKind::PermanentRemote
            }
            Self::Collaborator { .. } => ErrorKind::Transient,
            Self::Template(e) => e.kind(),
            Self::Persistence(e) => e.kind(),
            Self::Serialization { .. } => ErrorKind::Internal,
        }
    }

    /// The status code recorded on the deployment when this error ends an operation
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Collaborator { source, .. } if source.is_not_enough_resource() => {
                Some(StatusCode::NotEnoughResource)
            }
            Self::Collaborator { step, .. } => Some(*step),
            Self::DynamicFixture { .. } => Some(StatusCode::ReservingFixture),
            _ => None,
        }
    }
}

pub type DeploymentResult<T> = Result<T, DeploymentError>;
