use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::persistence::PersistenceError;
use crate::repository::RepositoryError;
use crate::state_machine::StateMachineError;
use crate::taskset::TaskSetError;
use crate::template::TemplateError;

/// Failures of the pod runtime and object store collaborators
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("conflict updating {name}: {message}")]
    Conflict { name: String, message: String },

    #[error("admission rejected: {message}")]
    Quota { message: String },

    #[error("runtime temporarily unavailable: {message}")]
    Transient { message: String },

    #[error("runtime rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } | Self::Transient { .. } => ErrorKind::Transient,
            Self::Quota { .. } => ErrorKind::Quota,
            Self::Rejected { .. } => ErrorKind::PermanentRemote,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("workflow {uid} not found")]
    NotFound { uid: Uuid },

    #[error("workflow {uid} is already completed")]
    AlreadyCompleted { uid: Uuid },

    #[error("workflow {uid} has not completed; only completed workflows can be retried")]
    NotCompleted { uid: Uuid },

    #[error("unresolvable parameter {name} in step {step}")]
    UnresolvedParameter { step: String, name: String },

    #[error("artifact repository required by {artifact} is not configured")]
    RepositoryRequired { artifact: String },

    #[error("node status of {uid} is {size} bytes, above {threshold}, and offloading is disabled")]
    TooLarge {
        uid: Uuid,
        size: usize,
        threshold: usize,
    },

    #[error("invalid termination message: {message}")]
    InvalidTerminationMessage { message: String },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    TaskSet(#[from] TaskSetError),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyCompleted { .. }
            | Self::NotCompleted { .. }
            | Self::UnresolvedParameter { .. }
            | Self::RepositoryRequired { .. }
            | Self::TooLarge { .. } => ErrorKind::Validation,
            Self::InvalidTerminationMessage { .. } => ErrorKind::Internal,
            Self::Template(e) => e.kind(),
            Self::Repository(e) => e.kind(),
            Self::Persistence(e) => e.kind(),
            Self::StateMachine(e) => e.kind(),
            Self::Runtime(e) => e.kind(),
            Self::TaskSet(e) => e.kind(),
        }
    }

    /// Errors that fail the workflow instead of retrying the reconcile
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Template(_)
            | Self::UnresolvedParameter { .. }
            | Self::RepositoryRequired { .. }
            | Self::TooLarge { .. } => true,
            Self::Repository(e) => !e.kind().is_retryable(),
            _ => false,
        }
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let quota = WorkflowError::from(RuntimeError::Quota {
            message: "exceeded quota: pods".into(),
        });
        assert_eq!(quota.kind(), ErrorKind::Quota);
        assert!(!quota.is_fatal());

        let template = WorkflowError::from(TemplateError::invalid("bad step"));
        assert!(template.is_fatal());

        let sql = WorkflowError::from(PersistenceError::Timeout {
            operation: "offload.get".into(),
            seconds: 60,
        });
        assert_eq!(sql.kind(), ErrorKind::Transient);
        assert!(!sql.is_fatal());
    }
}
