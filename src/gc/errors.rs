use thiserror::Error;

use crate::artifacts::ArtifactError;
use crate::error::ErrorKind;
use crate::persistence::PersistenceError;
use crate::repository::RepositoryError;
use crate::workflow::RuntimeError;

#[derive(Error, Debug)]
pub enum GcError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("{remaining} artifacts of workflow {workflow} could not be deleted: {first_error}")]
    ArtifactsRemaining {
        workflow: String,
        remaining: usize,
        first_error: String,
    },
}

impl GcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Runtime(e) => e.kind(),
            Self::Artifact(e) => e.kind(),
            Self::Repository(e) => e.kind(),
            Self::Persistence(e) => e.kind(),
            Self::ArtifactsRemaining { .. } => ErrorKind::Transient,
        }
    }
}

pub type GcResult<T> = Result<T, GcError>;
