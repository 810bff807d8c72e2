use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::resilience::classifier::is_transient_sqlx;

/// Errors raised by the offload store and the workflow archive
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("offloaded node status {uid}/{version} not found")]
    NotFound { uid: Uuid, version: String },

    #[error("archived workflow {uid} not found")]
    ArchiveNotFound { uid: Uuid },

    #[error("{operation} failed: {message}")]
    Database {
        operation: String,
        message: String,
        transient: bool,
    },

    #[error("{operation} did not complete within {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("{operation} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        message: String,
    },

    #[error("failed to encode or decode node status: {message}")]
    Serialization { message: String },

    #[error("offload node status is not enabled")]
    Disabled,
}

impl PersistenceError {
    pub fn from_sqlx(operation: &str, err: sqlx::Error) -> Self {
        Self::Database {
            operation: operation.to_string(),
            transient: is_transient_sqlx(&err),
            message: err.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database {
                transient: true,
                ..
            } | Self::Timeout { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } | Self::ArchiveNotFound { .. } => ErrorKind::NotFound,
            Self::Database {
                transient: true, ..
            }
            | Self::Timeout { .. } => ErrorKind::Transient,
            Self::Database { .. } | Self::RetriesExhausted { .. } => ErrorKind::PermanentRemote,
            Self::Serialization { .. } => ErrorKind::Internal,
            Self::Disabled => ErrorKind::Validation,
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = PersistenceError::from_sqlx("save", sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
        assert_eq!(err.kind(), ErrorKind::Transient);

        let err = PersistenceError::from_sqlx("get", sqlx::Error::RowNotFound);
        assert!(!err.is_transient());
    }
}
