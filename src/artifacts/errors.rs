use thiserror::Error;

use crate::error::ErrorKind;
use crate::resilience::classifier::{
    is_permanent_http_status, is_transient_http_status, is_transient_message, is_transient_reqwest,
};

/// Errors raised by artifact drivers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArtifactError {
    #[error("Artifact key '{key}' does not exist")]
    NotFound { key: String },

    #[error("Transient failure during {operation}: {message}")]
    Transient { operation: String, message: String },

    #[error("{operation} failed: {message}")]
    Permanent { operation: String, message: String },

    #[error("Local file error at {path}: {message}")]
    Io { path: String, message: String },

    #[error("Invalid artifact location: {message}")]
    InvalidLocation { message: String },

    #[error("The {driver} driver does not support {operation}")]
    Unsupported { driver: String, operation: String },
}

impl ArtifactError {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl AsRef<std::path::Path>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        }
    }

    pub fn invalid_location(message: impl Into<String>) -> Self {
        Self::InvalidLocation {
            message: message.into(),
        }
    }

    /// Classify a message as transient or permanent
    pub fn classify(operation: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        if is_transient_message(&message) {
            Self::transient(operation, message)
        } else {
            Self::permanent(operation, message)
        }
    }

    pub fn from_object_store(operation: &str, err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => Self::not_found(path),
            other => Self::classify(operation, other.to_string()),
        }
    }

    pub fn from_reqwest(operation: &str, err: reqwest::Error) -> Self {
        if is_transient_reqwest(&err) {
            Self::transient(operation, err.to_string())
        } else {
            Self::permanent(operation, err.to_string())
        }
    }

    /// Map a non-success HTTP status returned by a storage service
    pub fn from_status(operation: &str, key: &str, status: u16, body: &str) -> Self {
        if status == 404 {
            Self::not_found(key)
        } else if is_transient_http_status(status) {
            Self::transient(operation, format!("HTTP {status}: {body}"))
        } else if is_permanent_http_status(status) {
            Self::permanent(operation, format!("HTTP {status}: {body}"))
        } else {
            Self::classify(operation, format!("HTTP {status}: {body}"))
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Permanent { .. } => ErrorKind::PermanentRemote,
            Self::Io { .. } => ErrorKind::Internal,
            Self::InvalidLocation { .. } | Self::Unsupported { .. } => ErrorKind::Validation,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

pub type ArtifactResult<T> = Result<T, ArtifactError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ArtifactError::from_status("load", "a/b", 404, "").kind(),
            ErrorKind::NotFound
        );
        assert!(ArtifactError::from_status("load", "a/b", 503, "busy").is_transient());
        assert!(ArtifactError::from_status("load", "a/b", 429, "").is_transient());
        assert_eq!(
            ArtifactError::from_status("load", "a/b", 403, "denied").kind(),
            ErrorKind::PermanentRemote
        );
    }

    #[test]
    fn test_object_store_not_found_is_distinct() {
        let err = object_store::Error::NotFound {
            path: "does/not/exist".into(),
            source: "missing".into(),
        };
        assert_eq!(
            ArtifactError::from_object_store("load", err),
            ArtifactError::not_found("does/not/exist")
        );
        assert!(ArtifactError::classify("save", "connection reset by peer").is_transient());
        assert!(!ArtifactError::classify("load", "NoSuchKey").is_transient());
    }
}
