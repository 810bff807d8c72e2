use std::fmt::Display;
use std::path::PathBuf;

use crate::error::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("no flowmill-config.yaml found, looked in {candidates:?}")]
    NotFound { candidates: Vec<PathBuf> },

    #[error("{path} is not valid YAML: {reason}")]
    Yaml { path: String, reason: String },

    #[error("{section} requires '{key}'")]
    MissingField { key: String, section: String },

    #[error("{key} = '{value}' is invalid: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("cannot read {path}: {reason}")]
    Unreadable { path: String, reason: String },

    /// A `FLOWMILL__*` variable could not be layered over the file
    #[error("environment override rejected: {0}")]
    Override(String),

    #[error("configuration rejected: {0}")]
    Rejected(String),
}

impl ConfigurationError {
    pub fn config_file_not_found(candidates: Vec<PathBuf>) -> Self {
        Self::NotFound { candidates }
    }

    pub fn invalid_yaml(path: impl Into<String>, reason: impl Display) -> Self {
        Self::Yaml {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn missing_required_field(key: impl Into<String>, section: impl Into<String>) -> Self {
        Self::MissingField {
            key: key.into(),
            section: section.into(),
        }
    }

    pub fn invalid_value(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn file_read_error(path: impl Into<String>, reason: impl Display) -> Self {
        Self::Unreadable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn validation_error(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Unreadable { .. } => ErrorKind::Internal,
            _ => ErrorKind::Validation,
        }
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        Self::Override(err.to_string())
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;
