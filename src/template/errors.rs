use crate::error::ErrorKind;
use thiserror::Error;

/// Errors raised while parsing, validating, embedding or substituting templates
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("Failed to parse template document in {source_name}: {message}")]
    Parse { source_name: String, message: String },

    #[error("{}", located(.path, .message))]
    Validation { path: String, message: String },

    #[error("{}", resolution_message(.name, .type_expected, .type_actual))]
    ParameterResolution {
        name: String,
        type_expected: String,
        type_actual: String,
    },

    #[error("Duplicate template name: {name}")]
    Duplicate { name: String },

    #[error("infinite recursive workflow")]
    Recursive,

    #[error("Template '{name}' not found")]
    NotFound { name: String },

    #[error("Internal template error: {message}")]
    Internal { message: String },
}

/// Marker used as `type_actual` when a parameter is not declared anywhere
pub const UNDECLARED: &str = "undeclared";

fn located(path: &str, message: &str) -> String {
    if path.is_empty() {
        message.to_string()
    } else {
        format!("{path}: {message}")
    }
}

fn resolution_message(name: &str, type_expected: &str, type_actual: &str) -> String {
    if type_actual == UNDECLARED {
        format!("cannot resolve '%%{name}%%'")
    } else {
        format!("parameter '{name}' used as a {type_expected} but declared as a {type_actual}")
    }
}

impl TemplateError {
    /// Validation failure without a location yet
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Validation {
            path: String::new(),
            message: message.into(),
        }
    }

    pub fn parse(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn unresolved(name: impl Into<String>, type_expected: impl ToString) -> Self {
        Self::ParameterResolution {
            name: name.into(),
            type_expected: type_expected.to_string(),
            type_actual: UNDECLARED.to_string(),
        }
    }

    /// Prefix the validation path with an outer segment
    pub fn at(self, segment: impl AsRef<str>) -> Self {
        match self {
            Self::Validation { path, message } => {
                let segment = segment.as_ref();
                let path = if path.is_empty() {
                    segment.to_string()
                } else {
                    format!("{segment}.{path}")
                };
                Self::Validation { path, message }
            }
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse { .. }
            | Self::Validation { .. }
            | Self::ParameterResolution { .. }
            | Self::Duplicate { .. }
            | Self::Recursive => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }
}

impl From<serde_json::Error> for TemplateError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("serialization failed: {err}"))
    }
}

pub type TemplateResult<T> = Result<T, TemplateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_nest_outward() {
        let err = TemplateError::invalid("'version' required").at("build").at("steps[0]");
        assert_eq!(err.to_string(), "steps[0].build: 'version' required");
    }

    #[test]
    fn test_resolution_messages() {
        let err = TemplateError::unresolved("inputs.parameters.X", "string");
        assert_eq!(err.to_string(), "cannot resolve '%%inputs.parameters.X%%'");

        let err = TemplateError::ParameterResolution {
            name: "inputs.artifacts.bin".into(),
            type_expected: "string".into(),
            type_actual: "artifact".into(),
        };
        assert_eq!(
            err.to_string(),
            "parameter 'inputs.artifacts.bin' used as a string but declared as a artifact"
        );
    }
}
