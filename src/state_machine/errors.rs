use thiserror::Error;

use crate::error::ErrorKind;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateMachineError {
    #[error("invalid node transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("internal state machine error: {0}")]
    Internal(String),
}

impl StateMachineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTransition { .. } | Self::InvalidStateTransition { .. } => {
                ErrorKind::Validation
            }
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
