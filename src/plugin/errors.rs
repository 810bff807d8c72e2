use thiserror::Error;

use crate::error::ErrorKind;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginError {
    /// The plugin answered 503; the caller retries with its own backoff
    #[error("plugin {plugin} is temporarily unavailable for {method}: {body}")]
    Transient {
        plugin: String,
        method: String,
        body: String,
    },

    #[error("plugin {plugin} failed {method} with status {status}: {body}")]
    Rpc {
        plugin: String,
        method: String,
        status: u16,
        body: String,
    },

    #[error("could not reach plugin {plugin} for {method}: {message}")]
    Transport {
        plugin: String,
        method: String,
        message: String,
        transient: bool,
    },

    #[error("plugin {plugin} returned an undecodable {method} reply: {message}")]
    Decode {
        plugin: String,
        method: String,
        message: String,
    },

    #[error("invalid executor plugin config map: {message}")]
    InvalidConfigMap { message: String },
}

impl PluginError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. }
            | Self::Transport {
                transient: true, ..
            } => ErrorKind::Transient,
            Self::Rpc { status, .. } if *status == 429 => ErrorKind::Transient,
            Self::Rpc { status, .. } if *status >= 500 => ErrorKind::Transient,
            Self::Rpc { .. } | Self::Transport { .. } => ErrorKind::PermanentRemote,
            Self::Decode { .. } => ErrorKind::Internal,
            Self::InvalidConfigMap { .. } => ErrorKind::Validation,
        }
    }

    pub fn invalid_config_map(message: impl Into<String>) -> Self {
        Self::InvalidConfigMap {
            message: message.into(),
        }
    }
}

pub type PluginResult<T> = Result<T, PluginError>;
