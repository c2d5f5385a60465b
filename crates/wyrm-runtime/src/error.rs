//! Runtime error types.

use thiserror::Error;
use wyrm_core::{BrokerError, ConfigurationError};

use crate::config::ConfigError;
use crate::host::HostError;

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The handler's bindings or pipeline are invalid.
    #[error("handler '{key}' is misconfigured: {source}")]
    Configuration {
        key: String,
        #[source]
        source: ConfigurationError,
    },

    /// Declaring the outbound destination failed.
    #[error("handler '{key}' could not declare its topology: {source}")]
    Topology {
        key: String,
        #[source]
        source: BrokerError,
    },

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A host failed while the runtime was running.
    #[error("handler '{key}' failed in worker {worker}: {reason}")]
    HostFailed {
        key: String,
        worker: String,
        reason: String,
    },
}

impl RuntimeError {
    pub(crate) fn configuration(key: impl Into<String>, source: ConfigurationError) -> Self {
        Self::Configuration {
            key: key.into(),
            source,
        }
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
