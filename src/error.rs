use crate::transaction::types::{ContextId, Outcome, ResourceId};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Resource {resource} unavailable after waiting {waited:?}")]
    Unavailable { resource: ResourceId, waited: Duration },

    #[error("Deadlock detected: {context} waiting for {resource} held by {holder}")]
    DeadlockDetected {
        context: ContextId,
        resource: ResourceId,
        holder: ContextId,
        /// Contexts on the cycle, starting at `context`.
        cycle: Vec<ContextId>,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl Error {
    pub fn outcome(&self) -> Outcome {
        match self {
            Error::InvalidRequest(_) => Outcome::InvalidRequest,
            Error::Unavailable { .. } => Outcome::Unavailable,
            Error::DeadlockDetected { .. } => Outcome::DeadlockDetected,
            Error::ConfigError(_) => Outcome::ConfigurationError,
            Error::InvariantViolation(_) => Outcome::InvariantViolation,
        }
    }

    /// True when a brand-new attempt of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable { .. } | Error::DeadlockDetected { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
