use thiserror::Error;

use crate::providers::{ProviderError, ProviderErrorKind};

/// Errors surfaced by the scheduler and the instance registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestrationError {
    #[error("instance already exists: {0}")]
    DuplicateInstance(String),
    #[error("instance not found: {0}")]
    UnknownInstance(String),
    #[error("orchestration not registered: {0}")]
    UnknownOrchestration(String),
    #[error("invalid instance id: {0:?}")]
    InvalidInstanceId(String),
    #[error("timed out waiting for instance {0} to finish")]
    Timeout(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl OrchestrationError {
    /// Lift a provider error, keeping lookup failures distinguishable.
    pub(crate) fn from_provider(instance: &str, err: ProviderError) -> Self {
        match err.kind {
            ProviderErrorKind::DuplicateInstance => OrchestrationError::DuplicateInstance(instance.to_string()),
            ProviderErrorKind::UnknownInstance => OrchestrationError::UnknownInstance(instance.to_string()),
            _ => OrchestrationError::Provider(err),
        }
    }
}

/// Classified activity failure.
///
/// `Transient` failures are retried by the executor under its
/// [`RetryPolicy`](crate::RetryPolicy); the other variants end the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivityError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("activity not registered: {0}")]
    UnknownActivity(String),
}

impl ActivityError {
    pub fn transient(message: impl Into<String>) -> Self {
        ActivityError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ActivityError::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ActivityError::Transient(_))
    }

    /// The failure text without the classification prefix.
    pub fn message(&self) -> &str {
        match self {
            ActivityError::Transient(m) | ActivityError::Permanent(m) => m,
            ActivityError::UnknownActivity(name) => name,
        }
    }
}
