/// What went wrong in a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// `create_instance` found an existing instance with the same id.
    DuplicateInstance,
    /// The instance does not exist.
    UnknownInstance,
    /// Compare-and-append found a different next sequence number than the
    /// caller expected.
    SequenceConflict,
    /// The instance is terminal and accepts no further events.
    InvalidTransition,
    /// Backend failure (I/O, database, serialization).
    Storage,
}

/// Provider-specific error with retry classification
///
/// Providers return this error type to indicate whether an error should be retried.
///
/// **Retryable**: database busy/locked, connection timeouts, I/O hiccups,
/// sequence conflicts (re-read and try again).
///
/// **Non-retryable**: duplicate or missing instances, corrupt records,
/// writes to a terminal instance.
///
/// ```rust
/// use orderflow::providers::ProviderError;
///
/// let busy = ProviderError::retryable("append", "Database is busy");
/// assert!(busy.is_retryable());
///
/// let corrupt = ProviderError::permanent("read", "Corrupt history line 3");
/// assert!(!corrupt.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed (e.g., "append", "commit_terminal")
    pub operation: String,
    /// Human-readable error message
    pub message: String,
    pub kind: ProviderErrorKind,
    /// Whether this error should be retried
    pub retryable: bool,
}

impl ProviderError {
    /// Create a retryable (transient) storage error
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ProviderErrorKind::Storage,
            retryable: true,
        }
    }

    /// Create a non-retryable (permanent) storage error
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ProviderErrorKind::Storage,
            retryable: false,
        }
    }

    pub fn duplicate_instance(operation: impl Into<String>, instance: &str) -> Self {
        Self {
            operation: operation.into(),
            message: format!("instance already exists: {instance}"),
            kind: ProviderErrorKind::DuplicateInstance,
            retryable: false,
        }
    }

    pub fn unknown_instance(operation: impl Into<String>, instance: &str) -> Self {
        Self {
            operation: operation.into(),
            message: format!("instance not found: {instance}"),
            kind: ProviderErrorKind::UnknownInstance,
            retryable: false,
        }
    }

    pub fn sequence_conflict(operation: impl Into<String>, instance: &str, expected: u64, actual: u64) -> Self {
        Self {
            operation: operation.into(),
            message: format!("sequence conflict on {instance}: expected next seq {expected}, store has {actual}"),
            kind: ProviderErrorKind::SequenceConflict,
            retryable: true,
        }
    }

    pub fn invalid_transition(operation: impl Into<String>, instance: &str, state: impl std::fmt::Display) -> Self {
        Self {
            operation: operation.into(),
            message: format!("instance {instance} is {state} and accepts no further events"),
            kind: ProviderErrorKind::InvalidTransition,
            retryable: false,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}
