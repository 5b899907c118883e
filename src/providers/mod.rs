use serde::{Deserialize, Serialize};

use crate::{now_ms, Event, EventKind};

pub mod error;
pub use error::{ProviderError, ProviderErrorKind};

/// Lifecycle state of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Running => "Running",
            InstanceState::Completed => "Completed",
            InstanceState::Failed => "Failed",
            InstanceState::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Running" => Some(InstanceState::Running),
            "Completed" => Some(InstanceState::Completed),
            "Failed" => Some(InstanceState::Failed),
            "Cancelled" => Some(InstanceState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceState::Running)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an instance ended. Written together with its terminal event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalOutcome {
    Completed { output: String },
    Failed { reason: String },
    Cancelled { reason: String },
}

impl TerminalOutcome {
    pub fn state(&self) -> InstanceState {
        match self {
            TerminalOutcome::Completed { .. } => InstanceState::Completed,
            TerminalOutcome::Failed { .. } => InstanceState::Failed,
            TerminalOutcome::Cancelled { .. } => InstanceState::Cancelled,
        }
    }

    /// Outcome implied by a terminal history event, if `kind` is one.
    pub fn from_event(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::OrchestratorCompleted { output } => Some(TerminalOutcome::Completed { output: output.clone() }),
            EventKind::OrchestratorFailed { reason } => Some(TerminalOutcome::Failed { reason: reason.clone() }),
            EventKind::OrchestratorCancelled { reason } => Some(TerminalOutcome::Cancelled { reason: reason.clone() }),
            _ => None,
        }
    }
}

/// Status record kept next to each instance's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub instance_id: String,
    pub orchestration: String,
    pub input: String,
    pub state: InstanceState,
    /// Set only when `Completed`.
    pub output: Option<String>,
    /// Set only when `Failed` or `Cancelled`.
    pub failure_reason: Option<String>,
    /// Pending cancellation, applied at the next resumption.
    pub cancel_requested: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl WorkflowInstance {
    pub fn new_running(instance: &str, orchestration: &str, input: &str) -> Self {
        let now = now_ms();
        Self {
            instance_id: instance.to_string(),
            orchestration: orchestration.to_string(),
            input: input.to_string(),
            state: InstanceState::Running,
            output: None,
            failure_reason: None,
            cancel_requested: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    pub fn apply_terminal(&mut self, outcome: &TerminalOutcome) {
        self.state = outcome.state();
        match outcome {
            TerminalOutcome::Completed { output } => self.output = Some(output.clone()),
            TerminalOutcome::Failed { reason } | TerminalOutcome::Cancelled { reason } => {
                self.failure_reason = Some(reason.clone())
            }
        }
        self.updated_at_ms = now_ms();
    }
}

/// Next sequence number for an instance whose history is `history`.
pub fn next_seq(history: &[Event]) -> u64 {
    history.last().map(|e| e.seq + 1).unwrap_or(0)
}

/// Stamp `kinds` with consecutive sequence numbers starting at `first_seq`.
pub(crate) fn stamp_events(first_seq: u64, kinds: Vec<EventKind>) -> Vec<Event> {
    kinds
        .into_iter()
        .enumerate()
        .map(|(i, kind)| Event::new(first_seq + i as u64, kind))
        .collect()
}

/// Durable store for instance histories and their status records.
///
/// History is append-only. Every write is compare-and-append: the caller
/// passes the sequence number it expects the first new event to get, and the
/// provider rejects the write with `SequenceConflict` if the log has moved.
/// Terminal transitions write their events and the status record in one
/// atomic step so status and history never disagree.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Atomically create a Running instance whose history holds a single
    /// `OrchestratorStarted` event at seq 0.
    async fn create_instance(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
    ) -> Result<WorkflowInstance, ProviderError>;

    /// Append `events` to a Running instance.
    async fn append(
        &self,
        instance: &str,
        expected_next_seq: u64,
        events: Vec<EventKind>,
    ) -> Result<Vec<Event>, ProviderError>;

    /// Append `events` and move the instance to `outcome` atomically.
    async fn commit_terminal(
        &self,
        instance: &str,
        expected_next_seq: u64,
        events: Vec<EventKind>,
        outcome: TerminalOutcome,
    ) -> Result<Vec<Event>, ProviderError>;

    /// Full ordered history.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    async fn get_instance(&self, instance: &str) -> Result<Option<WorkflowInstance>, ProviderError>;

    /// Durably mark a Running instance for cancellation. No-op on terminal
    /// instances.
    async fn request_cancellation(&self, instance: &str, reason: &str) -> Result<(), ProviderError>;

    /// Instance ids, optionally filtered by state, oldest first.
    async fn list_instances(&self, state: Option<InstanceState>) -> Result<Vec<String>, ProviderError>;
}

/// In-memory provider for tests.
pub mod in_memory;
/// Filesystem-backed provider writing JSONL per instance.
pub mod fs;
/// SQLite provider built on sqlx.
pub mod sqlite;

pub use fs::FsProvider;
pub use in_memory::InMemoryProvider;
pub use sqlite::SqliteProvider;
