//! Provider wrapper that injects write failures for testing how the runtime
//! recovers when the store refuses a turn or a completion.

// Only some test files that import common use these types.
#![allow(dead_code)]

use async_trait::async_trait;
use orderflow::providers::{InMemoryProvider, InstanceState, Provider, ProviderError, TerminalOutcome, WorkflowInstance};
use orderflow::{Event, EventKind};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Fails `append` calls carrying a chosen event type, a set number of times.
pub struct FailingProvider {
    inner: Arc<dyn Provider>,
    /// Event type name that triggers a failure.
    fail_kind: Mutex<Option<&'static str>>,
    /// Failures still to inject.
    remaining: AtomicU32,
    /// Inject retryable errors instead of permanent ones.
    retryable: AtomicBool,
    /// Failures injected so far.
    injected: AtomicU32,
}

impl FailingProvider {
    pub fn new(inner: Arc<dyn Provider>) -> Self {
        Self {
            inner,
            fail_kind: Mutex::new(None),
            remaining: AtomicU32::new(0),
            retryable: AtomicBool::new(false),
            injected: AtomicU32::new(0),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryProvider::new()))
    }

    /// The next `count` appends containing a `kind` event fail with a
    /// permanent storage error.
    pub fn fail_appends_of(&self, kind: &'static str, count: u32) {
        self.retryable.store(false, Ordering::SeqCst);
        self.arm(kind, count);
    }

    /// Like `fail_appends_of`, with errors the caller may retry.
    pub fn fail_appends_of_retryable(&self, kind: &'static str, count: u32) {
        self.retryable.store(true, Ordering::SeqCst);
        self.arm(kind, count);
    }

    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    fn arm(&self, kind: &'static str, count: u32) {
        *self.fail_kind.lock().unwrap() = Some(kind);
        self.remaining.store(count, Ordering::SeqCst);
    }

    fn should_fail(&self, events: &[EventKind]) -> bool {
        let Some(kind) = *self.fail_kind.lock().unwrap() else {
            return false;
        };
        if !events.iter().any(|e| e.type_name() == kind) {
            return false;
        }
        let took = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            self.injected.fetch_add(1, Ordering::SeqCst);
        }
        took
    }

    fn injected_error(&self, operation: &str) -> ProviderError {
        if self.retryable.load(Ordering::SeqCst) {
            ProviderError::retryable(operation, "simulated database busy")
        } else {
            ProviderError::permanent(operation, "simulated infrastructure failure")
        }
    }
}

#[async_trait]
impl Provider for FailingProvider {
    fn name(&self) -> &str {
        "failing"
    }

    async fn create_instance(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
    ) -> Result<WorkflowInstance, ProviderError> {
        self.inner.create_instance(instance, orchestration, input).await
    }

    async fn append(
        &self,
        instance: &str,
        expected_next_seq: u64,
        events: Vec<EventKind>,
    ) -> Result<Vec<Event>, ProviderError> {
        if self.should_fail(&events) {
            return Err(self.injected_error("append"));
        }
        self.inner.append(instance, expected_next_seq, events).await
    }

    async fn commit_terminal(
        &self,
        instance: &str,
        expected_next_seq: u64,
        events: Vec<EventKind>,
        outcome: TerminalOutcome,
    ) -> Result<Vec<Event>, ProviderError> {
        if self.should_fail(&events) {
            return Err(self.injected_error("commit_terminal"));
        }
        self.inner
            .commit_terminal(instance, expected_next_seq, events, outcome)
            .await
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        self.inner.read(instance).await
    }

    async fn get_instance(&self, instance: &str) -> Result<Option<WorkflowInstance>, ProviderError> {
        self.inner.get_instance(instance).await
    }

    async fn request_cancellation(&self, instance: &str, reason: &str) -> Result<(), ProviderError> {
        self.inner.request_cancellation(instance, reason).await
    }

    async fn list_instances(&self, state: Option<InstanceState>) -> Result<Vec<String>, ProviderError> {
        self.inner.list_instances(state).await
    }
}
