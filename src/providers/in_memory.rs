use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{
    next_seq, stamp_events, InstanceState, Provider, ProviderError, TerminalOutcome, WorkflowInstance,
};
use crate::{Event, EventKind};

struct Entry {
    record: WorkflowInstance,
    history: Vec<Event>,
}

/// Process-local provider. Nothing survives the process; use it for tests
/// and for wiring checks.
#[derive(Default)]
pub struct InMemoryProvider {
    inner: Mutex<HashMap<String, Entry>>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

fn append_locked(
    op: &str,
    instance: &str,
    entry: &mut Entry,
    expected_next_seq: u64,
    events: Vec<EventKind>,
) -> Result<Vec<Event>, ProviderError> {
    if entry.record.state.is_terminal() {
        return Err(ProviderError::invalid_transition(op, instance, entry.record.state));
    }
    let actual = next_seq(&entry.history);
    if actual != expected_next_seq {
        return Err(ProviderError::sequence_conflict(op, instance, expected_next_seq, actual));
    }
    let stamped = stamp_events(actual, events);
    entry.history.extend(stamped.iter().cloned());
    Ok(stamped)
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn create_instance(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
    ) -> Result<WorkflowInstance, ProviderError> {
        let mut g = self.inner.lock().await;
        if g.contains_key(instance) {
            return Err(ProviderError::duplicate_instance("create_instance", instance));
        }
        let record = WorkflowInstance::new_running(instance, orchestration, input);
        let started = Event::new(
            0,
            EventKind::OrchestratorStarted {
                name: orchestration.to_string(),
                input: input.to_string(),
            },
        );
        g.insert(
            instance.to_string(),
            Entry {
                record: record.clone(),
                history: vec![started],
            },
        );
        Ok(record)
    }

    async fn append(
        &self,
        instance: &str,
        expected_next_seq: u64,
        events: Vec<EventKind>,
    ) -> Result<Vec<Event>, ProviderError> {
        let mut g = self.inner.lock().await;
        let entry = g
            .get_mut(instance)
            .ok_or_else(|| ProviderError::unknown_instance("append", instance))?;
        let stamped = append_locked("append", instance, entry, expected_next_seq, events)?;
        entry.record.updated_at_ms = crate::now_ms();
        Ok(stamped)
    }

    async fn commit_terminal(
        &self,
        instance: &str,
        expected_next_seq: u64,
        events: Vec<EventKind>,
        outcome: TerminalOutcome,
    ) -> Result<Vec<Event>, ProviderError> {
        let mut g = self.inner.lock().await;
        let entry = g
            .get_mut(instance)
            .ok_or_else(|| ProviderError::unknown_instance("commit_terminal", instance))?;
        let stamped = append_locked("commit_terminal", instance, entry, expected_next_seq, events)?;
        entry.record.apply_terminal(&outcome);
        Ok(stamped)
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let g = self.inner.lock().await;
        g.get(instance)
            .map(|e| e.history.clone())
            .ok_or_else(|| ProviderError::unknown_instance("read", instance))
    }

    async fn get_instance(&self, instance: &str) -> Result<Option<WorkflowInstance>, ProviderError> {
        Ok(self.inner.lock().await.get(instance).map(|e| e.record.clone()))
    }

    async fn request_cancellation(&self, instance: &str, reason: &str) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        let entry = g
            .get_mut(instance)
            .ok_or_else(|| ProviderError::unknown_instance("request_cancellation", instance))?;
        if entry.record.state == InstanceState::Running {
            entry.record.cancel_requested = Some(reason.to_string());
            entry.record.updated_at_ms = crate::now_ms();
        }
        Ok(())
    }

    async fn list_instances(&self, state: Option<InstanceState>) -> Result<Vec<String>, ProviderError> {
        let g = self.inner.lock().await;
        let mut records: Vec<&WorkflowInstance> = g
            .values()
            .map(|e| &e.record)
            .filter(|r| state.map_or(true, |s| r.state == s))
            .collect();
        records.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        Ok(records.into_iter().map(|r| r.instance_id.clone()).collect())
    }
}
