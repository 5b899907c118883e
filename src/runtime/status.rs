use std::sync::Arc;
use std::time::{Duration, Instant};

use super::OrchestrationStatus;
use crate::errors::OrchestrationError;
use crate::providers::{InstanceState, Provider, WorkflowInstance};

/// Read-only view of instance status records.
///
/// Status always comes from the stored record, never from replaying
/// history, so lookups are cheap and do not depend on registered code.
#[derive(Clone)]
pub struct InstanceRegistry {
    store: Arc<dyn Provider>,
}

impl InstanceRegistry {
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self { store }
    }

    pub async fn get_status(&self, instance: &str) -> Result<OrchestrationStatus, OrchestrationError> {
        Ok(self
            .store
            .get_instance(instance)
            .await?
            .map(|r| OrchestrationStatus::from_instance(&r))
            .unwrap_or(OrchestrationStatus::NotFound))
    }

    /// Full status record, including timestamps and input.
    pub async fn get_instance(&self, instance: &str) -> Result<Option<WorkflowInstance>, OrchestrationError> {
        Ok(self.store.get_instance(instance).await?)
    }

    /// Instance ids, optionally filtered by state, oldest first.
    pub async fn list(&self, state: Option<InstanceState>) -> Result<Vec<String>, OrchestrationError> {
        Ok(self.store.list_instances(state).await?)
    }

    /// Poll until `instance` reaches a terminal state or `timeout` elapses.
    pub async fn wait_for_terminal(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, OrchestrationError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.get_status(instance).await? {
                OrchestrationStatus::NotFound => return Err(OrchestrationError::UnknownInstance(instance.to_string())),
                status if status.is_terminal() => return Ok(status),
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(OrchestrationError::Timeout(instance.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
