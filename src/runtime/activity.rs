//! Activity execution with bounded concurrency and retries
//!
//! The executor owns the activity registry and a semaphore sized by
//! `RuntimeOptions::worker_concurrency`. Each attempt holds one permit while
//! it runs; backoff sleeps do not.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use ::futures::FutureExt;
use tokio::sync::Semaphore;

use super::registry::{ActivityContext, ActivityRegistry};
use super::retry::RetryPolicy;
use crate::errors::ActivityError;
use crate::ActivityCall;

pub struct ActivityExecutor {
    registry: Arc<ActivityRegistry>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl ActivityExecutor {
    pub fn new(registry: Arc<ActivityRegistry>, retry: RetryPolicy, concurrency: usize) -> Self {
        Self {
            registry,
            retry,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run one attempt. Panics inside the activity come back as permanent
    /// failures.
    pub async fn execute(&self, ctx: ActivityContext, input: String) -> Result<String, ActivityError> {
        let handler = self
            .registry
            .get(&ctx.activity_name)
            .ok_or_else(|| ActivityError::UnknownActivity(ctx.activity_name.clone()))?;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ActivityError::permanent("activity executor is closed"))?;

        let attempt = AssertUnwindSafe(handler.invoke(ctx, input)).catch_unwind();
        let result = match self.retry.timeout {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(r) => r,
                Err(_) => return Err(ActivityError::transient(format!("attempt timed out after {limit:?}"))),
            },
            None => attempt.await,
        };
        result.unwrap_or_else(|panic| {
            Err(ActivityError::permanent(format!(
                "activity panicked: {}",
                panic_message(&*panic)
            )))
        })
    }

    /// Run `call` under the retry policy. Transient failures are retried
    /// with backoff; the final error is never `Transient`.
    pub async fn execute_with_retry(&self, instance: &str, call: &ActivityCall) -> Result<String, ActivityError> {
        let mut attempt = 1u32;
        loop {
            let ctx = ActivityContext {
                instance_id: instance.to_string(),
                call_seq: call.call_seq,
                activity_name: call.name.clone(),
                attempt,
            };
            let started = Instant::now();
            let result = self.execute(ctx, call.input.clone()).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(output) => {
                    tracing::debug!(
                        target: "orderflow::runtime",
                        instance_id = %instance,
                        activity_name = %call.name,
                        call_seq = call.call_seq,
                        attempt,
                        duration_ms,
                        "Activity completed"
                    );
                    return Ok(output);
                }
                Err(ActivityError::Transient(msg)) => match self.retry.next_delay(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            target: "orderflow::runtime",
                            instance_id = %instance,
                            activity_name = %call.name,
                            call_seq = call.call_seq,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %msg,
                            "Activity attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        tracing::warn!(
                            target: "orderflow::runtime",
                            instance_id = %instance,
                            activity_name = %call.name,
                            call_seq = call.call_seq,
                            attempts = attempt,
                            error = %msg,
                            "Activity retries exhausted"
                        );
                        return Err(ActivityError::permanent(format!(
                            "retries exhausted after {attempt} attempts: {msg}"
                        )));
                    }
                },
                Err(err) => {
                    tracing::warn!(
                        target: "orderflow::runtime",
                        instance_id = %instance,
                        activity_name = %call.name,
                        call_seq = call.call_seq,
                        attempt,
                        duration_ms,
                        error = %err,
                        "Activity failed"
                    );
                    return Err(err);
                }
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
