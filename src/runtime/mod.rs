//! Orchestration scheduler
//!
//! The `Runtime` drives instances turn by turn. A turn reads the instance's
//! history, replays the orchestration against it, durably records any new
//! activity calls, and dispatches them. Activity results come back as
//! completions that are appended to history before the next turn runs.
//! Nothing waits in memory across a suspension: a fresh runtime over the
//! same store picks up where the last one stopped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, Json};
use crate::errors::{ActivityError, OrchestrationError};
use crate::providers::{
    next_seq, InMemoryProvider, InstanceState, Provider, ProviderError, ProviderErrorKind, TerminalOutcome,
    WorkflowInstance,
};
use crate::{ActivityCall, Event, EventKind};

pub mod activity;
pub mod registry;
pub mod replay;
pub mod retry;
pub mod status;

use activity::ActivityExecutor;
use registry::{ActivityRegistry, OrchestrationRegistry};
use replay::TurnResult;
use retry::{BackoffStrategy, RetryPolicy};
use status::InstanceRegistry;

/// Re-reads and retries after this many sequence conflicts in a row.
const MAX_CONFLICT_RETRIES: usize = 5;
/// Attempts at a store call that keeps failing with a retryable error.
const MAX_STORE_ATTEMPTS: u32 = 5;
/// Background turns tried after the store refused a turn or a completion.
const MAX_SCHEDULED_RESUMES: u32 = 5;

const STORE_BACKOFF: BackoffStrategy = BackoffStrategy::Exponential {
    base: Duration::from_millis(10),
    multiplier: 2.0,
    max: Duration::from_millis(500),
};
const RESUME_BACKOFF: BackoffStrategy = BackoffStrategy::Exponential {
    base: Duration::from_millis(50),
    multiplier: 2.0,
    max: Duration::from_secs(5),
};

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Maximum activity attempts running at once across all instances.
    /// Default: 8
    pub worker_concurrency: usize,
    /// Retry policy applied to every activity call.
    pub activity_retry: RetryPolicy,
    /// Resume every Running instance in the store when the runtime starts.
    /// Default: true
    pub recover_on_start: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            worker_concurrency: 8,
            activity_retry: RetryPolicy::default(),
            recover_on_start: true,
        }
    }
}

/// High-level orchestration status read from the instance record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { reason: String },
    Cancelled { reason: String },
}

impl OrchestrationStatus {
    pub fn from_instance(record: &WorkflowInstance) -> Self {
        let reason = || record.failure_reason.clone().unwrap_or_default();
        match record.state {
            InstanceState::Running => OrchestrationStatus::Running,
            InstanceState::Completed => OrchestrationStatus::Completed {
                output: record.output.clone().unwrap_or_default(),
            },
            InstanceState::Failed => OrchestrationStatus::Failed { reason: reason() },
            InstanceState::Cancelled => OrchestrationStatus::Cancelled { reason: reason() },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Cancelled { .. }
        )
    }

    /// Status name as reported to callers.
    pub fn name(&self) -> &'static str {
        match self {
            OrchestrationStatus::NotFound => "NotFound",
            OrchestrationStatus::Running => "Running",
            OrchestrationStatus::Completed { .. } => "Completed",
            OrchestrationStatus::Failed { .. } => "Failed",
            OrchestrationStatus::Cancelled { .. } => "Cancelled",
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn is_conflict(e: &ProviderError) -> bool {
    e.kind == ProviderErrorKind::SequenceConflict
}

/// Retry budget for one scheduler step against the store. Conflicts replay
/// right away; other retryable failures back off first.
#[derive(Default)]
struct StoreRetry {
    conflicts: usize,
    failures: u32,
}

impl StoreRetry {
    async fn should_retry(&mut self, instance: &str, err: &ProviderError) -> bool {
        if is_conflict(err) {
            if self.conflicts >= MAX_CONFLICT_RETRIES {
                return false;
            }
            self.conflicts += 1;
            debug!(target: "orderflow::runtime", instance_id = %instance, error = %err, "history moved, replaying again");
            return true;
        }
        if !err.is_retryable() || self.failures + 1 >= MAX_STORE_ATTEMPTS {
            return false;
        }
        self.failures += 1;
        let delay = STORE_BACKOFF.delay_for_attempt(self.failures);
        warn!(
            target: "orderflow::runtime",
            instance_id = %instance,
            attempt = self.failures,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "store call failed, retrying"
        );
        tokio::time::sleep(delay).await;
        true
    }
}

/// What to do after a completion was handled.
enum Applied {
    /// History moved on; run the next turn.
    Resume,
    Done,
}

/// Durable orchestration runtime.
pub struct Runtime {
    history_store: Arc<dyn Provider>,
    orchestration_registry: OrchestrationRegistry,
    executor: Arc<ActivityExecutor>,
    options: RuntimeOptions,
    /// Serializes turns and completions per instance.
    instance_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Calls dispatched by this process whose completion has not been applied.
    in_flight: Mutex<HashSet<(String, u64)>>,
    tasks: Mutex<JoinSet<()>>,
    shutting_down: AtomicBool,
}

impl Runtime {
    /// Start a new runtime over a fresh in-memory provider.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Result<Arc<Self>, OrchestrationError> {
        let history_store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
        Self::start_with_store(history_store, activity_registry, orchestration_registry).await
    }

    /// Start a new runtime with a custom `Provider` implementation.
    pub async fn start_with_store(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Result<Arc<Self>, OrchestrationError> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    /// Start a new runtime with custom options. Running instances found in
    /// the store are resumed before this returns when
    /// `options.recover_on_start` is set.
    pub async fn start_with_options(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Result<Arc<Self>, OrchestrationError> {
        crate::logging::init_tracing();

        let executor = Arc::new(ActivityExecutor::new(
            activity_registry,
            options.activity_retry.clone(),
            options.worker_concurrency,
        ));
        let runtime = Arc::new(Self {
            history_store,
            orchestration_registry,
            executor,
            options,
            instance_locks: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            tasks: Mutex::new(JoinSet::new()),
            shutting_down: AtomicBool::new(false),
        });

        info!(
            target: "orderflow::runtime",
            store = runtime.history_store.name(),
            worker_concurrency = runtime.options.worker_concurrency,
            "runtime started"
        );

        if runtime.options.recover_on_start {
            runtime.recover().await?;
        }
        Ok(runtime)
    }

    pub fn store(&self) -> Arc<dyn Provider> {
        self.history_store.clone()
    }

    /// Status lookups over this runtime's store.
    pub fn instances(&self) -> InstanceRegistry {
        InstanceRegistry::new(self.history_store.clone())
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Create `instance` running `orchestration` and run its first turn.
    pub async fn start_orchestration(
        self: &Arc<Self>,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), OrchestrationError> {
        let input = input.into();
        if instance.trim().is_empty() {
            return Err(OrchestrationError::InvalidInstanceId(instance.to_string()));
        }
        if !self.orchestration_registry.has(orchestration) {
            return Err(OrchestrationError::UnknownOrchestration(orchestration.to_string()));
        }

        self.history_store
            .create_instance(instance, orchestration, &input)
            .await
            .map_err(|e| OrchestrationError::from_provider(instance, e))?;
        info!(
            target: "orderflow::runtime",
            instance_id = %instance,
            orchestration = %orchestration,
            "orchestration started"
        );

        // The instance exists; a refused first turn is retried in the background.
        if let Err(e) = self.resume(instance).await {
            error!(
                target: "orderflow::runtime",
                instance_id = %instance,
                error = %e,
                "first turn failed, retrying in the background"
            );
            self.schedule_resume(instance);
        }
        Ok(())
    }

    /// Like `start_orchestration` with a serializable input.
    pub async fn start_orchestration_typed<In: Serialize>(
        self: &Arc<Self>,
        instance: &str,
        orchestration: &str,
        input: &In,
    ) -> Result<(), OrchestrationError> {
        let input = Json::encode(input).map_err(OrchestrationError::Codec)?;
        self.start_orchestration(instance, orchestration, input).await
    }

    /// Run one turn for `instance`: apply a pending cancellation, or replay
    /// and dispatch whatever the orchestration needs next. Terminal
    /// instances are left untouched.
    pub async fn resume(self: &Arc<Self>, instance: &str) -> Result<(), OrchestrationError> {
        let instance_lock = self.instance_lock(instance);
        let _guard = instance_lock.lock().await;
        self.resume_locked(instance).await
    }

    /// Durably request cancellation and apply it right away. Completions
    /// that arrive afterwards are dropped.
    pub async fn cancel_instance(self: &Arc<Self>, instance: &str, reason: &str) -> Result<(), OrchestrationError> {
        self.history_store
            .request_cancellation(instance, reason)
            .await
            .map_err(|e| OrchestrationError::from_provider(instance, e))?;
        info!(target: "orderflow::runtime", instance_id = %instance, reason = %reason, "cancellation requested");
        self.resume(instance).await
    }

    /// Resume every Running instance in the store. Returns how many were
    /// resumed without error.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, OrchestrationError> {
        let running = self.history_store.list_instances(Some(InstanceState::Running)).await?;
        let mut resumed = 0;
        for instance in &running {
            match self.resume(instance).await {
                Ok(()) => resumed += 1,
                Err(e) => error!(
                    target: "orderflow::runtime",
                    instance_id = %instance,
                    error = %e,
                    "failed to recover instance"
                ),
            }
        }
        if !running.is_empty() {
            info!(target: "orderflow::runtime", found = running.len(), resumed, "recovered running instances");
        }
        Ok(resumed)
    }

    /// Stop dispatching and abort every in-flight activity. Durable state is
    /// left as is, so another runtime over the same store can recover it.
    pub async fn shutdown(self: Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        lock(&self.in_flight).clear();
        info!(target: "orderflow::runtime", "runtime shut down");
    }

    fn instance_lock(&self, instance: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.instance_locks)
            .entry(instance.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn resume_locked(self: &Arc<Self>, instance: &str) -> Result<(), OrchestrationError> {
        let mut retry = StoreRetry::default();
        loop {
            match self.resume_once(instance).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if !retry.should_retry(instance, &e).await {
                        return Err(OrchestrationError::from_provider(instance, e));
                    }
                }
            }
        }
    }

    async fn resume_once(self: &Arc<Self>, instance: &str) -> Result<(), ProviderError> {
        let Some(record) = self.history_store.get_instance(instance).await? else {
            return Err(ProviderError::unknown_instance("resume", instance));
        };
        if record.state.is_terminal() {
            lock(&self.instance_locks).remove(instance);
            debug!(target: "orderflow::runtime", instance_id = %instance, state = %record.state, "instance is terminal, nothing to resume");
            return Ok(());
        }
        let history = self.history_store.read(instance).await?;
        let next = next_seq(&history);

        if let Some(reason) = record.cancel_requested.clone() {
            self.finish(
                instance,
                next,
                vec![EventKind::OrchestratorCancelled { reason: reason.clone() }],
                TerminalOutcome::Cancelled { reason },
            )
            .await
        } else {
            self.run_turn(instance, &record, &history, next).await
        }
    }

    async fn run_turn(
        self: &Arc<Self>,
        instance: &str,
        record: &WorkflowInstance,
        history: &[Event],
        next: u64,
    ) -> Result<(), ProviderError> {
        let Some(handler) = self.orchestration_registry.get(&record.orchestration) else {
            // Left Running so a runtime with the orchestration registered can pick it up.
            error!(
                target: "orderflow::runtime",
                instance_id = %instance,
                orchestration = %record.orchestration,
                "orchestration not registered in this runtime"
            );
            return Ok(());
        };

        match replay::run_turn(instance, history, handler.as_ref(), &record.input) {
            TurnResult::Completed(output) => {
                self.finish(
                    instance,
                    next,
                    vec![EventKind::OrchestratorCompleted { output: output.clone() }],
                    TerminalOutcome::Completed { output },
                )
                .await
            }
            TurnResult::Failed(reason) => {
                self.finish(
                    instance,
                    next,
                    vec![EventKind::OrchestratorFailed { reason: reason.clone() }],
                    TerminalOutcome::Failed { reason },
                )
                .await
            }
            TurnResult::Nondeterministic(msg) => {
                let reason = format!("nondeterministic orchestration: {msg}");
                warn!(target: "orderflow::runtime", instance_id = %instance, reason = %reason, "replay diverged from history");
                self.finish(
                    instance,
                    next,
                    vec![EventKind::OrchestratorFailed { reason: reason.clone() }],
                    TerminalOutcome::Failed { reason },
                )
                .await
            }
            TurnResult::Pending { new_calls, outstanding } => {
                if !new_calls.is_empty() {
                    let kinds = new_calls
                        .iter()
                        .map(|c| EventKind::ActivityScheduled {
                            call_seq: c.call_seq,
                            name: c.name.clone(),
                            input: c.input.clone(),
                        })
                        .collect();
                    self.history_store.append(instance, next, kinds).await?;
                }
                for call in new_calls {
                    debug!(
                        target: "orderflow::runtime",
                        instance_id = %instance,
                        activity_name = %call.name,
                        call_seq = call.call_seq,
                        "activity scheduled"
                    );
                    self.dispatch(instance, call);
                }
                for call in outstanding {
                    if !lock(&self.in_flight).contains(&(instance.to_string(), call.call_seq)) {
                        warn!(
                            target: "orderflow::runtime",
                            instance_id = %instance,
                            activity_name = %call.name,
                            call_seq = call.call_seq,
                            "re-dispatching scheduled call with no completion"
                        );
                        self.dispatch(instance, call);
                    }
                }
                Ok(())
            }
        }
    }

    async fn finish(
        &self,
        instance: &str,
        expected_next_seq: u64,
        events: Vec<EventKind>,
        outcome: TerminalOutcome,
    ) -> Result<(), ProviderError> {
        let state = outcome.state();
        self.history_store
            .commit_terminal(instance, expected_next_seq, events, outcome)
            .await?;
        lock(&self.instance_locks).remove(instance);
        info!(target: "orderflow::runtime", instance_id = %instance, state = %state, "orchestration finished");
        Ok(())
    }

    /// Spawn `call` on the worker pool. Synchronous on purpose: the spawned
    /// task re-enters the scheduler through `complete_activity`.
    fn dispatch(self: &Arc<Self>, instance: &str, call: ActivityCall) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if !lock(&self.in_flight).insert((instance.to_string(), call.call_seq)) {
            return;
        }
        let rt = Arc::clone(self);
        let instance = instance.to_string();
        let mut tasks = lock(&self.tasks);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let result = rt.executor.execute_with_retry(&instance, &call).await;
            rt.complete_activity(&instance, &call, result).await;
        });
    }

    /// Run `instance` again from a background task, backing off between
    /// attempts. Used when the store refused a turn or a completion.
    fn schedule_resume(self: &Arc<Self>, instance: &str) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let rt = Arc::clone(self);
        let instance = instance.to_string();
        let mut tasks = lock(&self.tasks);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            for attempt in 1..=MAX_SCHEDULED_RESUMES {
                tokio::time::sleep(RESUME_BACKOFF.delay_for_attempt(attempt)).await;
                if rt.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                match rt.resume(&instance).await {
                    Ok(()) => return,
                    Err(e) => warn!(
                        target: "orderflow::runtime",
                        instance_id = %instance,
                        attempt,
                        error = %e,
                        "scheduled resume failed"
                    ),
                }
            }
            error!(
                target: "orderflow::runtime",
                instance_id = %instance,
                "giving up on instance until the next recovery"
            );
        });
    }

    async fn complete_activity(self: &Arc<Self>, instance: &str, call: &ActivityCall, result: Result<String, ActivityError>) {
        let instance_lock = self.instance_lock(instance);
        let _guard = instance_lock.lock().await;
        let key = (instance.to_string(), call.call_seq);
        if self.shutting_down.load(Ordering::SeqCst) {
            lock(&self.in_flight).remove(&key);
            return;
        }
        // In flight until the result is durable.
        let applied = self.apply_completion(instance, call, result).await;
        lock(&self.in_flight).remove(&key);
        if let Err(e) = applied {
            error!(
                target: "orderflow::runtime",
                instance_id = %instance,
                call_seq = call.call_seq,
                error = %e,
                "failed to record activity completion"
            );
            // The next turn finds the call outstanding and dispatches it again.
            self.schedule_resume(instance);
        }
    }

    async fn apply_completion(
        self: &Arc<Self>,
        instance: &str,
        call: &ActivityCall,
        result: Result<String, ActivityError>,
    ) -> Result<(), OrchestrationError> {
        let mut retry = StoreRetry::default();
        loop {
            match self.record_completion(instance, call, &result).await {
                Ok(Applied::Resume) => return self.resume_locked(instance).await,
                Ok(Applied::Done) => return Ok(()),
                Err(e) => {
                    if !retry.should_retry(instance, &e).await {
                        return Err(OrchestrationError::from_provider(instance, e));
                    }
                }
            }
        }
    }

    async fn record_completion(
        &self,
        instance: &str,
        call: &ActivityCall,
        result: &Result<String, ActivityError>,
    ) -> Result<Applied, ProviderError> {
        let Some(record) = self.history_store.get_instance(instance).await? else {
            warn!(target: "orderflow::runtime", instance_id = %instance, call_seq = call.call_seq, "completion for unknown instance dropped");
            return Ok(Applied::Done);
        };
        if record.state.is_terminal() {
            lock(&self.instance_locks).remove(instance);
            info!(
                target: "orderflow::runtime",
                instance_id = %instance,
                call_seq = call.call_seq,
                state = %record.state,
                "late completion for terminal instance dropped"
            );
            return Ok(Applied::Done);
        }
        if record.cancel_requested.is_some() {
            return Ok(Applied::Resume);
        }

        let history = self.history_store.read(instance).await?;
        let scheduled = history
            .iter()
            .any(|e| matches!(&e.kind, EventKind::ActivityScheduled { call_seq, .. } if *call_seq == call.call_seq));
        let completed = history
            .iter()
            .any(|e| e.kind.is_activity_completion() && e.kind.call_seq() == Some(call.call_seq));
        if !scheduled || completed {
            warn!(
                target: "orderflow::runtime",
                instance_id = %instance,
                call_seq = call.call_seq,
                scheduled,
                completed,
                "unexpected completion dropped"
            );
            return Ok(Applied::Done);
        }
        let next = next_seq(&history);

        match result {
            Ok(output) => {
                self.history_store
                    .append(
                        instance,
                        next,
                        vec![EventKind::ActivityCompleted {
                            call_seq: call.call_seq,
                            result: output.clone(),
                        }],
                    )
                    .await?;
                Ok(Applied::Resume)
            }
            Err(err) => {
                // Fail fast: the orchestration does not run again.
                let detail = match err {
                    ActivityError::UnknownActivity(_) => err.to_string(),
                    _ => err.message().to_string(),
                };
                let reason = format!("activity {} failed: {detail}", call.name);
                self.history_store
                    .commit_terminal(
                        instance,
                        next,
                        vec![
                            EventKind::ActivityFailed {
                                call_seq: call.call_seq,
                                reason: detail,
                            },
                            EventKind::OrchestratorFailed { reason: reason.clone() },
                        ],
                        TerminalOutcome::Failed { reason },
                    )
                    .await?;
                lock(&self.instance_locks).remove(instance);
                warn!(
                    target: "orderflow::runtime",
                    instance_id = %instance,
                    activity_name = %call.name,
                    call_seq = call.call_seq,
                    "orchestration failed on activity failure"
                );
                Ok(Applied::Done)
            }
        }
    }
}
