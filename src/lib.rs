//! Durable, replay-driven orchestration core for order workflows.
//!
//! An orchestration is an ordinary `async fn(OrchestrationContext, String)`
//! that schedules named activities. Every decision it makes is checkpointed as
//! an append-only [`Event`] through a [`providers::Provider`], and every turn
//! re-executes the function from the top against that history. Calls that are
//! already recorded resolve synchronously with their recorded result; the first
//! unrecorded call is scheduled and the function suspends. A process can stop
//! between any two activities and a fresh [`Runtime`] resumes it from history.
//!
//! - Data model: [`Event`], [`EventKind`], [`ActivityCall`]
//! - Orchestration surface: [`OrchestrationContext`], [`ActivityFuture`]
//! - Scheduler: [`Runtime`] with [`RuntimeOptions`]
//! - Status lookups: [`InstanceRegistry`]
//! - Order workflow and its entry point: [`orders`], [`gateway`]
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::Poll;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod codec;
pub mod errors;
pub mod futures;
pub mod gateway;
pub mod logging;
pub mod orders;
pub mod providers;
pub mod runtime;

pub use errors::{ActivityError, OrchestrationError};
pub use futures::ActivityFuture;
pub use runtime::registry::{ActivityContext, ActivityRegistry, OrchestrationRegistry};
pub use runtime::retry::{BackoffStrategy, RetryPolicy};
pub use runtime::status::InstanceRegistry;
pub use runtime::{OrchestrationStatus, Runtime, RuntimeOptions};

/// Milliseconds since the Unix epoch, saturating to zero on a skewed clock.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One immutable entry of an instance's history.
///
/// `seq` is assigned by the provider on append, starts at 0 and is strictly
/// consecutive per instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

impl Event {
    pub fn new(seq: u64, kind: EventKind) -> Self {
        Self {
            seq,
            timestamp_ms: now_ms(),
            kind,
        }
    }
}

/// What happened. Activity variants correlate through `call_seq`, the
/// position of the call in the orchestration's deterministic call order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum EventKind {
    /// Instance was created for the named orchestration with this input.
    OrchestratorStarted { name: String, input: String },
    /// Activity call was durably recorded before dispatch.
    ActivityScheduled { call_seq: u64, name: String, input: String },
    /// Activity returned a result.
    ActivityCompleted { call_seq: u64, result: String },
    /// Activity failed permanently (or exhausted its retries).
    ActivityFailed { call_seq: u64, reason: String },
    /// Orchestration returned its output. Terminal.
    OrchestratorCompleted { output: String },
    /// Orchestration failed. Terminal.
    OrchestratorFailed { reason: String },
    /// Orchestration was cancelled on request. Terminal.
    OrchestratorCancelled { reason: String },
}

impl EventKind {
    /// Stable name used for storage columns and log fields.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::OrchestratorStarted { .. } => "OrchestratorStarted",
            EventKind::ActivityScheduled { .. } => "ActivityScheduled",
            EventKind::ActivityCompleted { .. } => "ActivityCompleted",
            EventKind::ActivityFailed { .. } => "ActivityFailed",
            EventKind::OrchestratorCompleted { .. } => "OrchestratorCompleted",
            EventKind::OrchestratorFailed { .. } => "OrchestratorFailed",
            EventKind::OrchestratorCancelled { .. } => "OrchestratorCancelled",
        }
    }

    pub fn call_seq(&self) -> Option<u64> {
        match self {
            EventKind::ActivityScheduled { call_seq, .. }
            | EventKind::ActivityCompleted { call_seq, .. }
            | EventKind::ActivityFailed { call_seq, .. } => Some(*call_seq),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::OrchestratorCompleted { .. }
                | EventKind::OrchestratorFailed { .. }
                | EventKind::OrchestratorCancelled { .. }
        )
    }

    /// True for `ActivityCompleted` / `ActivityFailed`.
    pub fn is_activity_completion(&self) -> bool {
        matches!(
            self,
            EventKind::ActivityCompleted { .. } | EventKind::ActivityFailed { .. }
        )
    }
}

/// A request to run one activity, correlated to its completion by `call_seq`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityCall {
    pub call_seq: u64,
    pub name: String,
    pub input: String,
}

#[derive(Debug)]
struct RecordedCall {
    name: String,
    input: String,
    outcome: Option<Result<String, String>>,
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    instance: String,
    recorded: BTreeMap<u64, RecordedCall>,
    next_call_seq: u64,
    new_calls: Vec<ActivityCall>,
    outstanding: BTreeMap<u64, ActivityCall>,
    nondeterminism: Option<String>,
    completions_total: usize,
    completions_seen: usize,
}

impl CtxInner {
    fn new(instance: String, history: &[Event]) -> Self {
        let mut inner = Self {
            instance,
            recorded: BTreeMap::new(),
            next_call_seq: 0,
            new_calls: Vec::new(),
            outstanding: BTreeMap::new(),
            nondeterminism: None,
            completions_total: 0,
            completions_seen: 0,
        };
        for ev in history {
            match &ev.kind {
                EventKind::ActivityScheduled { call_seq, name, input } => {
                    if inner.recorded.contains_key(call_seq) {
                        inner.flag(format!("call {call_seq} is scheduled more than once in history"));
                        continue;
                    }
                    inner.recorded.insert(
                        *call_seq,
                        RecordedCall {
                            name: name.clone(),
                            input: input.clone(),
                            outcome: None,
                        },
                    );
                }
                EventKind::ActivityCompleted { call_seq, result } => {
                    inner.record_outcome(*call_seq, Ok(result.clone()));
                }
                EventKind::ActivityFailed { call_seq, reason } => {
                    inner.record_outcome(*call_seq, Err(reason.clone()));
                }
                _ => {}
            }
        }
        inner
    }

    fn record_outcome(&mut self, call_seq: u64, outcome: Result<String, String>) {
        match self.recorded.get_mut(&call_seq) {
            Some(rec) if rec.outcome.is_none() => {
                rec.outcome = Some(outcome);
                self.completions_total += 1;
            }
            Some(_) => self.flag(format!("call {call_seq} has more than one completion in history")),
            None => self.flag(format!("completion for call {call_seq} has no matching schedule")),
        }
    }

    fn flag(&mut self, msg: String) {
        if self.nondeterminism.is_none() {
            self.nondeterminism = Some(msg);
        }
    }

    fn next_call_seq(&mut self) -> u64 {
        let seq = self.next_call_seq;
        self.next_call_seq += 1;
        seq
    }

    /// Resolve `call` against history. Records a new call the first time an
    /// unscheduled call is polled.
    pub(crate) fn poll_call(&mut self, call: &ActivityCall, scheduled: &mut bool) -> Poll<Result<String, String>> {
        let outcome = match self.recorded.get(&call.call_seq) {
            Some(rec) if rec.name != call.name || rec.input != call.input => {
                let msg = format!(
                    "call {} issued activity '{}' but history recorded '{}'",
                    call.call_seq, call.name, rec.name
                );
                self.flag(msg);
                return Poll::Pending;
            }
            Some(rec) => rec.outcome.clone(),
            None => {
                if !*scheduled {
                    *scheduled = true;
                    self.new_calls.push(call.clone());
                }
                return Poll::Pending;
            }
        };
        match outcome {
            Some(result) => {
                self.completions_seen += 1;
                Poll::Ready(result)
            }
            None => {
                self.outstanding.insert(call.call_seq, call.clone());
                Poll::Pending
            }
        }
    }
}

/// Everything one turn produced, drained from the context after polling.
#[derive(Debug, Default)]
pub(crate) struct TurnState {
    pub new_calls: Vec<ActivityCall>,
    pub outstanding: Vec<ActivityCall>,
    pub nondeterminism: Option<String>,
    /// Recorded calls the function never reached this turn.
    pub unreached: Vec<u64>,
}

/// Handle passed to orchestration functions for scheduling activities.
///
/// A context is built fresh for every turn from the instance history. Calls
/// receive consecutive `call_seq` numbers in the order the function creates
/// them, so the function must create them in the same order on every replay.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Build a context over `history` for `instance`.
    pub fn new(instance: impl Into<String>, history: &[Event]) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance.into(), history))),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance.clone()
    }

    /// True while the function is still consuming recorded completions.
    /// Side-effect-free code such as logging should stay quiet while this
    /// holds, otherwise it repeats on every turn.
    pub fn is_replaying(&self) -> bool {
        let inner = self.lock();
        inner.completions_seen < inner.completions_total
    }

    /// Schedule `name` with `input`. The returned future resolves to the
    /// activity's result or failure reason.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> ActivityFuture {
        let call_seq = self.lock().next_call_seq();
        ActivityFuture::new(
            ActivityCall {
                call_seq,
                name: name.into(),
                input: input.into(),
            },
            self.clone(),
        )
    }

    pub(crate) fn finish_turn(&self) -> TurnState {
        let mut inner = self.lock();
        let issued = inner.next_call_seq;
        let unreached = inner.recorded.keys().copied().filter(|seq| *seq >= issued).collect();
        TurnState {
            new_calls: std::mem::take(&mut inner.new_calls),
            outstanding: std::mem::take(&mut inner.outstanding).into_values().collect(),
            nondeterminism: inner.nondeterminism.take(),
            unreached,
        }
    }
}
