//! One deterministic evaluation of an orchestration against its history.
//!
//! The orchestration future is polled exactly once with a no-op waker.
//! Every activity future it awaits resolves synchronously from history or
//! stays pending, so a single poll either finishes the function or leaves it
//! suspended on calls that still need results.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::task::{Context, Poll};

use tracing::debug;

use super::activity::panic_message;
use super::registry::OrchestrationHandler;
use crate::{ActivityCall, Event, OrchestrationContext};

/// Result of executing an orchestration turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnResult {
    /// Suspended. `new_calls` must be recorded and dispatched; `outstanding`
    /// are recorded calls still waiting for a completion.
    Pending {
        new_calls: Vec<ActivityCall>,
        outstanding: Vec<ActivityCall>,
    },
    /// Orchestration returned its output
    Completed(String),
    /// Orchestration returned an error or panicked
    Failed(String),
    /// The function's calls no longer match the recorded history
    Nondeterministic(String),
}

/// Replay `history` through `handler` and report what the function did.
pub fn run_turn(instance: &str, history: &[Event], handler: &dyn OrchestrationHandler, input: &str) -> TurnResult {
    let ctx = OrchestrationContext::new(instance, history);
    let waker = ::futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);

    let polled = catch_unwind(AssertUnwindSafe(|| {
        let mut fut = handler.invoke(ctx.clone(), input.to_string());
        fut.as_mut().poll(&mut cx)
    }));
    let state = ctx.finish_turn();

    let polled = match polled {
        Ok(p) => p,
        Err(panic) => {
            return TurnResult::Failed(format!("orchestration panicked: {}", panic_message(&*panic)));
        }
    };

    if let Some(msg) = state.nondeterminism {
        return TurnResult::Nondeterministic(msg);
    }
    if !state.unreached.is_empty() {
        return TurnResult::Nondeterministic(format!(
            "history records calls {:?} that the orchestration no longer makes",
            state.unreached
        ));
    }

    match polled {
        Poll::Ready(Ok(output)) => TurnResult::Completed(output),
        Poll::Ready(Err(reason)) => TurnResult::Failed(reason),
        Poll::Pending if state.new_calls.is_empty() && state.outstanding.is_empty() => TurnResult::Failed(
            "orchestration suspended without awaiting an activity".to_string(),
        ),
        Poll::Pending => {
            debug!(
                target: "orderflow::runtime",
                instance_id = %instance,
                new_calls = state.new_calls.len(),
                outstanding = state.outstanding.len(),
                "orchestration suspended"
            );
            TurnResult::Pending {
                new_calls: state.new_calls,
                outstanding: state.outstanding,
            }
        }
    }
}
