use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{ActivityCall, OrchestrationContext};

/// Future returned by [`OrchestrationContext::schedule_activity`].
///
/// Resolves from history only. While no completion is recorded it stays
/// pending, and the first poll of a call that is not yet in history turns it
/// into a new scheduling decision for the current turn.
///
/// Several of these can be awaited together with
/// `futures::future::join_all`; results come back in call order whatever the
/// order the completions arrived in.
pub struct ActivityFuture {
    call: ActivityCall,
    scheduled: bool,
    ctx: OrchestrationContext,
}

impl ActivityFuture {
    pub(crate) fn new(call: ActivityCall, ctx: OrchestrationContext) -> Self {
        Self {
            call,
            scheduled: false,
            ctx,
        }
    }

    /// Position of this call in the orchestration's call order.
    pub fn call_seq(&self) -> u64 {
        self.call.call_seq
    }

    pub fn activity_name(&self) -> &str {
        &self.call.name
    }
}

impl Future for ActivityFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx.lock();
        inner.poll_call(&this.call, &mut this.scheduled)
    }
}
