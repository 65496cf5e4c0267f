use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;

use crate::_typed_codec::{Codec, Json};
use crate::entity::EntityError;
use crate::{EventKind, OrchestrationContext, ScheduleRequest};

/// What a [`DurableFuture`] resolves to, by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
    Entity(Result<String, EntityError>),
}

/// A scheduled unit of durable work.
///
/// On first poll the future claims the next unclaimed scheduling event in
/// history (or appends a new one) and then resolves once history holds the
/// completion that points back at it.
pub struct DurableFuture {
    pub(crate) request: ScheduleRequest,
    pub(crate) claimed_event_id: Cell<Option<u64>>,
    /// Event id of the `ExternalEvent` this future took, if any.
    pub(crate) consumed_external: Cell<Option<u64>>,
    pub(crate) ctx: OrchestrationContext,
}

impl DurableFuture {
    fn new(ctx: OrchestrationContext, request: ScheduleRequest) -> Self {
        Self {
            request,
            claimed_event_id: Cell::new(None),
            consumed_external: Cell::new(None),
            ctx,
        }
    }

    pub(crate) fn activity(ctx: OrchestrationContext, name: String, input: String) -> Self {
        Self::new(ctx, ScheduleRequest::Activity { name, input })
    }

    pub(crate) fn timer(ctx: OrchestrationContext, fire_at_ms: u64) -> Self {
        Self::new(ctx, ScheduleRequest::Timer { fire_at_ms })
    }

    pub(crate) fn external(ctx: OrchestrationContext, name: String) -> Self {
        Self::new(ctx, ScheduleRequest::External { name })
    }

    pub(crate) fn entity(
        ctx: OrchestrationContext,
        entity: crate::EntityId,
        operation: String,
        input: String,
    ) -> Self {
        Self::new(
            ctx,
            ScheduleRequest::Entity {
                entity,
                operation,
                input,
            },
        )
    }

    /// Scheduling event id claimed by this future, once polled.
    pub fn scheduling_event_id(&self) -> Option<u64> {
        self.claimed_event_id.get()
    }

    /// Claim a schedule and look for the completion without consuming time.
    ///
    /// Returns the completion's event id with the output.
    pub(crate) fn poll_completion(&self) -> Poll<(u64, DurableOutput)> {
        let mut inner = self.ctx.lock();
        if inner.nondeterminism_error.is_some() {
            return Poll::Pending;
        }

        let source_id = match self.claimed_event_id.get() {
            Some(id) => id,
            None => match inner.claim_or_schedule(&self.request) {
                Some(id) => {
                    self.claimed_event_id.set(Some(id));
                    id
                }
                None => return Poll::Pending,
            },
        };

        if let ScheduleRequest::External { name } = &self.request {
            if let Some(eid) = self.consumed_external.get() {
                let data = inner.history.iter().find_map(|e| match &e.kind {
                    EventKind::ExternalEvent { data, .. } if e.event_id == eid => Some(data.clone()),
                    _ => None,
                });
                return match data {
                    Some(d) => Poll::Ready((eid, DurableOutput::External(d))),
                    None => Poll::Pending,
                };
            }
            let found = inner.history.iter().find_map(|e| match &e.kind {
                EventKind::ExternalEvent { name: n, data }
                    if n == name && !inner.consumed_externals.contains(&e.event_id) =>
                {
                    Some((e.event_id, data.clone()))
                }
                _ => None,
            });
            return match found {
                Some((eid, data)) => {
                    inner.consumed_externals.insert(eid);
                    self.consumed_external.set(Some(eid));
                    Poll::Ready((eid, DurableOutput::External(data)))
                }
                None => Poll::Pending,
            };
        }

        let completion = inner
            .history
            .iter()
            .filter(|e| e.source_event_id == Some(source_id))
            .find_map(|e| {
                let out = match &e.kind {
                    EventKind::ActivityCompleted { result } => DurableOutput::Activity(Ok(result.clone())),
                    EventKind::ActivityFailed { details } => DurableOutput::Activity(Err(details.display_message())),
                    EventKind::TimerFired { .. } => DurableOutput::Timer,
                    EventKind::EntityCallCompleted { result } => DurableOutput::Entity(Ok(result.clone())),
                    EventKind::EntityCallFailed { error } => DurableOutput::Entity(Err(error.clone())),
                    _ => return None,
                };
                Some((e.event_id, out))
            });

        match completion {
            Some(c) => Poll::Ready(c),
            None => Poll::Pending,
        }
    }

    /// Give back an external event taken by a losing select branch.
    pub(crate) fn release(&self) {
        if let Some(eid) = self.consumed_external.take() {
            self.ctx.lock().consumed_externals.remove(&eid);
        }
    }

    pub fn into_activity(self) -> impl Future<Output = Result<String, String>> + Send {
        async move {
            match self.await {
                DurableOutput::Activity(v) => v,
                other => panic!("into_activity used on non-activity future: {other:?}"),
            }
        }
    }

    pub fn into_activity_typed<Out: DeserializeOwned>(self) -> impl Future<Output = Result<Out, String>> + Send {
        async move {
            match self.await {
                DurableOutput::Activity(Ok(s)) => Json::decode::<Out>(&s),
                DurableOutput::Activity(Err(e)) => Err(e),
                other => panic!("into_activity_typed used on non-activity future: {other:?}"),
            }
        }
    }

    pub fn into_timer(self) -> impl Future<Output = ()> + Send {
        async move {
            match self.await {
                DurableOutput::Timer => {}
                other => panic!("into_timer used on non-timer future: {other:?}"),
            }
        }
    }

    pub fn into_event(self) -> impl Future<Output = String> + Send {
        async move {
            match self.await {
                DurableOutput::External(v) => v,
                other => panic!("into_event used on non-external future: {other:?}"),
            }
        }
    }

    pub fn into_entity(self) -> impl Future<Output = Result<String, EntityError>> + Send {
        async move {
            match self.await {
                DurableOutput::Entity(v) => v,
                other => panic!("into_entity used on non-entity future: {other:?}"),
            }
        }
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.poll_completion() {
            Poll::Ready((completion_id, output)) => {
                this.ctx.lock().observe_completion(completion_id);
                Poll::Ready(output)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

// poll() projects &mut self freely; keep DurableFuture Unpin.
const fn assert_unpin<T: Unpin>() {}
const _: () = {
    assert_unpin::<DurableFuture>();
};

/// Resolves with `(winner_index, output)` for the child completed earliest in history.
pub struct SelectFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl SelectFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self { ctx, children }
    }
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        // Every child claims its schedule, even when an earlier one is already done
        let mut ready: Vec<(usize, u64, DurableOutput)> = Vec::new();
        for (i, child) in this.children.iter().enumerate() {
            if let Poll::Ready((completion_id, output)) = child.poll_completion() {
                ready.push((i, completion_id, output));
            }
        }

        if this.ctx.lock().nondeterminism_error.is_some() {
            return Poll::Pending;
        }

        let Some(winner_pos) = ready
            .iter()
            .enumerate()
            .min_by_key(|(_, (_, completion_id, _))| *completion_id)
            .map(|(pos, _)| pos)
        else {
            return Poll::Pending;
        };
        let (winner_index, completion_id, output) = ready.swap_remove(winner_pos);

        for (i, child) in this.children.iter().enumerate() {
            if i == winner_index {
                continue;
            }
            child.release();
            if let Some(source_id) = child.claimed_event_id.get() {
                this.ctx.lock().cancelled_source_ids.insert(source_id);
            }
        }
        this.ctx.lock().observe_completion(completion_id);

        Poll::Ready((winner_index, output))
    }
}

/// Resolves once every child has completed, outputs ordered by completion in history.
pub struct JoinFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
    results: Vec<Option<(u64, DurableOutput)>>,
}

impl JoinFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        let results = children.iter().map(|_| None).collect();
        Self { ctx, children, results }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        for (i, child) in this.children.iter().enumerate() {
            if this.results[i].is_some() {
                continue;
            }
            if let Poll::Ready(done) = child.poll_completion() {
                this.results[i] = Some(done);
            }
        }

        if this.results.iter().any(|r| r.is_none()) {
            return Poll::Pending;
        }

        let mut items: Vec<(u64, DurableOutput)> = this.results.iter_mut().filter_map(|r| r.take()).collect();
        items.sort_by_key(|(completion_id, _)| *completion_id);
        let mut inner = this.ctx.lock();
        for (completion_id, _) in &items {
            inner.observe_completion(*completion_id);
        }
        Poll::Ready(items.into_iter().map(|(_, out)| out).collect())
    }
}
