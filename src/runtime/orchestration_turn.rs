use crate::runtime::OrchestrationHandler;
use crate::{
    Action, AppErrorKind, ConfigErrorKind, ErrorDetails, Event, OrchestrationContext, describe_schedule_event, poll_once,
};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::task::Poll;
use tracing::debug;

/// Result of executing an orchestration turn
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Still waiting on durable work
    Continue,
    Completed(String),
    Failed(ErrorDetails),
    ContinueAsNew { input: String },
}

/// One replay of an orchestration over its current history.
///
/// The handler is polled exactly once; everything it can observe is already
/// in history, so a single poll drives it as far as it can go.
pub struct OrchestrationTurn {
    instance: String,
    orchestration_name: String,
    turn_index: u64,
    baseline_history: Vec<Event>,
    replay_boundary: u64,
    history_delta: Vec<Event>,
    pending_actions: Vec<Action>,
    cancelled_sources: Vec<u64>,
}

impl OrchestrationTurn {
    /// `replay_boundary` is the highest event id persisted before this turn.
    pub fn new(
        instance: impl Into<String>,
        orchestration_name: impl Into<String>,
        baseline_history: Vec<Event>,
        replay_boundary: u64,
    ) -> Self {
        Self {
            instance: instance.into(),
            orchestration_name: orchestration_name.into(),
            turn_index: replay_boundary,
            baseline_history,
            replay_boundary,
            history_delta: Vec::new(),
            pending_actions: Vec::new(),
            cancelled_sources: Vec::new(),
        }
    }

    pub fn execute(&mut self, handler: Arc<dyn OrchestrationHandler>, input: String) -> TurnOutcome {
        debug!(
            target: "durable_e2e::runtime",
            instance = %self.instance,
            turn_index = self.turn_index,
            "executing orchestration turn"
        );

        let max_before = self.baseline_history.iter().map(|e| e.event_id).max().unwrap_or(0);
        let ctx = OrchestrationContext::with_replay_boundary(self.baseline_history.clone(), self.replay_boundary);
        ctx.set_turn_index(self.turn_index);

        let run_result = catch_unwind(AssertUnwindSafe(|| {
            let mut fut = handler.invoke(ctx.clone(), input);
            poll_once(fut.as_mut())
        }));

        let poll = match run_result {
            Ok(poll) => poll,
            Err(panic_payload) => {
                let msg = super::panic_message(&*panic_payload)
                    .unwrap_or_else(|| "orchestration panicked".to_string());
                return TurnOutcome::Failed(ErrorDetails::Application {
                    kind: AppErrorKind::Panicked,
                    message: format!("Orchestrator function '{}' panicked: {msg}", self.orchestration_name),
                    retryable: false,
                });
            }
        };

        let mut inner = ctx.lock();
        if let Some(err) = inner.nondeterminism_error.take() {
            return TurnOutcome::Failed(self.nondeterminism(err));
        }

        self.history_delta = inner.history.iter().filter(|e| e.event_id > max_before).cloned().collect();
        self.pending_actions = std::mem::take(&mut inner.actions);
        let mut cancelled: Vec<u64> = inner.cancelled_source_ids.iter().copied().collect();
        cancelled.sort_unstable();
        self.cancelled_sources = cancelled;

        let unclaimed = inner
            .history
            .iter()
            .find(|e| e.is_schedule() && !inner.claimed_scheduling_events.contains(&e.event_id))
            .map(|e| describe_schedule_event(&e.kind));
        drop(inner);

        // Continue-as-new wins over whatever the handler returned
        if let Some(input) = self.pending_actions.iter().find_map(|a| match a {
            Action::ContinueAsNew { input } => Some(input.clone()),
            _ => None,
        }) {
            return TurnOutcome::ContinueAsNew { input };
        }

        match poll {
            Poll::Pending => TurnOutcome::Continue,
            Poll::Ready(Ok(output)) => match unclaimed {
                Some(schedule) => TurnOutcome::Failed(self.nondeterminism(format!(
                    "nondeterministic: orchestration completed but history still holds {schedule}"
                ))),
                None => TurnOutcome::Completed(output),
            },
            Poll::Ready(Err(error)) => TurnOutcome::Failed(ErrorDetails::Application {
                kind: AppErrorKind::OrchestrationFailed,
                message: format!("Orchestrator function '{}' failed: {error}", self.orchestration_name),
                retryable: false,
            }),
        }
    }

    fn nondeterminism(&mut self, message: String) -> ErrorDetails {
        self.history_delta.clear();
        self.pending_actions.clear();
        self.cancelled_sources.clear();
        ErrorDetails::Configuration {
            kind: ConfigErrorKind::Nondeterminism,
            resource: self.orchestration_name.clone(),
            message: Some(message),
        }
    }

    pub fn turn_index(&self) -> u64 {
        self.turn_index
    }

    /// Scheduling events appended during the turn.
    pub fn history_delta(&self) -> &[Event] {
        &self.history_delta
    }

    pub fn pending_actions(&self) -> &[Action] {
        &self.pending_actions
    }

    /// Scheduling ids whose futures lost a select.
    pub fn cancelled_sources(&self) -> &[u64] {
        &self.cancelled_sources
    }

    pub fn made_progress(&self) -> bool {
        !self.history_delta.is_empty()
    }
}
