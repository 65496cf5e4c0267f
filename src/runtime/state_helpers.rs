use crate::providers::{RuntimeStatus, WorkItem};
use crate::{Event, EventKind};
use tracing::warn;

/// Current-execution history plus the events a turn appends to it.
///
/// Derived flags describe the persisted history together with the delta, so
/// they stay accurate while messages are folded in.
#[derive(Debug, Clone)]
pub struct HistoryManager {
    history: Vec<Event>,
    delta: Vec<Event>,
}

impl HistoryManager {
    pub fn from_history(history: &[Event]) -> Self {
        Self {
            history: history.to_vec(),
            delta: Vec::new(),
        }
    }

    fn events(&self) -> impl Iterator<Item = &Event> {
        self.history.iter().chain(self.delta.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty() && self.delta.is_empty()
    }

    pub fn next_event_id(&self) -> u64 {
        self.events().map(|e| e.event_id).max().unwrap_or(0) + 1
    }

    /// Highest event id that was persisted before this turn.
    pub fn persisted_watermark(&self) -> u64 {
        self.history.iter().map(|e| e.event_id).max().unwrap_or(0)
    }

    pub fn append(&mut self, event: Event) {
        self.delta.push(event);
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = Event>) {
        self.delta.extend(events);
    }

    /// Append a new event with the next id.
    pub fn append_kind(&mut self, instance: &str, execution_id: u64, source: Option<u64>, kind: EventKind) {
        let id = self.next_event_id();
        self.append(Event::with_event_id(id, instance, execution_id, source, kind));
    }

    pub fn append_failed(&mut self, instance: &str, execution_id: u64, details: crate::ErrorDetails) {
        self.append_kind(instance, execution_id, None, EventKind::OrchestrationFailed { details });
    }

    pub fn delta(&self) -> &[Event] {
        &self.delta
    }

    pub fn into_delta(self) -> Vec<Event> {
        self.delta
    }

    pub fn full_history(&self) -> Vec<Event> {
        self.events().cloned().collect()
    }

    fn started(&self) -> Option<(&str, &str, &str)> {
        self.events().find_map(|e| match &e.kind {
            EventKind::OrchestrationStarted { name, version, input } => {
                Some((name.as_str(), version.as_str(), input.as_str()))
            }
            _ => None,
        })
    }

    pub fn orchestration_name(&self) -> Option<String> {
        self.started().map(|(n, _, _)| n.to_string())
    }

    pub fn version(&self) -> Option<String> {
        self.started().map(|(_, v, _)| v.to_string())
    }

    pub fn input(&self) -> Option<String> {
        self.started().map(|(_, _, i)| i.to_string())
    }

    pub fn terminal_event(&self) -> Option<&Event> {
        self.events().find(|e| e.is_terminal())
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_event().is_some()
    }

    pub fn is_continued_as_new(&self) -> bool {
        matches!(
            self.terminal_event().map(|e| &e.kind),
            Some(EventKind::OrchestrationContinuedAsNew { .. })
        )
    }

    /// Suspended when the latest suspend/resume marker is a suspend.
    pub fn is_suspended(&self) -> bool {
        self.events()
            .filter_map(|e| match e.kind {
                EventKind::ExecutionSuspended { .. } => Some(true),
                EventKind::ExecutionResumed { .. } => Some(false),
                _ => None,
            })
            .last()
            .unwrap_or(false)
    }

    /// Lifecycle status implied by the history.
    pub fn status(&self) -> RuntimeStatus {
        match self.terminal_event().map(|e| &e.kind) {
            Some(EventKind::OrchestrationCompleted { .. }) => RuntimeStatus::Completed,
            Some(EventKind::OrchestrationFailed { .. }) => RuntimeStatus::Failed,
            Some(EventKind::OrchestrationTerminated { .. }) => RuntimeStatus::Terminated,
            Some(EventKind::OrchestrationContinuedAsNew { .. }) => RuntimeStatus::ContinuedAsNew,
            _ if self.is_empty() => RuntimeStatus::Pending,
            _ if self.is_suspended() => RuntimeStatus::Suspended,
            _ => RuntimeStatus::Running,
        }
    }

    fn has_schedule(&self, id: u64, expected: ScheduleKind) -> bool {
        self.events().any(|e| e.event_id == id && expected.matches(&e.kind))
    }

    fn has_completion_for(&self, source: u64) -> bool {
        self.events().any(|e| e.source_event_id == Some(source))
    }

    /// Activity schedules that never got a completion.
    pub fn outstanding_activities(&self) -> Vec<u64> {
        self.events()
            .filter(|e| matches!(e.kind, EventKind::ActivityScheduled { .. }))
            .map(|e| e.event_id)
            .filter(|id| !self.has_completion_for(*id))
            .collect()
    }

    pub fn is_activity_schedule(&self, id: u64) -> bool {
        self.has_schedule(id, ScheduleKind::Activity)
    }
}

/// Orchestrator-queue messages of one batch, sorted by role.
#[derive(Debug, Clone, Default)]
pub struct WorkItemReader {
    /// Name from `StartOrchestration`/`ContinueAsNew`, or the one in history.
    pub orchestration_name: String,
    pub input: String,
    pub has_start: bool,
    pub is_continue_as_new: bool,
    /// Everything except start messages, in arrival order.
    pub completion_messages: Vec<WorkItem>,
}

impl WorkItemReader {
    pub fn from_messages(messages: &[WorkItem], history_mgr: &HistoryManager, instance: &str) -> Self {
        let mut reader = WorkItemReader::default();

        for msg in messages {
            match msg {
                WorkItem::StartOrchestration {
                    orchestration, input, ..
                } => {
                    if reader.has_start {
                        warn!(target: "durable_e2e::runtime", instance = %instance, "Duplicate start message in batch, ignoring");
                        continue;
                    }
                    reader.has_start = true;
                    reader.orchestration_name = orchestration.clone();
                    reader.input = input.clone();
                }
                WorkItem::ContinueAsNew {
                    orchestration, input, ..
                } => {
                    reader.has_start = true;
                    reader.is_continue_as_new = true;
                    reader.orchestration_name = orchestration.clone();
                    reader.input = input.clone();
                }
                other => reader.completion_messages.push(other.clone()),
            }
        }

        if !reader.has_start
            && let Some(name) = history_mgr.orchestration_name()
        {
            reader.orchestration_name = name;
            reader.input = history_mgr.input().unwrap_or_default();
        }

        reader
    }

    pub fn has_orchestration_name(&self) -> bool {
        !self.orchestration_name.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum ScheduleKind {
    Activity,
    Timer,
    Entity,
}

impl ScheduleKind {
    fn matches(self, kind: &EventKind) -> bool {
        match self {
            ScheduleKind::Activity => matches!(kind, EventKind::ActivityScheduled { .. }),
            ScheduleKind::Timer => matches!(kind, EventKind::TimerCreated { .. }),
            ScheduleKind::Entity => matches!(kind, EventKind::EntityCallScheduled { .. }),
        }
    }
}

/// `(execution_id, source_id, completion event, schedule it answers)` for completion messages.
fn completion_of(msg: &WorkItem) -> Option<(u64, u64, EventKind, ScheduleKind)> {
    match msg {
        WorkItem::ActivityCompleted {
            execution_id, id, result, ..
        } => Some((
            *execution_id,
            *id,
            EventKind::ActivityCompleted { result: result.clone() },
            ScheduleKind::Activity,
        )),
        WorkItem::ActivityFailed {
            execution_id, id, details, ..
        } => Some((
            *execution_id,
            *id,
            EventKind::ActivityFailed {
                details: details.clone(),
            },
            ScheduleKind::Activity,
        )),
        WorkItem::TimerFired {
            execution_id,
            id,
            fire_at_ms,
            ..
        } => Some((
            *execution_id,
            *id,
            EventKind::TimerFired { fire_at_ms: *fire_at_ms },
            ScheduleKind::Timer,
        )),
        WorkItem::EntityCompleted {
            execution_id, id, result, ..
        } => Some((
            *execution_id,
            *id,
            EventKind::EntityCallCompleted { result: result.clone() },
            ScheduleKind::Entity,
        )),
        WorkItem::EntityFailed {
            execution_id, id, error, ..
        } => Some((
            *execution_id,
            *id,
            EventKind::EntityCallFailed { error: error.clone() },
            ScheduleKind::Entity,
        )),
        _ => None,
    }
}

/// Outcome of folding one batch's messages into history.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FoldOutcome {
    pub terminated: Option<String>,
    pub dropped: usize,
}

/// Fold completion and control messages into `history_mgr`.
///
/// Completions for other executions, without a matching schedule, or already
/// present are dropped. A cancel message terminates the execution and stops
/// the fold.
pub fn fold_messages(
    history_mgr: &mut HistoryManager,
    messages: &[WorkItem],
    instance: &str,
    execution_id: u64,
) -> FoldOutcome {
    let mut outcome = FoldOutcome::default();

    for msg in messages {
        if let Some((exec, id, kind, expected)) = completion_of(msg) {
            if exec != execution_id {
                warn!(target: "durable_e2e::runtime", instance = %instance, execution_id = exec, id, "Dropping completion for another execution");
                outcome.dropped += 1;
            } else if !history_mgr.has_schedule(id, expected) {
                warn!(target: "durable_e2e::runtime", instance = %instance, id, "Dropping completion without a matching schedule");
                outcome.dropped += 1;
            } else if history_mgr.has_completion_for(id) {
                warn!(target: "durable_e2e::runtime", instance = %instance, id, "Dropping duplicate completion");
                outcome.dropped += 1;
            } else {
                history_mgr.append_kind(instance, execution_id, Some(id), kind);
            }
            continue;
        }

        match msg {
            WorkItem::ExternalRaised { name, data, .. } => {
                history_mgr.append_kind(
                    instance,
                    execution_id,
                    None,
                    EventKind::ExternalEvent {
                        name: name.clone(),
                        data: data.clone(),
                    },
                );
            }
            WorkItem::SuspendInstance { reason, .. } => {
                if !history_mgr.is_suspended() {
                    history_mgr.append_kind(
                        instance,
                        execution_id,
                        None,
                        EventKind::ExecutionSuspended { reason: reason.clone() },
                    );
                }
            }
            WorkItem::ResumeInstance { reason, .. } => {
                if history_mgr.is_suspended() {
                    history_mgr.append_kind(
                        instance,
                        execution_id,
                        None,
                        EventKind::ExecutionResumed { reason: reason.clone() },
                    );
                }
            }
            WorkItem::CancelInstance { reason, .. } => {
                history_mgr.append_kind(
                    instance,
                    execution_id,
                    None,
                    EventKind::OrchestrationTerminated { reason: reason.clone() },
                );
                outcome.terminated = Some(reason.clone());
                break;
            }
            other => {
                warn!(target: "durable_e2e::runtime", instance = %instance, item = ?other, "Unexpected message in orchestrator batch");
                outcome.dropped += 1;
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> Event {
        Event::with_event_id(
            1,
            "inst",
            1,
            None,
            EventKind::OrchestrationStarted {
                name: "Orch".to_string(),
                version: "1.0.0".to_string(),
                input: "in".to_string(),
            },
        )
    }

    fn scheduled(id: u64) -> Event {
        Event::with_event_id(
            id,
            "inst",
            1,
            None,
            EventKind::ActivityScheduled {
                name: "A".to_string(),
                input: String::new(),
            },
        )
    }

    fn completed(execution_id: u64, id: u64) -> WorkItem {
        WorkItem::ActivityCompleted {
            instance: "inst".to_string(),
            execution_id,
            id,
            result: "r".to_string(),
        }
    }

    /// Test: empty history reads as pending with no name
    #[test]
    fn test_history_manager_from_empty_history() {
        let mgr = HistoryManager::from_history(&[]);
        assert!(mgr.is_empty());
        assert_eq!(mgr.next_event_id(), 1);
        assert_eq!(mgr.status(), RuntimeStatus::Pending);
        assert!(mgr.orchestration_name().is_none());
    }

    /// Test: duplicates, stale executions and unmatched completions are dropped
    #[test]
    fn test_fold_drops_duplicates_and_strays() {
        let mut mgr = HistoryManager::from_history(&[started(), scheduled(2)]);
        let outcome = fold_messages(
            &mut mgr,
            &[completed(1, 2), completed(1, 2), completed(0, 2), completed(1, 9)],
            "inst",
            1,
        );
        assert_eq!(outcome.dropped, 3);
        assert_eq!(mgr.delta().len(), 1);
        assert_eq!(mgr.delta()[0].event_id, 3);
        assert_eq!(mgr.delta()[0].source_event_id, Some(2));
        assert!(mgr.outstanding_activities().is_empty());
    }

    /// Test: suspend and resume toggle status and repeated markers are ignored
    #[test]
    fn test_fold_suspend_resume() {
        let mut mgr = HistoryManager::from_history(&[started()]);
        let suspend = WorkItem::SuspendInstance {
            instance: "inst".to_string(),
            reason: "pause".to_string(),
        };
        fold_messages(&mut mgr, &[suspend.clone(), suspend], "inst", 1);
        assert_eq!(mgr.status(), RuntimeStatus::Suspended);
        assert_eq!(mgr.delta().len(), 1);

        fold_messages(
            &mut mgr,
            &[WorkItem::ResumeInstance {
                instance: "inst".to_string(),
                reason: String::new(),
            }],
            "inst",
            1,
        );
        assert_eq!(mgr.status(), RuntimeStatus::Running);
    }

    /// Test: cancel terminates and ignores the rest of the batch
    #[test]
    fn test_fold_cancel_stops_batch() {
        let mut mgr = HistoryManager::from_history(&[started(), scheduled(2)]);
        let outcome = fold_messages(
            &mut mgr,
            &[
                WorkItem::CancelInstance {
                    instance: "inst".to_string(),
                    reason: "stop".to_string(),
                },
                completed(1, 2),
            ],
            "inst",
            1,
        );
        assert_eq!(outcome.terminated.as_deref(), Some("stop"));
        assert_eq!(mgr.status(), RuntimeStatus::Terminated);
        assert_eq!(mgr.outstanding_activities(), vec![2]);
    }

    /// Test: the reader picks up the start message and falls back to history
    #[test]
    fn test_workitem_reader_start_and_fallback() {
        let empty = HistoryManager::from_history(&[]);
        let reader = WorkItemReader::from_messages(
            &[WorkItem::StartOrchestration {
                instance: "inst".to_string(),
                orchestration: "Orch".to_string(),
                input: "x".to_string(),
            }],
            &empty,
            "inst",
        );
        assert!(reader.has_start);
        assert_eq!(reader.orchestration_name, "Orch");

        let running = HistoryManager::from_history(&[started()]);
        let reader = WorkItemReader::from_messages(&[completed(1, 2)], &running, "inst");
        assert!(!reader.has_start);
        assert_eq!(reader.orchestration_name, "Orch");
        assert_eq!(reader.input, "in");
        assert_eq!(reader.completion_messages.len(), 1);
    }
}
