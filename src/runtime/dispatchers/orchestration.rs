//! Orchestration dispatcher implementation for Runtime
//!
//! - Spawns concurrent orchestration workers
//! - Folds each fetched batch into history and replays one turn
//! - Commits history, produced work and status in a single ack
//! - Renews the instance lock while a turn is in flight

use crate::providers::{
    EntityCaller, ExecutionMetadata, OrchestrationItem, ProviderError, RuntimeStatus, ScheduledActivityIdentifier,
    WorkItem,
};
use crate::runtime::orchestration_turn::{OrchestrationTurn, TurnOutcome};
use crate::{Action, ConfigErrorKind, ErrorDetails, Event, EventKind};
use semver::Version;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

use super::super::{HistoryManager, Runtime, WorkItemReader, fold_messages};
use super::{LockedQueue, spawn_lock_renewal_task};

/// Work produced by one batch, committed together with the history delta.
#[derive(Debug, Default)]
struct TurnChanges {
    worker_items: Vec<WorkItem>,
    entity_items: Vec<WorkItem>,
    orchestrator_items: Vec<WorkItem>,
    cancelled_activities: Vec<ScheduledActivityIdentifier>,
}

impl TurnChanges {
    fn cancel_activities(&mut self, instance: &str, execution_id: u64, ids: impl IntoIterator<Item = u64>) {
        self.cancelled_activities.extend(ids.into_iter().map(|activity_id| ScheduledActivityIdentifier {
            instance: instance.to_string(),
            execution_id,
            activity_id,
        }));
    }
}

impl Runtime {
    /// Start the orchestration dispatcher with N concurrent workers
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        // Instance-level locking in the provider keeps one turn per instance in flight
        let concurrency = self.options.orchestration_concurrency;
        let shutdown = self.shutdown_flag.clone();

        tokio::spawn(async move {
            let mut worker_handles = Vec::new();

            for worker_idx in 0..concurrency {
                let rt = Arc::clone(&self);
                let shutdown = Arc::clone(&shutdown);
                let worker_id = format!("orch-{worker_idx}-{}", rt.runtime_id);
                let handle = tokio::spawn(async move {
                    loop {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }

                        match rt
                            .history_store
                            .fetch_orchestration_item(rt.options.orchestrator_lock_timeout)
                            .await
                        {
                            Ok(Some((item, lock_token))) => {
                                let renewal_handle = spawn_lock_renewal_task(
                                    Arc::clone(&rt.history_store),
                                    LockedQueue::Orchestrator,
                                    lock_token.clone(),
                                    rt.options.orchestrator_lock_timeout,
                                    rt.options.orchestrator_lock_renewal_buffer,
                                    Arc::clone(&shutdown),
                                );

                                rt.process_orchestration_item(item, &lock_token, &worker_id).await;

                                renewal_handle.abort();
                            }
                            Ok(None) => tokio::time::sleep(rt.idle_sleep()).await,
                            Err(e) => {
                                warn!(
                                    target: "durable_e2e::runtime",
                                    worker_id = %worker_id,
                                    error = %e,
                                    "Error fetching orchestration item"
                                );
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                });
                worker_handles.push(handle);
            }

            for handle in worker_handles {
                let _ = handle.await;
            }
        })
    }

    /// Process a single orchestration batch and commit it atomically.
    pub(in crate::runtime) async fn process_orchestration_item(
        self: &Arc<Self>,
        item: OrchestrationItem,
        lock_token: &str,
        worker_id: &str,
    ) {
        let instance = item.instance.as_str();
        let temp_history_mgr = HistoryManager::from_history(&item.history);
        let workitem_reader = WorkItemReader::from_messages(&item.messages, &temp_history_mgr, instance);

        // Terminal executions take no more messages, unless a continue-as-new start is waiting
        if temp_history_mgr.is_terminal() && !(temp_history_mgr.is_continued_as_new() && workitem_reader.is_continue_as_new)
        {
            warn!(
                target: "durable_e2e::runtime",
                instance_id = %instance,
                status = %temp_history_mgr.status(),
                dropped = item.messages.len(),
                "Instance is terminal, acking batch without processing"
            );
            self.ack_empty(lock_token, item.execution_id).await;
            return;
        }

        let (execution_id, mut history_mgr) = if workitem_reader.is_continue_as_new {
            (item.execution_id + 1, HistoryManager::from_history(&[]))
        } else {
            (item.execution_id, temp_history_mgr)
        };

        if history_mgr.is_empty() && !workitem_reader.has_start {
            warn!(
                target: "durable_e2e::runtime",
                instance_id = %instance,
                dropped = item.messages.len(),
                "Messages for an instance that was never started, dropping"
            );
            self.ack_empty(lock_token, item.execution_id).await;
            return;
        }

        tracing::debug!(
            target: "durable_e2e::runtime",
            instance_id = %instance,
            execution_id = %execution_id,
            orchestration_name = %workitem_reader.orchestration_name,
            worker_id = %worker_id,
            messages = item.messages.len(),
            is_continue_as_new = workitem_reader.is_continue_as_new,
            "Processing orchestration batch"
        );

        let mut changes = TurnChanges::default();
        let version = self.handle_orchestration_atomic(
            instance,
            &mut history_mgr,
            &workitem_reader,
            execution_id,
            worker_id,
            &mut changes,
        );

        let metadata = Runtime::compute_execution_metadata(
            history_mgr.delta(),
            &workitem_reader.orchestration_name,
            Some(version.as_str()),
        );
        self.record_orchestration_outcome(
            instance,
            execution_id,
            &workitem_reader.orchestration_name,
            worker_id,
            &history_mgr,
            &metadata,
        );

        let history_delta = history_mgr.into_delta();
        match self
            .ack_orchestration_with_changes(lock_token, execution_id, history_delta, changes, metadata)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                // Already abandoned; the batch is redelivered
            }
            Err(e) => {
                warn!(
                    target: "durable_e2e::runtime",
                    instance_id = %instance,
                    error = %e,
                    "Failed to ack orchestration item, failing orchestration"
                );
                self.commit_infrastructure_failure(&item, lock_token, execution_id, e).await;
            }
        }
    }

    /// Fold messages and run the turn. Returns the execution's version.
    fn handle_orchestration_atomic(
        &self,
        instance: &str,
        history_mgr: &mut HistoryManager,
        workitem_reader: &WorkItemReader,
        execution_id: u64,
        worker_id: &str,
        changes: &mut TurnChanges,
    ) -> String {
        let name = workitem_reader.orchestration_name.as_str();

        if history_mgr.is_empty() {
            let Some(version) = self.orchestration_registry.resolve_version(name) else {
                history_mgr.append(Event::with_event_id(
                    crate::INITIAL_EVENT_ID,
                    instance,
                    execution_id,
                    None,
                    EventKind::OrchestrationStarted {
                        name: name.to_string(),
                        version: "0.0.0".to_string(),
                        input: workitem_reader.input.clone(),
                    },
                ));
                history_mgr.append_failed(instance, execution_id, unregistered_orchestration(name));
                return "0.0.0".to_string();
            };
            history_mgr.append(Event::with_event_id(
                crate::INITIAL_EVENT_ID,
                instance,
                execution_id,
                None,
                EventKind::OrchestrationStarted {
                    name: name.to_string(),
                    version: version.to_string(),
                    input: workitem_reader.input.clone(),
                },
            ));
        }
        let version = history_mgr.version().unwrap_or_default();

        let fold = fold_messages(history_mgr, &workitem_reader.completion_messages, instance, execution_id);
        if let Some(reason) = fold.terminated {
            tracing::info!(
                target: "durable_e2e::runtime",
                instance_id = %instance,
                execution_id = %execution_id,
                reason = %reason,
                "Orchestration terminated"
            );
            changes.cancel_activities(instance, execution_id, history_mgr.outstanding_activities());
            return version;
        }

        if history_mgr.is_suspended() {
            tracing::debug!(
                target: "durable_e2e::runtime",
                instance_id = %instance,
                execution_id = %execution_id,
                "Instance suspended, persisting folded messages without a turn"
            );
            return version;
        }

        let handler = Version::parse(&version)
            .ok()
            .and_then(|v| self.orchestration_registry.resolve_handler_exact(name, &v));
        let Some(handler) = handler else {
            history_mgr.append_failed(instance, execution_id, unregistered_orchestration(name));
            return version;
        };

        let input = history_mgr.input().unwrap_or_default();
        let mut turn = OrchestrationTurn::new(
            instance,
            name,
            history_mgr.full_history(),
            history_mgr.persisted_watermark(),
        );
        let outcome = turn.execute(handler, input);
        history_mgr.extend(turn.history_delta().iter().cloned());

        tracing::debug!(
            target: "durable_e2e::runtime",
            instance_id = %instance,
            execution_id = %execution_id,
            worker_id = %worker_id,
            turn_index = turn.turn_index(),
            new_events = turn.history_delta().len(),
            actions = turn.pending_actions().len(),
            outcome = ?outcome,
            "Orchestration turn finished"
        );

        match outcome {
            TurnOutcome::Continue => {
                let cancelled = turn.cancelled_sources();
                for action in turn.pending_actions() {
                    dispatch_action(instance, execution_id, name, action, cancelled, changes);
                }
                // Losers scheduled in earlier turns may still sit in the worker queue
                let outstanding = history_mgr.outstanding_activities();
                changes.cancel_activities(
                    instance,
                    execution_id,
                    cancelled
                        .iter()
                        .copied()
                        .filter(|id| outstanding.contains(id) && id <= &history_mgr.persisted_watermark()),
                );
            }
            TurnOutcome::Completed(output) => {
                history_mgr.append_kind(instance, execution_id, None, EventKind::OrchestrationCompleted { output });
                changes.cancel_activities(instance, execution_id, outstanding_before(history_mgr));
            }
            TurnOutcome::Failed(details) => {
                history_mgr.append_failed(instance, execution_id, details);
                changes.cancel_activities(instance, execution_id, outstanding_before(history_mgr));
            }
            TurnOutcome::ContinueAsNew { input } => {
                history_mgr.append_kind(
                    instance,
                    execution_id,
                    None,
                    EventKind::OrchestrationContinuedAsNew { input: input.clone() },
                );
                changes.cancel_activities(instance, execution_id, outstanding_before(history_mgr));
                changes.orchestrator_items.push(WorkItem::ContinueAsNew {
                    instance: instance.to_string(),
                    orchestration: name.to_string(),
                    input,
                });
            }
        }

        version
    }

    fn record_orchestration_outcome(
        &self,
        instance: &str,
        execution_id: u64,
        orchestration_name: &str,
        worker_id: &str,
        history_mgr: &HistoryManager,
        metadata: &ExecutionMetadata,
    ) {
        let Some(status) = metadata.status else {
            return;
        };
        let error = metadata.output.as_deref().unwrap_or_default();
        match status {
            RuntimeStatus::Completed => {
                tracing::info!(
                    target: "durable_e2e::runtime",
                    instance_id = %instance,
                    execution_id = %execution_id,
                    orchestration_name = %orchestration_name,
                    worker_id = %worker_id,
                    "Orchestration completed"
                );
                self.metrics.record_orchestration_completion();
            }
            RuntimeStatus::Failed => {
                let category = history_mgr
                    .delta()
                    .iter()
                    .find_map(|e| match &e.kind {
                        EventKind::OrchestrationFailed { details } => Some(details.category()),
                        _ => None,
                    })
                    .unwrap_or("unknown");
                // Application errors are expected business outcomes
                if category == "application" {
                    tracing::warn!(
                        target: "durable_e2e::runtime",
                        instance_id = %instance,
                        execution_id = %execution_id,
                        orchestration_name = %orchestration_name,
                        worker_id = %worker_id,
                        error_type = %category,
                        error = %error,
                        "Orchestration failed (application error)"
                    );
                } else {
                    tracing::error!(
                        target: "durable_e2e::runtime",
                        instance_id = %instance,
                        execution_id = %execution_id,
                        orchestration_name = %orchestration_name,
                        worker_id = %worker_id,
                        error_type = %category,
                        error = %error,
                        "Orchestration failed"
                    );
                }
                self.metrics.record_orchestration_failure(category);
            }
            RuntimeStatus::Terminated => self.metrics.record_orchestration_termination(),
            RuntimeStatus::ContinuedAsNew => {
                tracing::debug!(
                    target: "durable_e2e::runtime",
                    instance_id = %instance,
                    execution_id = %execution_id,
                    orchestration_name = %orchestration_name,
                    "Orchestration continued as new"
                );
                self.metrics.record_continue_as_new();
            }
            RuntimeStatus::Pending | RuntimeStatus::Running | RuntimeStatus::Suspended => {}
        }
    }

    async fn ack_empty(&self, lock_token: &str, execution_id: u64) {
        let _ = self
            .ack_orchestration_with_changes(
                lock_token,
                execution_id,
                Vec::new(),
                TurnChanges::default(),
                ExecutionMetadata::default(),
            )
            .await;
    }

    /// Ack with retry on retryable errors: 10ms * 2^n backoff, 5 retries, then abandon.
    async fn ack_orchestration_with_changes(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        changes: TurnChanges,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError> {
        let mut attempts: u32 = 0;
        let max_attempts: u32 = 5;

        loop {
            match self
                .history_store
                .ack_orchestration_item(
                    lock_token,
                    execution_id,
                    history_delta.clone(),
                    changes.worker_items.clone(),
                    changes.entity_items.clone(),
                    changes.orchestrator_items.clone(),
                    metadata.clone(),
                    changes.cancelled_activities.clone(),
                )
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => {
                    warn!(target: "durable_e2e::runtime", error = %e, "ack_orchestration_item failed with non-retryable error");
                    return Err(e);
                }
                Err(e) if attempts < max_attempts => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempts);
                    warn!(target: "durable_e2e::runtime", attempts, backoff_ms, error = %e, "ack_orchestration_item failed; retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                Err(e) => {
                    warn!(target: "durable_e2e::runtime", attempts, error = %e, "Failed to ack_orchestration_item after max retries");
                    if let Err(abandon_err) = self
                        .history_store
                        .abandon_orchestration_item(lock_token, Some(Duration::from_millis(50)))
                        .await
                    {
                        warn!(target: "durable_e2e::runtime", error = %abandon_err, "Failed to abandon orchestration item");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Record a provider failure as the execution's outcome, or abandon when even that fails.
    async fn commit_infrastructure_failure(
        &self,
        item: &OrchestrationItem,
        lock_token: &str,
        execution_id: u64,
        error: ProviderError,
    ) {
        let details = error.to_infrastructure_error();
        let mut failure_mgr = if execution_id == item.execution_id {
            HistoryManager::from_history(&item.history)
        } else {
            HistoryManager::from_history(&[])
        };
        if failure_mgr.is_empty() {
            // Nothing persisted for this execution yet; the ack that failed carried the start
            self.metrics.record_orchestration_failure(details.category());
            if let Err(e) = self
                .history_store
                .abandon_orchestration_item(lock_token, Some(Duration::from_millis(50)))
                .await
            {
                warn!(target: "durable_e2e::runtime", instance_id = %item.instance, error = %e, "Failed to abandon orchestration item");
            }
            return;
        }
        failure_mgr.append_failed(&item.instance, execution_id, details.clone());
        let metadata = Runtime::compute_execution_metadata(failure_mgr.delta(), &item.orchestration_name, None);
        self.metrics.record_orchestration_failure(details.category());

        match self
            .ack_orchestration_with_changes(
                lock_token,
                execution_id,
                failure_mgr.into_delta(),
                TurnChanges::default(),
                metadata,
            )
            .await
        {
            Ok(()) => warn!(target: "durable_e2e::runtime", instance_id = %item.instance, "Committed orchestration failure event"),
            Err(e2) => {
                warn!(target: "durable_e2e::runtime", instance_id = %item.instance, error = %e2, "Failed to commit failure event, abandoning lock");
                if !e2.is_retryable() {
                    let _ = self
                        .history_store
                        .abandon_orchestration_item(lock_token, Some(Duration::from_millis(50)))
                        .await;
                }
            }
        }
    }
}

fn dispatch_action(
    instance: &str,
    execution_id: u64,
    orchestration_name: &str,
    action: &Action,
    cancelled: &[u64],
    changes: &mut TurnChanges,
) {
    match action {
        Action::CallActivity {
            scheduling_event_id,
            name,
            input,
        } => {
            // Scheduled and already lost a select within this turn
            if cancelled.contains(scheduling_event_id) {
                return;
            }
            changes.worker_items.push(WorkItem::ActivityExecute {
                instance: instance.to_string(),
                execution_id,
                id: *scheduling_event_id,
                orchestration: orchestration_name.to_string(),
                name: name.clone(),
                input: input.clone(),
            });
        }
        Action::CreateTimer {
            scheduling_event_id,
            fire_at_ms,
        } => changes.orchestrator_items.push(WorkItem::TimerFired {
            instance: instance.to_string(),
            execution_id,
            id: *scheduling_event_id,
            fire_at_ms: *fire_at_ms,
        }),
        Action::CallEntity {
            scheduling_event_id,
            entity,
            operation,
            input,
        } => changes.entity_items.push(WorkItem::EntityOperation {
            entity: entity.clone(),
            operation: operation.clone(),
            input: input.clone(),
            caller: Some(EntityCaller {
                instance: instance.to_string(),
                execution_id,
                id: *scheduling_event_id,
            }),
        }),
        Action::WaitExternal { .. } | Action::ContinueAsNew { .. } => {}
    }
}

fn unregistered_orchestration(name: &str) -> ErrorDetails {
    ErrorDetails::Configuration {
        kind: ConfigErrorKind::UnregisteredOrchestration,
        resource: name.to_string(),
        message: None,
    }
}

/// Activities still waiting on the worker queue from earlier turns.
fn outstanding_before(history_mgr: &HistoryManager) -> Vec<u64> {
    let watermark = history_mgr.persisted_watermark();
    history_mgr
        .outstanding_activities()
        .into_iter()
        .filter(|id| *id <= watermark)
        .collect()
}
