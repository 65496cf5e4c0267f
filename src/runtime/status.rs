use serde::Serialize;

use crate::providers::RuntimeStatus;
use crate::{ErrorDetails, Event, EventKind};

/// High-level orchestration status derived from history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status")]
pub enum OrchestrationStatus {
    NotFound,
    /// Created but not yet picked up by a dispatcher.
    Pending,
    Running,
    Suspended,
    Completed { output: String },
    Failed { details: ErrorDetails },
    Terminated { reason: String },
    /// The execution handed over to a newer one that has not started yet.
    ContinuedAsNew,
}

impl OrchestrationStatus {
    /// Status implied by one execution's history. Empty history reads as `NotFound`.
    pub fn from_history(history: &[Event]) -> Self {
        if history.is_empty() {
            return OrchestrationStatus::NotFound;
        }
        if let Some(terminal) = history.iter().rev().find(|e| e.is_terminal()) {
            return match &terminal.kind {
                EventKind::OrchestrationCompleted { output } => OrchestrationStatus::Completed { output: output.clone() },
                EventKind::OrchestrationFailed { details } => OrchestrationStatus::Failed {
                    details: details.clone(),
                },
                EventKind::OrchestrationTerminated { reason } => OrchestrationStatus::Terminated {
                    reason: reason.clone(),
                },
                _ => OrchestrationStatus::ContinuedAsNew,
            };
        }
        let suspended = history
            .iter()
            .filter_map(|e| match e.kind {
                EventKind::ExecutionSuspended { .. } => Some(true),
                EventKind::ExecutionResumed { .. } => Some(false),
                _ => None,
            })
            .last()
            .unwrap_or(false);
        if suspended {
            OrchestrationStatus::Suspended
        } else {
            OrchestrationStatus::Running
        }
    }

    pub fn runtime_status(&self) -> Option<RuntimeStatus> {
        match self {
            OrchestrationStatus::NotFound => None,
            OrchestrationStatus::Pending => Some(RuntimeStatus::Pending),
            OrchestrationStatus::Running => Some(RuntimeStatus::Running),
            OrchestrationStatus::Suspended => Some(RuntimeStatus::Suspended),
            OrchestrationStatus::Completed { .. } => Some(RuntimeStatus::Completed),
            OrchestrationStatus::Failed { .. } => Some(RuntimeStatus::Failed),
            OrchestrationStatus::Terminated { .. } => Some(RuntimeStatus::Terminated),
            OrchestrationStatus::ContinuedAsNew => Some(RuntimeStatus::ContinuedAsNew),
        }
    }

    /// Completed, Failed or Terminated.
    pub fn is_terminal(&self) -> bool {
        self.runtime_status().is_some_and(|s| s.is_terminal())
    }

    /// Name used in error messages, e.g. "Completed".
    pub fn state_name(&self) -> &'static str {
        match self.runtime_status() {
            Some(s) => s.as_str(),
            None => "NotFound",
        }
    }

    /// Output when completed, failure text when failed, reason when terminated.
    pub fn output(&self) -> Option<String> {
        match self {
            OrchestrationStatus::Completed { output } => Some(output.clone()),
            OrchestrationStatus::Failed { details } => Some(details.display_message()),
            OrchestrationStatus::Terminated { reason } => Some(reason.clone()),
            _ => None,
        }
    }
}
