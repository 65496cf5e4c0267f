//! Storage and queueing abstraction for the runtime.
//!
//! A provider owns three peek-lock queues and the durable state behind them:
//!
//! - **Orchestrator queue**: messages for instances, fetched as one batch per
//!   unlocked instance together with the current execution's history.
//! - **Worker queue**: `ActivityExecute` items, one per fetch.
//! - **Entity queue**: operations for entities, serialized per entity key.
//!
//! Event ids are always assigned by the runtime. Providers persist what they
//! are given in `ack_*` calls atomically and never inspect orchestration
//! semantics beyond the [`ExecutionMetadata`] they are handed.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::entity::{EntityError, EntityId, EntityStateUpdate};
use crate::{ErrorDetails, Event};

pub mod error;
pub mod in_memory;
pub mod management;
pub mod sqlite;

pub use error::ProviderError;
pub use management::{InstanceInfo, ProviderAdmin, PurgeFilter, PurgeResult, QueueDepths};

/// Persisted lifecycle state of an instance's current execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
    ContinuedAsNew,
    Suspended,
}

impl RuntimeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeStatus::Pending => "Pending",
            RuntimeStatus::Running => "Running",
            RuntimeStatus::Completed => "Completed",
            RuntimeStatus::Failed => "Failed",
            RuntimeStatus::Terminated => "Terminated",
            RuntimeStatus::ContinuedAsNew => "ContinuedAsNew",
            RuntimeStatus::Suspended => "Suspended",
        }
    }

    /// Completed, Failed and Terminated never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RuntimeStatus::Completed | RuntimeStatus::Failed | RuntimeStatus::Terminated
        )
    }
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RuntimeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(RuntimeStatus::Pending),
            "Running" => Ok(RuntimeStatus::Running),
            "Completed" => Ok(RuntimeStatus::Completed),
            "Failed" => Ok(RuntimeStatus::Failed),
            "Terminated" => Ok(RuntimeStatus::Terminated),
            "ContinuedAsNew" => Ok(RuntimeStatus::ContinuedAsNew),
            "Suspended" => Ok(RuntimeStatus::Suspended),
            other => Err(format!("unknown runtime status: {other}")),
        }
    }
}

/// Where an entity reply goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCaller {
    pub instance: String,
    pub execution_id: u64,
    /// Scheduling event id of the `EntityCallScheduled` event.
    pub id: u64,
}

/// Queue message. Routed to the orchestrator, worker or entity queue by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
    },
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        orchestration: String,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        details: ErrorDetails,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
    CancelInstance {
        instance: String,
        reason: String,
    },
    SuspendInstance {
        instance: String,
        reason: String,
    },
    ResumeInstance {
        instance: String,
        reason: String,
    },
    ContinueAsNew {
        instance: String,
        orchestration: String,
        input: String,
    },
    EntityOperation {
        entity: EntityId,
        operation: String,
        input: String,
        caller: Option<EntityCaller>,
    },
    EntityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    EntityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        error: EntityError,
    },
}

impl WorkItem {
    /// Target instance for orchestrator-queue messages.
    pub fn orchestrator_instance(&self) -> Option<&str> {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::CancelInstance { instance, .. }
            | WorkItem::SuspendInstance { instance, .. }
            | WorkItem::ResumeInstance { instance, .. }
            | WorkItem::ContinueAsNew { instance, .. }
            | WorkItem::EntityCompleted { instance, .. }
            | WorkItem::EntityFailed { instance, .. } => Some(instance),
            WorkItem::ActivityExecute { .. } | WorkItem::EntityOperation { .. } => None,
        }
    }

    /// Delayed visibility for orchestrator messages; timers become visible when due.
    pub(crate) fn visible_at_ms(&self, now_ms: u64) -> u64 {
        match self {
            WorkItem::TimerFired { fire_at_ms, .. } => (*fire_at_ms).max(now_ms).min(i64::MAX as u64),
            _ => now_ms,
        }
    }
}

/// One instance's batch of messages plus its current execution history.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    pub orchestration_name: String,
    pub execution_id: u64,
    pub version: String,
    pub input: String,
    pub messages: Vec<WorkItem>,
    pub history: Vec<Event>,
}

/// One entity operation with the entity's committed state.
#[derive(Debug, Clone)]
pub struct EntityItem {
    pub entity: EntityId,
    pub operation: String,
    pub input: String,
    pub caller: Option<EntityCaller>,
    pub state: Option<String>,
}

/// What the runtime computed about an execution after a turn.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetadata {
    pub status: Option<RuntimeStatus>,
    pub output: Option<String>,
    pub orchestration_name: Option<String>,
    pub orchestration_version: Option<String>,
}

/// Identifies an activity still sitting in the worker queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledActivityIdentifier {
    pub instance: String,
    pub execution_id: u64,
    pub activity_id: u64,
}

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Lock the oldest instance with visible messages and return its batch.
    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(OrchestrationItem, String)>, ProviderError>;

    /// Commit a turn atomically and release the instance lock.
    ///
    /// Appends `history_delta` to `execution_id`, removes the fetched messages,
    /// enqueues the produced items, updates status from `metadata` and drops
    /// `cancelled_activities` from the worker queue.
    #[allow(clippy::too_many_arguments)]
    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        entity_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
        cancelled_activities: Vec<ScheduledActivityIdentifier>,
    ) -> Result<(), ProviderError>;

    /// Release the instance lock; the batch becomes visible again after `delay`.
    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError>;

    async fn renew_orchestration_item_lock(&self, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError>;

    async fn fetch_work_item(&self, lock_timeout: Duration) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Remove the item and enqueue `completion` for the orchestrator in one step.
    ///
    /// Fails with a permanent error when the item was cancelled meanwhile.
    async fn ack_work_item(&self, token: &str, completion: Option<WorkItem>) -> Result<(), ProviderError>;

    async fn renew_work_item_lock(&self, token: &str, extend_for: Duration) -> Result<(), ProviderError>;

    async fn abandon_work_item(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError>;

    /// Oldest operation for an entity nobody holds, with that entity locked.
    async fn fetch_entity_item(&self, lock_timeout: Duration) -> Result<Option<(EntityItem, String)>, ProviderError>;

    /// Apply `state`, remove the operation, enqueue `completion` and unlock the entity.
    async fn ack_entity_item(
        &self,
        token: &str,
        state: EntityStateUpdate,
        completion: Option<WorkItem>,
    ) -> Result<(), ProviderError>;

    async fn abandon_entity_item(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError>;

    async fn enqueue_for_orchestrator(&self, item: WorkItem, delay: Option<Duration>) -> Result<(), ProviderError>;

    async fn enqueue_for_entity(&self, item: WorkItem) -> Result<(), ProviderError>;

    /// History of the instance's current execution; empty when unknown.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError>;

    /// Register a `Pending` instance.
    ///
    /// Fails when a non-terminal instance with this id exists; a terminal one
    /// is replaced along with its history.
    async fn create_instance(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ProviderError>;

    fn as_management_capability(&self) -> Option<&dyn ProviderAdmin> {
        None
    }
}

pub(crate) fn now_millis() -> u64 {
    crate::now_millis()
}

pub(crate) fn generate_lock_token() -> String {
    format!("lock_{}", uuid::Uuid::new_v4())
}

pub(crate) fn duration_millis(d: Duration) -> u64 {
    d.as_millis().min(i64::MAX as u128) as u64
}

pub(crate) fn after(now_ms: u64, d: Duration) -> u64 {
    now_ms.saturating_add(duration_millis(d)).min(i64::MAX as u64)
}
