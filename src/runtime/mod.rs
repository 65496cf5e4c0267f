//! Replay-based orchestration runtime.
//!
//! `Runtime` owns three dispatchers over a [`Provider`]:
//! orchestration turns, activity execution and entity operations. Each
//! dispatcher runs a configurable number of tokio tasks that poll the
//! provider's peek-lock queues until shutdown.
use crate::entity::{EntityContext, EntityError};
use crate::providers::{ExecutionMetadata, Provider, RuntimeStatus};
use crate::{Event, EventKind, OrchestrationContext};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

mod dispatchers;
pub mod observability;
pub mod orchestration_turn;
pub mod registry;
mod state_helpers;
pub mod status;

pub use observability::{LogFormat, MetricsProvider, MetricsSnapshot, ObservabilityConfig, init_logging};
pub use registry::{
    ActivityRegistry, ActivityRegistryBuilder, EntityRegistry, EntityRegistryBuilder, OrchestrationRegistry,
    OrchestrationRegistryBuilder, Registry, RegistryBuilder, VersionPolicy,
};
pub use state_helpers::{FoldOutcome, HistoryManager, WorkItemReader, fold_messages};
pub use status::OrchestrationStatus;

/// Configuration options for the Runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Sleep between polls when a dispatcher finds its queue empty.
    pub dispatcher_idle_sleep_ms: u64,
    pub orchestration_concurrency: usize,
    pub worker_concurrency: usize,
    pub entity_concurrency: usize,
    /// Lock held on an instance while a turn runs; renewed until the ack.
    pub orchestrator_lock_timeout: Duration,
    pub orchestrator_lock_renewal_buffer: Duration,
    /// Lock held on an activity while it executes; renewed until the ack.
    pub worker_lock_timeout: Duration,
    pub worker_lock_renewal_buffer: Duration,
    pub entity_lock_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep_ms: 10,
            orchestration_concurrency: 2,
            worker_concurrency: 4,
            entity_concurrency: 2,
            orchestrator_lock_timeout: Duration::from_secs(5),
            orchestrator_lock_renewal_buffer: Duration::from_secs(2),
            worker_lock_timeout: Duration::from_secs(30),
            worker_lock_renewal_buffer: Duration::from_secs(5),
            entity_lock_timeout: Duration::from_secs(30),
        }
    }
}

/// Text carried by a caught panic, when it is a string.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> Option<String> {
    if let Some(s) = payload.downcast_ref::<&str>() {
        Some((*s).to_string())
    } else {
        payload.downcast_ref::<String>().cloned()
    }
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: crate::ActivityContext, input: String) -> Result<String, String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(crate::ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(crate::ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: crate::ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Handles every operation of one entity type.
///
/// State changes made through the context are committed only when `invoke`
/// returns `Ok`.
#[async_trait]
pub trait EntityHandler: Send + Sync {
    async fn invoke(&self, ctx: EntityContext) -> Result<String, EntityError>;
}

pub struct FnEntity<F, Fut>(pub F)
where
    F: Fn(EntityContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, EntityError>> + Send + 'static;

#[async_trait]
impl<F, Fut> EntityHandler for FnEntity<F, Fut>
where
    F: Fn(EntityContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, EntityError>> + Send + 'static,
{
    async fn invoke(&self, ctx: EntityContext) -> Result<String, EntityError> {
        (self.0)(ctx).await
    }
}

pub struct Runtime {
    runtime_id: String,
    joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn Provider>,
    orchestration_registry: OrchestrationRegistry,
    activity_registry: Arc<ActivityRegistry>,
    entity_registry: EntityRegistry,
    options: RuntimeOptions,
    shutdown_flag: Arc<AtomicBool>,
    metrics: Arc<MetricsProvider>,
}

impl Runtime {
    /// Derive status and output for the provider from a turn's history delta.
    fn compute_execution_metadata(history_delta: &[Event], orchestration_name: &str, version: Option<&str>) -> ExecutionMetadata {
        let mut metadata = ExecutionMetadata {
            orchestration_name: (!orchestration_name.is_empty()).then(|| orchestration_name.to_string()),
            orchestration_version: version.map(str::to_string),
            ..Default::default()
        };

        for event in history_delta {
            match &event.kind {
                EventKind::OrchestrationStarted { .. } => {
                    metadata.status.get_or_insert(RuntimeStatus::Running);
                }
                EventKind::ExecutionSuspended { .. } => metadata.status = Some(RuntimeStatus::Suspended),
                EventKind::ExecutionResumed { .. } => metadata.status = Some(RuntimeStatus::Running),
                EventKind::OrchestrationCompleted { output } => {
                    metadata.status = Some(RuntimeStatus::Completed);
                    metadata.output = Some(output.clone());
                    break;
                }
                EventKind::OrchestrationFailed { details } => {
                    metadata.status = Some(RuntimeStatus::Failed);
                    metadata.output = Some(details.display_message());
                    break;
                }
                EventKind::OrchestrationTerminated { reason } => {
                    metadata.status = Some(RuntimeStatus::Terminated);
                    metadata.output = Some(reason.clone());
                    break;
                }
                EventKind::OrchestrationContinuedAsNew { input } => {
                    metadata.status = Some(RuntimeStatus::ContinuedAsNew);
                    metadata.output = Some(input.clone());
                    break;
                }
                _ => {}
            }
        }

        metadata
    }

    pub async fn start_with_store(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            EntityRegistry::default(),
            RuntimeOptions::default(),
        )
        .await
    }

    pub async fn start_with_options(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        entity_registry: EntityRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // No-op when the host already installed a subscriber
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn,durable_e2e=info".into()),
            )
            .try_init();

        let runtime = Arc::new(Self {
            runtime_id: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            joins: Mutex::new(Vec::new()),
            history_store,
            orchestration_registry,
            activity_registry,
            entity_registry,
            options,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(MetricsProvider::new()),
        });

        debug!(
            target: "durable_e2e::runtime",
            runtime_id = %runtime.runtime_id,
            provider = %runtime.history_store.name(),
            orchestrations = ?runtime.orchestration_registry.list_names(),
            activities = ?runtime.activity_registry.list_names(),
            entities = ?runtime.entity_registry.list_names(),
            "Starting runtime"
        );

        let orch_handle = runtime.clone().start_orchestration_dispatcher();
        let work_handle = runtime.clone().start_work_dispatcher();
        let entity_handle = runtime.clone().start_entity_dispatcher();
        runtime.joins.lock().await.extend([orch_handle, work_handle, entity_handle]);

        runtime
    }

    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    pub fn provider(&self) -> Arc<dyn Provider> {
        Arc::clone(&self.history_store)
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop the dispatchers.
    ///
    /// Workers finish the item they hold; after `timeout_ms` (default 1000)
    /// whatever is still running is aborted. Unacked items are redelivered
    /// once their locks expire.
    pub async fn shutdown(self: Arc<Self>, timeout_ms: Option<u64>) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        let timeout = Duration::from_millis(timeout_ms.unwrap_or(1000));

        let mut joins = self.joins.lock().await;
        let handles: Vec<JoinHandle<()>> = joins.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(handles)).await.is_err() {
            warn!(
                target: "durable_e2e::runtime",
                runtime_id = %self.runtime_id,
                timeout_ms = timeout.as_millis() as u64,
                "Dispatchers did not stop in time, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }
        debug!(target: "durable_e2e::runtime", runtime_id = %self.runtime_id, "Runtime stopped");
    }

    fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.options.dispatcher_idle_sleep_ms)
    }
}
