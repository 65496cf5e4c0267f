use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::_typed_codec::{Codec, Json};
use crate::entity::EntityId;
use crate::providers::{InstanceInfo, Provider, ProviderAdmin, ProviderError, PurgeFilter, PurgeResult, RuntimeStatus, WorkItem};
use crate::runtime::OrchestrationStatus;

/// Control-plane failure surfaced to callers and HTTP routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    Provider(ProviderError),
    InstanceNotFound(String),
    InvalidState(String),
    AlreadyExists(String),
    InvalidInput(String),
    Timeout,
}

impl ClientError {
    /// Short status name, e.g. `NotFound`.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::Provider(e) if e.is_retryable() => "Unavailable",
            ClientError::Provider(_) => "Internal",
            ClientError::InstanceNotFound(_) => "NotFound",
            ClientError::InvalidState(_) => "FailedPrecondition",
            ClientError::AlreadyExists(_) => "AlreadyExists",
            ClientError::InvalidInput(_) => "InvalidArgument",
            ClientError::Timeout => "DeadlineExceeded",
        }
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Provider(e) => write!(f, "{e}"),
            ClientError::InstanceNotFound(msg)
            | ClientError::InvalidState(msg)
            | ClientError::AlreadyExists(msg)
            | ClientError::InvalidInput(msg) => f.write_str(msg),
            ClientError::Timeout => f.write_str("Timed out waiting for the orchestration to finish."),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProviderError> for ClientError {
    fn from(e: ProviderError) -> Self {
        ClientError::Provider(e)
    }
}

/// Client for control-plane operations.
///
/// Talks to the runtime only through the shared provider: starts, events and
/// lifecycle requests are enqueued as orchestrator messages and picked up by
/// the dispatchers asynchronously.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Provider>,
}

impl Client {
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self { store }
    }

    pub fn provider(&self) -> Arc<dyn Provider> {
        self.store.clone()
    }

    fn admin(&self, operation: &str) -> Result<&dyn ProviderAdmin, ClientError> {
        self.store.as_management_capability().ok_or_else(|| {
            ClientError::Provider(ProviderError::permanent(
                operation,
                format!("provider '{}' does not support management operations", self.store.name()),
            ))
        })
    }

    /// Start an orchestration instance with string input.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        let input = input.into();
        let status = self.get_orchestration_status(instance).await?;
        if !matches!(status, OrchestrationStatus::NotFound) && !status.is_terminal() {
            return Err(already_exists(instance));
        }

        self.store
            .create_instance(instance, orchestration, &input)
            .await
            .map_err(|e| {
                if e.message.starts_with("instance already exists") {
                    already_exists(instance)
                } else {
                    ClientError::Provider(e)
                }
            })?;
        self.store
            .enqueue_for_orchestrator(
                WorkItem::StartOrchestration {
                    instance: instance.to_string(),
                    orchestration: orchestration.to_string(),
                    input,
                },
                None,
            )
            .await?;
        info!(
            target: "durable_e2e::client",
            instance_id = %instance,
            orchestration_name = %orchestration,
            "Started orchestration"
        );
        Ok(())
    }

    /// Start an orchestration with typed input (serialized to JSON).
    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: In,
    ) -> Result<(), ClientError> {
        let payload = Json::encode(&input).map_err(|e| ClientError::InvalidInput(format!("encode: {e}")))?;
        self.start_orchestration(instance, orchestration, payload).await
    }

    /// Status of the current execution. Created instances with no history read as `Pending`.
    pub async fn get_orchestration_status(&self, instance: &str) -> Result<OrchestrationStatus, ClientError> {
        let history = self.store.read(instance).await?;
        let status = OrchestrationStatus::from_history(&history);
        if !matches!(status, OrchestrationStatus::NotFound) {
            return Ok(status);
        }
        match self.store.as_management_capability() {
            Some(admin) => Ok(match admin.get_instance_info(instance).await? {
                Some(_) => OrchestrationStatus::Pending,
                None => OrchestrationStatus::NotFound,
            }),
            None => Ok(status),
        }
    }

    pub async fn describe_instance(&self, instance: &str) -> Result<Option<InstanceInfo>, ClientError> {
        Ok(self.admin("get_instance_info")?.get_instance_info(instance).await?)
    }

    /// Every instance, newest first.
    pub async fn list_all_instances(&self) -> Result<Vec<InstanceInfo>, ClientError> {
        let admin = self.admin("list_instances")?;
        let ids = admin.list_instances().await?;
        collect_infos(admin, ids).await
    }

    pub async fn list_instances_by_status(&self, statuses: &[RuntimeStatus]) -> Result<Vec<InstanceInfo>, ClientError> {
        let admin = self.admin("list_instances_by_status")?;
        let ids = admin.list_instances_by_status(statuses).await?;
        collect_infos(admin, ids).await
    }

    /// Raise an external event into a live instance.
    pub async fn raise_event(
        &self,
        instance: &str,
        event_name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), ClientError> {
        let status = self.get_orchestration_status(instance).await?;
        if matches!(status, OrchestrationStatus::NotFound) {
            return Err(ClientError::InstanceNotFound(format!("No instance with ID {instance} found")));
        }
        if status.is_terminal() {
            return Err(ClientError::InvalidState(format!(
                "Instance with ID {instance} is gone: either completed or failed"
            )));
        }
        let name = event_name.into();
        debug!(target: "durable_e2e::client", instance_id = %instance, event_name = %name, "Raising event");
        self.store
            .enqueue_for_orchestrator(
                WorkItem::ExternalRaised {
                    instance: instance.to_string(),
                    name,
                    data: data.into(),
                },
                None,
            )
            .await?;
        Ok(())
    }

    /// Request termination. The runtime records `OrchestrationTerminated` on its next turn.
    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        let status = self.get_orchestration_status(instance).await?;
        if matches!(status, OrchestrationStatus::NotFound) {
            return Err(not_found(instance));
        }
        if status.is_terminal() {
            warn!(target: "durable_e2e::client", instance_id = %instance, state = status.state_name(), "Terminate refused");
            return Err(ClientError::InvalidState(format!(
                "Cannot terminate orchestration instance in the {} state.",
                status.state_name()
            )));
        }
        self.store
            .enqueue_for_orchestrator(
                WorkItem::CancelInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
                None,
            )
            .await?;
        Ok(())
    }

    /// Suspend a running instance. Completions keep arriving and wait in history until resume.
    pub async fn suspend_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        let status = self.get_orchestration_status(instance).await?;
        match status {
            OrchestrationStatus::NotFound => return Err(not_found(instance)),
            OrchestrationStatus::Pending | OrchestrationStatus::Running | OrchestrationStatus::ContinuedAsNew => {}
            other => {
                warn!(target: "durable_e2e::client", instance_id = %instance, state = other.state_name(), "Suspend refused");
                return Err(ClientError::InvalidState(format!(
                    "Cannot suspend orchestration instance in the {} state.",
                    other.state_name()
                )));
            }
        }
        self.store
            .enqueue_for_orchestrator(
                WorkItem::SuspendInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn resume_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        let status = self.get_orchestration_status(instance).await?;
        match status {
            OrchestrationStatus::NotFound => return Err(not_found(instance)),
            OrchestrationStatus::Suspended => {}
            other => {
                warn!(target: "durable_e2e::client", instance_id = %instance, state = other.state_name(), "Resume refused");
                return Err(ClientError::InvalidState(format!(
                    "Cannot resume orchestration instance in the {} state.",
                    other.state_name()
                )));
            }
        }
        self.store
            .enqueue_for_orchestrator(
                WorkItem::ResumeInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn purge_instances(&self, filter: PurgeFilter) -> Result<PurgeResult, ClientError> {
        let result = self.admin("purge_instances")?.purge_instances(filter).await?;
        info!(target: "durable_e2e::client", deleted = result.instances_deleted, "Purged instance history");
        Ok(result)
    }

    /// Re-run a finished instance with its original name and input.
    ///
    /// Returns the id of the new run: a fresh uuid when `new_instance_id` is
    /// set, otherwise the same id with its old history replaced.
    pub async fn restart_instance(&self, instance: &str, new_instance_id: bool) -> Result<String, ClientError> {
        let Some(info) = self.describe_instance(instance).await? else {
            return Err(ClientError::InstanceNotFound(format!(
                "An orchestration with the instanceId {instance} was not found."
            )));
        };
        let status = self.get_orchestration_status(instance).await?;
        if !status.is_terminal() {
            return Err(ClientError::InvalidState(format!(
                "An orchestration with the instanceId {instance} cannot be restarted because it is still running."
            )));
        }

        let target = if new_instance_id {
            uuid::Uuid::new_v4().to_string()
        } else {
            instance.to_string()
        };
        self.start_orchestration(&target, &info.orchestration_name, info.input).await?;
        info!(target: "durable_e2e::client", instance_id = %instance, new_instance_id = %target, "Restarted orchestration");
        Ok(target)
    }

    /// Poll until the instance reaches a terminal status.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = Duration::from_millis(5);
        loop {
            let status = self.get_orchestration_status(instance).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(100));
        }
    }

    /// Fire-and-forget entity operation; no reply is sent.
    pub async fn signal_entity(
        &self,
        entity: &EntityId,
        operation: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.store
            .enqueue_for_entity(WorkItem::EntityOperation {
                entity: entity.clone(),
                operation: operation.into(),
                input: input.into(),
                caller: None,
            })
            .await?;
        Ok(())
    }

    /// Committed state of an entity, `None` when it has none.
    pub async fn read_entity_state(&self, entity: &EntityId) -> Result<Option<String>, ClientError> {
        Ok(self.admin("read_entity_state")?.read_entity_state(entity).await?)
    }
}

fn not_found(instance: &str) -> ClientError {
    ClientError::InstanceNotFound(format!("No instance with ID '{instance}' found."))
}

fn already_exists(instance: &str) -> ClientError {
    ClientError::AlreadyExists(format!("An orchestration instance with ID '{instance}' already exists."))
}

async fn collect_infos(admin: &dyn ProviderAdmin, ids: Vec<String>) -> Result<Vec<InstanceInfo>, ClientError> {
    let mut infos = Vec::with_capacity(ids.len());
    for id in ids {
        // Purged between the listing and the lookup
        if let Some(info) = admin.get_instance_info(&id).await? {
            infos.push(info);
        }
    }
    Ok(infos)
}
