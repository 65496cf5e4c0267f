//! Administrative queries and purge, separate from the runtime hot path.
use serde::{Deserialize, Serialize};

use super::{ProviderError, RuntimeStatus};
use crate::Event;
use crate::entity::EntityId;

/// Instance row joined with its current execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub orchestration_name: String,
    pub orchestration_version: String,
    pub current_execution_id: u64,
    pub status: RuntimeStatus,
    pub input: String,
    /// Output when completed, failure text when failed.
    pub output: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    pub orchestrator_queue: usize,
    pub worker_queue: usize,
    pub entity_queue: usize,
}

/// Selects instances to purge.
///
/// Created time must lie in `[created_from, created_to]` (open when unset)
/// and status must be one of `statuses`. `instance_id` narrows it to one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeFilter {
    pub instance_id: Option<String>,
    pub created_from: Option<u64>,
    pub created_to: Option<u64>,
    pub statuses: Vec<RuntimeStatus>,
}

impl PurgeFilter {
    pub fn terminal() -> Self {
        Self {
            instance_id: None,
            created_from: None,
            created_to: None,
            statuses: vec![RuntimeStatus::Completed, RuntimeStatus::Failed, RuntimeStatus::Terminated],
        }
    }

    /// Restrict to a single instance.
    pub fn for_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance_id = Some(instance.into());
        self
    }

    pub fn matches(&self, instance: &str, created_at: u64, status: RuntimeStatus) -> bool {
        self.instance_id.as_deref().is_none_or(|id| id == instance)
            && self.created_from.is_none_or(|from| created_at >= from)
            && self.created_to.is_none_or(|to| created_at <= to)
            && self.statuses.contains(&status)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeResult {
    pub instances_deleted: u64,
}

#[async_trait::async_trait]
pub trait ProviderAdmin: Send + Sync {
    /// Instance ids, newest first.
    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    async fn list_instances_by_status(&self, statuses: &[RuntimeStatus]) -> Result<Vec<String>, ProviderError>;

    async fn get_instance_info(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError>;

    /// Execution ids in ascending order.
    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError>;

    async fn read_history_with_execution_id(
        &self,
        instance: &str,
        execution_id: u64,
    ) -> Result<Vec<Event>, ProviderError>;

    async fn read_entity_state(&self, entity: &EntityId) -> Result<Option<String>, ProviderError>;

    async fn get_queue_depths(&self) -> Result<QueueDepths, ProviderError>;

    /// Delete matching instances with all executions, history and queued messages.
    async fn purge_instances(&self, filter: PurgeFilter) -> Result<PurgeResult, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: purge filter bounds are inclusive and open when unset
    #[test]
    fn test_purge_filter_matches() {
        let filter = PurgeFilter {
            instance_id: None,
            created_from: Some(100),
            created_to: Some(200),
            statuses: vec![RuntimeStatus::Completed],
        };
        assert!(filter.matches("a", 100, RuntimeStatus::Completed));
        assert!(filter.matches("a", 200, RuntimeStatus::Completed));
        assert!(!filter.matches("a", 201, RuntimeStatus::Completed));
        assert!(!filter.matches("a", 150, RuntimeStatus::Running));

        let open = PurgeFilter::terminal();
        assert!(open.matches("a", 0, RuntimeStatus::Failed));
        assert!(open.matches("a", u64::MAX, RuntimeStatus::Terminated));
        assert!(!open.matches("a", 5, RuntimeStatus::Suspended));

        let one = PurgeFilter::terminal().for_instance("b");
        assert!(one.matches("b", 5, RuntimeStatus::Completed));
        assert!(!one.matches("a", 5, RuntimeStatus::Completed));
    }
}
