use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::sync::Mutex;

use super::{
    EntityItem, ExecutionMetadata, InstanceInfo, OrchestrationItem, Provider, ProviderAdmin, ProviderError,
    PurgeFilter, PurgeResult, QueueDepths, RuntimeStatus, ScheduledActivityIdentifier, WorkItem, after,
    generate_lock_token, now_millis,
};
use crate::Event;
use crate::entity::{EntityId, EntityStateUpdate};

struct ExecutionRecord {
    status: RuntimeStatus,
    output: Option<String>,
    history: Vec<Event>,
}

impl ExecutionRecord {
    fn new(status: RuntimeStatus) -> Self {
        Self {
            status,
            output: None,
            history: Vec::new(),
        }
    }
}

struct InstanceRecord {
    orchestration_name: String,
    orchestration_version: String,
    input: String,
    current_execution_id: u64,
    created_at: u64,
    updated_at: u64,
    executions: BTreeMap<u64, ExecutionRecord>,
}

impl InstanceRecord {
    fn current(&self) -> Option<&ExecutionRecord> {
        self.executions.get(&self.current_execution_id)
    }

    fn status(&self) -> RuntimeStatus {
        self.current().map(|e| e.status).unwrap_or(RuntimeStatus::Pending)
    }
}

struct QueuedMessage {
    id: u64,
    item: WorkItem,
    visible_at: u64,
    lock_token: Option<String>,
    locked_until: u64,
}

struct Lock {
    token: String,
    locked_until: u64,
}

#[derive(Default)]
struct State {
    instances: HashMap<String, InstanceRecord>,
    orchestrator_queue: Vec<QueuedMessage>,
    instance_locks: HashMap<String, Lock>,
    worker_queue: Vec<QueuedMessage>,
    entity_queue: Vec<QueuedMessage>,
    entity_state: HashMap<EntityId, String>,
    entity_locks: HashMap<EntityId, Lock>,
    next_id: u64,
}

impl State {
    fn push(&mut self, queue: QueueKind, item: WorkItem, visible_at: u64) {
        self.next_id += 1;
        let msg = QueuedMessage {
            id: self.next_id,
            item,
            visible_at,
            lock_token: None,
            locked_until: 0,
        };
        match queue {
            QueueKind::Orchestrator => self.orchestrator_queue.push(msg),
            QueueKind::Worker => self.worker_queue.push(msg),
            QueueKind::Entity => self.entity_queue.push(msg),
        }
    }

    fn instance_locked(&self, instance: &str, now: u64) -> bool {
        self.instance_locks.get(instance).is_some_and(|l| l.locked_until > now)
    }

    fn entity_locked(&self, entity: &EntityId, now: u64) -> bool {
        self.entity_locks.get(entity).is_some_and(|l| l.locked_until > now)
    }

    /// Drop everything stored or queued for `instance`.
    fn remove_instance(&mut self, instance: &str) {
        self.instances.remove(instance);
        self.instance_locks.remove(instance);
        self.orchestrator_queue
            .retain(|m| m.item.orchestrator_instance() != Some(instance));
        self.worker_queue.retain(|m| {
            !matches!(&m.item, WorkItem::ActivityExecute { instance: i, .. } if i == instance)
        });
    }
}

#[derive(Clone, Copy)]
enum QueueKind {
    Orchestrator,
    Worker,
    Entity,
}

/// Provider keeping everything in process memory.
#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

fn entity_of(item: &WorkItem) -> Option<&EntityId> {
    match item {
        WorkItem::EntityOperation { entity, .. } => Some(entity),
        _ => None,
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(OrchestrationItem, String)>, ProviderError> {
        let mut st = self.state.lock().await;
        let now = now_millis();

        let candidate = st
            .orchestrator_queue
            .iter()
            .filter(|m| m.visible_at <= now)
            .filter_map(|m| Some((m.visible_at, m.id, m.item.orchestrator_instance()?)))
            .filter(|(_, _, inst)| !st.instance_locked(inst, now))
            .min_by_key(|(visible_at, id, _)| (*visible_at, *id))
            .map(|(_, _, inst)| inst.to_string());
        let Some(instance) = candidate else {
            return Ok(None);
        };

        let token = generate_lock_token();
        st.instance_locks.insert(
            instance.clone(),
            Lock {
                token: token.clone(),
                locked_until: after(now, lock_timeout),
            },
        );

        let mut messages = Vec::new();
        for m in st.orchestrator_queue.iter_mut() {
            if m.visible_at <= now && m.item.orchestrator_instance() == Some(instance.as_str()) {
                m.lock_token = Some(token.clone());
                messages.push(m.item.clone());
            }
        }

        let item = match st.instances.get(&instance) {
            Some(rec) => OrchestrationItem {
                instance: instance.clone(),
                orchestration_name: rec.orchestration_name.clone(),
                execution_id: rec.current_execution_id,
                version: rec.orchestration_version.clone(),
                input: rec.input.clone(),
                history: rec.current().map(|e| e.history.clone()).unwrap_or_default(),
                messages,
            },
            None => {
                let (name, input) = messages
                    .iter()
                    .find_map(|m| match m {
                        WorkItem::StartOrchestration {
                            orchestration, input, ..
                        } => Some((orchestration.clone(), input.clone())),
                        _ => None,
                    })
                    .unwrap_or_default();
                OrchestrationItem {
                    instance: instance.clone(),
                    orchestration_name: name,
                    execution_id: crate::INITIAL_EXECUTION_ID,
                    version: String::new(),
                    input,
                    history: Vec::new(),
                    messages,
                }
            }
        };

        tracing::debug!(
            target: "durable_e2e::providers::in_memory",
            instance = %instance,
            messages = item.messages.len(),
            history_len = item.history.len(),
            "Fetched orchestration item"
        );
        Ok(Some((item, token)))
    }

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
    ) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let now = now_millis();

        let instance = st
            .instance_locks
            .iter()
            .find(|(_, l)| l.token == lock_token)
            .map(|(i, l)| (i.clone(), l.locked_until))
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_item", "Invalid lock token"))?;
        let (instance, locked_until) = instance;
        if locked_until <= now {
            return Err(ProviderError::permanent("ack_orchestration_item", "Instance lock expired"));
        }
        if history_delta.iter().any(|e| e.event_id == 0) {
            return Err(ProviderError::permanent(
                "ack_orchestration_item",
                "event_id must be set by runtime",
            ));
        }

        st.orchestrator_queue
            .retain(|m| m.lock_token.as_deref() != Some(lock_token));

        if !st.instances.contains_key(&instance)
            && let Some(name) = &metadata.orchestration_name
        {
            st.instances.insert(
                instance.clone(),
                InstanceRecord {
                    orchestration_name: name.clone(),
                    orchestration_version: metadata.orchestration_version.clone().unwrap_or_default(),
                    input: String::new(),
                    current_execution_id: execution_id,
                    created_at: now,
                    updated_at: now,
                    executions: BTreeMap::new(),
                },
            );
        }

        if let Some(rec) = st.instances.get_mut(&instance) {
            if let Some(name) = &metadata.orchestration_name {
                rec.orchestration_name = name.clone();
            }
            if let Some(version) = &metadata.orchestration_version {
                rec.orchestration_version = version.clone();
            }
            rec.current_execution_id = rec.current_execution_id.max(execution_id);
            rec.updated_at = now;
            let exec = rec
                .executions
                .entry(execution_id)
                .or_insert_with(|| ExecutionRecord::new(RuntimeStatus::Running));
            exec.history.extend(history_delta);
            if let Some(status) = metadata.status {
                exec.status = status;
                exec.output = metadata.output.clone();
            }
        }

        for item in worker_items {
            st.push(QueueKind::Worker, item, now);
        }
        for item in entity_items {
            st.push(QueueKind::Entity, item, now);
        }
        for item in orchestrator_items {
            let visible_at = item.visible_at_ms(now);
            st.push(QueueKind::Orchestrator, item, visible_at);
        }

        if !cancelled_activities.is_empty() {
            st.worker_queue.retain(|m| match &m.item {
                WorkItem::ActivityExecute {
                    instance: i,
                    execution_id: e,
                    id,
                    ..
                } => !cancelled_activities
                    .iter()
                    .any(|c| &c.instance == i && c.execution_id == *e && c.activity_id == *id),
                _ => true,
            });
        }

        st.instance_locks.remove(&instance);
        tracing::debug!(
            target: "durable_e2e::providers::in_memory",
            instance = %instance,
            execution_id,
            "Acknowledged orchestration item and released lock"
        );
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let now = now_millis();
        let instance = st
            .instance_locks
            .iter()
            .find(|(_, l)| l.token == lock_token)
            .map(|(i, _)| i.clone())
            .ok_or_else(|| ProviderError::permanent("abandon_orchestration_item", "Invalid lock token"))?;
        st.instance_locks.remove(&instance);
        for m in st.orchestrator_queue.iter_mut() {
            if m.lock_token.as_deref() == Some(lock_token) {
                m.lock_token = None;
                if let Some(d) = delay {
                    m.visible_at = after(now, d);
                }
            }
        }
        Ok(())
    }

    async fn renew_orchestration_item_lock(&self, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let now = now_millis();
        match st
            .instance_locks
            .values_mut()
            .find(|l| l.token == lock_token && l.locked_until > now)
        {
            Some(lock) => {
                lock.locked_until = after(now, extend_for);
                Ok(())
            }
            None => Err(ProviderError::permanent(
                "renew_orchestration_item_lock",
                "Lock token invalid, expired, or already acked",
            )),
        }
    }

    async fn fetch_work_item(&self, lock_timeout: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut st = self.state.lock().await;
        let now = now_millis();
        let Some(msg) = st
            .worker_queue
            .iter_mut()
            .filter(|m| m.visible_at <= now && (m.lock_token.is_none() || m.locked_until <= now))
            .min_by_key(|m| (m.visible_at, m.id))
        else {
            return Ok(None);
        };
        let token = generate_lock_token();
        msg.lock_token = Some(token.clone());
        msg.locked_until = after(now, lock_timeout);
        Ok(Some((msg.item.clone(), token)))
    }

    async fn ack_work_item(&self, token: &str, completion: Option<WorkItem>) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let before = st.worker_queue.len();
        st.worker_queue.retain(|m| m.lock_token.as_deref() != Some(token));
        if st.worker_queue.len() == before {
            return Err(ProviderError::permanent(
                "ack_work_item",
                "Activity was cancelled (worker queue row deleted)",
            ));
        }
        if let Some(completion) = completion {
            if completion.orchestrator_instance().is_none() {
                return Err(ProviderError::permanent(
                    "ack_work_item",
                    "Invalid completion type for worker ack",
                ));
            }
            let now = now_millis();
            st.push(QueueKind::Orchestrator, completion, now);
        }
        Ok(())
    }

    async fn renew_work_item_lock(&self, token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let now = now_millis();
        match st
            .worker_queue
            .iter_mut()
            .find(|m| m.lock_token.as_deref() == Some(token) && m.locked_until > now)
        {
            Some(msg) => {
                msg.locked_until = after(now, extend_for);
                Ok(())
            }
            None => Err(ProviderError::permanent(
                "renew_work_item_lock",
                "Lock renewal failed - activity was cancelled or lock expired",
            )),
        }
    }

    async fn abandon_work_item(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let now = now_millis();
        let Some(msg) = st
            .worker_queue
            .iter_mut()
            .find(|m| m.lock_token.as_deref() == Some(token))
        else {
            return Err(ProviderError::permanent(
                "abandon_work_item",
                "Invalid lock token or already acked",
            ));
        };
        msg.lock_token = None;
        msg.locked_until = 0;
        msg.visible_at = delay.map_or(now, |d| after(now, d));
        Ok(())
    }

    async fn fetch_entity_item(&self, lock_timeout: Duration) -> Result<Option<(EntityItem, String)>, ProviderError> {
        let mut st = self.state.lock().await;
        let now = now_millis();

        let Some(idx) = st.entity_queue.iter().position(|m| {
            m.visible_at <= now && entity_of(&m.item).is_some_and(|e| !st.entity_locked(e, now))
        }) else {
            return Ok(None);
        };

        let token = generate_lock_token();
        let msg = &mut st.entity_queue[idx];
        msg.lock_token = Some(token.clone());
        let WorkItem::EntityOperation {
            entity,
            operation,
            input,
            caller,
        } = msg.item.clone()
        else {
            return Err(ProviderError::permanent("fetch_entity_item", "Invalid entity queue item"));
        };
        st.entity_locks.insert(
            entity.clone(),
            Lock {
                token: token.clone(),
                locked_until: after(now, lock_timeout),
            },
        );
        let state = st.entity_state.get(&entity).cloned();
        Ok(Some((
            EntityItem {
                entity,
                operation,
                input,
                caller,
                state,
            },
            token,
        )))
    }

    async fn ack_entity_item(
        &self,
        token: &str,
        state: EntityStateUpdate,
        completion: Option<WorkItem>,
    ) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let now = now_millis();
        let entity = st
            .entity_locks
            .iter()
            .find(|(_, l)| l.token == token && l.locked_until > now)
            .map(|(e, _)| e.clone())
            .ok_or_else(|| ProviderError::permanent("ack_entity_item", "Invalid or expired lock token"))?;

        st.entity_queue.retain(|m| m.lock_token.as_deref() != Some(token));
        match state {
            EntityStateUpdate::Unchanged => {}
            EntityStateUpdate::Set(value) => {
                st.entity_state.insert(entity.clone(), value);
            }
            EntityStateUpdate::Delete => {
                st.entity_state.remove(&entity);
            }
        }
        if let Some(completion) = completion {
            st.push(QueueKind::Orchestrator, completion, now);
        }
        st.entity_locks.remove(&entity);
        Ok(())
    }

    async fn abandon_entity_item(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let now = now_millis();
        let entity = st
            .entity_locks
            .iter()
            .find(|(_, l)| l.token == token)
            .map(|(e, _)| e.clone())
            .ok_or_else(|| ProviderError::permanent("abandon_entity_item", "Invalid lock token"))?;
        st.entity_locks.remove(&entity);
        for m in st.entity_queue.iter_mut() {
            if m.lock_token.as_deref() == Some(token) {
                m.lock_token = None;
                m.visible_at = delay.map_or(now, |d| after(now, d));
            }
        }
        Ok(())
    }

    async fn enqueue_for_orchestrator(&self, item: WorkItem, delay: Option<Duration>) -> Result<(), ProviderError> {
        if item.orchestrator_instance().is_none() {
            return Err(ProviderError::permanent(
                "enqueue_for_orchestrator",
                "Invalid work item type",
            ));
        }
        let mut st = self.state.lock().await;
        let now = now_millis();
        let visible_at = item.visible_at_ms(now).max(delay.map_or(now, |d| after(now, d)));
        st.push(QueueKind::Orchestrator, item, visible_at);
        Ok(())
    }

    async fn enqueue_for_entity(&self, item: WorkItem) -> Result<(), ProviderError> {
        if entity_of(&item).is_none() {
            return Err(ProviderError::permanent("enqueue_for_entity", "Invalid work item type"));
        }
        let mut st = self.state.lock().await;
        let now = now_millis();
        st.push(QueueKind::Entity, item, now);
        Ok(())
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let st = self.state.lock().await;
        Ok(st
            .instances
            .get(instance)
            .and_then(|r| r.current())
            .map(|e| e.history.clone())
            .unwrap_or_default())
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError> {
        let st = self.state.lock().await;
        Ok(st
            .instances
            .get(instance)
            .and_then(|r| r.executions.get(&execution_id))
            .map(|e| e.history.clone())
            .unwrap_or_default())
    }

    async fn create_instance(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        if let Some(existing) = st.instances.get(instance) {
            if !existing.status().is_terminal() {
                return Err(ProviderError::permanent(
                    "create_instance",
                    format!("instance already exists: {instance}"),
                ));
            }
            st.remove_instance(instance);
        }
        let now = now_millis();
        let mut executions = BTreeMap::new();
        executions.insert(crate::INITIAL_EXECUTION_ID, ExecutionRecord::new(RuntimeStatus::Pending));
        st.instances.insert(
            instance.to_string(),
            InstanceRecord {
                orchestration_name: orchestration.to_string(),
                orchestration_version: String::new(),
                input: input.to_string(),
                current_execution_id: crate::INITIAL_EXECUTION_ID,
                created_at: now,
                updated_at: now,
                executions,
            },
        );
        Ok(())
    }

    fn as_management_capability(&self) -> Option<&dyn ProviderAdmin> {
        Some(self as &dyn ProviderAdmin)
    }
}

#[async_trait::async_trait]
impl ProviderAdmin for InMemoryProvider {
    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let st = self.state.lock().await;
        let mut rows: Vec<(&String, u64)> = st.instances.iter().map(|(id, r)| (id, r.created_at)).collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        Ok(rows.into_iter().map(|(id, _)| id.clone()).collect())
    }

    async fn list_instances_by_status(&self, statuses: &[RuntimeStatus]) -> Result<Vec<String>, ProviderError> {
        let ids = self.list_instances().await?;
        let st = self.state.lock().await;
        Ok(ids
            .into_iter()
            .filter(|id| st.instances.get(id).is_some_and(|r| statuses.contains(&r.status())))
            .collect())
    }

    async fn get_instance_info(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
        let st = self.state.lock().await;
        Ok(st.instances.get(instance).map(|r| InstanceInfo {
            instance_id: instance.to_string(),
            orchestration_name: r.orchestration_name.clone(),
            orchestration_version: r.orchestration_version.clone(),
            current_execution_id: r.current_execution_id,
            status: r.status(),
            input: r.input.clone(),
            output: r.current().and_then(|e| e.output.clone()),
            created_at: r.created_at,
            updated_at: r.updated_at,
        }))
    }

    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError> {
        let st = self.state.lock().await;
        Ok(st
            .instances
            .get(instance)
            .map(|r| r.executions.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn read_history_with_execution_id(
        &self,
        instance: &str,
        execution_id: u64,
    ) -> Result<Vec<Event>, ProviderError> {
        self.read_with_execution(instance, execution_id).await
    }

    async fn read_entity_state(&self, entity: &EntityId) -> Result<Option<String>, ProviderError> {
        Ok(self.state.lock().await.entity_state.get(entity).cloned())
    }

    async fn get_queue_depths(&self) -> Result<QueueDepths, ProviderError> {
        let st = self.state.lock().await;
        Ok(QueueDepths {
            orchestrator_queue: st.orchestrator_queue.len(),
            worker_queue: st.worker_queue.len(),
            entity_queue: st.entity_queue.len(),
        })
    }

    async fn purge_instances(&self, filter: PurgeFilter) -> Result<PurgeResult, ProviderError> {
        let mut st = self.state.lock().await;
        let matched: Vec<String> = st
            .instances
            .iter()
            .filter(|(id, r)| filter.matches(id, r.created_at, r.status()))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &matched {
            st.remove_instance(id);
        }
        Ok(PurgeResult {
            instances_deleted: matched.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;
    use crate::entity::EntityId;

    fn started(instance: &str) -> Event {
        Event::with_event_id(
            1,
            instance,
            1,
            None,
            EventKind::OrchestrationStarted {
                name: "Orch".to_string(),
                version: "1.0.0".to_string(),
                input: "in".to_string(),
            },
        )
    }

    fn running_metadata() -> ExecutionMetadata {
        ExecutionMetadata {
            status: Some(RuntimeStatus::Running),
            output: None,
            orchestration_name: Some("Orch".to_string()),
            orchestration_version: Some("1.0.0".to_string()),
        }
    }

    async fn start(store: &InMemoryProvider, instance: &str) {
        store.create_instance(instance, "Orch", "in").await.unwrap();
        store
            .enqueue_for_orchestrator(
                WorkItem::StartOrchestration {
                    instance: instance.to_string(),
                    orchestration: "Orch".to_string(),
                    input: "in".to_string(),
                },
                None,
            )
            .await
            .unwrap();
    }

    /// Test: instance lock hides a locked instance until ack
    #[tokio::test]
    async fn test_instance_lock_excludes_second_fetch() {
        let store = InMemoryProvider::new();
        start(&store, "i1").await;

        let (item, token) = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.instance, "i1");
        assert_eq!(item.orchestration_name, "Orch");
        assert!(store.fetch_orchestration_item(Duration::from_secs(5)).await.unwrap().is_none());

        store
            .ack_orchestration_item(
                &token,
                1,
                vec![started("i1")],
                vec![],
                vec![],
                vec![],
                running_metadata(),
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(store.read("i1").await.unwrap().len(), 1);
        let info = store.get_instance_info("i1").await.unwrap().unwrap();
        assert_eq!(info.status, RuntimeStatus::Running);
    }

    /// Test: timers stay invisible until their fire time
    #[tokio::test]
    async fn test_timer_fired_delayed_visibility() {
        let store = InMemoryProvider::new();
        store
            .enqueue_for_orchestrator(
                WorkItem::TimerFired {
                    instance: "i1".to_string(),
                    execution_id: 1,
                    id: 2,
                    fire_at_ms: now_millis() + 60_000,
                },
                None,
            )
            .await
            .unwrap();
        assert!(store.fetch_orchestration_item(Duration::from_secs(5)).await.unwrap().is_none());
        assert_eq!(store.get_queue_depths().await.unwrap().orchestrator_queue, 1);
    }

    /// Test: cancelled activities vanish from the worker queue and late acks fail
    #[tokio::test]
    async fn test_cancelled_activity_removed() {
        let store = InMemoryProvider::new();
        start(&store, "i1").await;
        let (_, token) = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        let activity = WorkItem::ActivityExecute {
            instance: "i1".to_string(),
            execution_id: 1,
            id: 2,
            orchestration: "Orch".to_string(),
            name: "A".to_string(),
            input: String::new(),
        };
        store
            .ack_orchestration_item(
                &token,
                1,
                vec![started("i1")],
                vec![activity],
                vec![],
                vec![],
                running_metadata(),
                vec![],
            )
            .await
            .unwrap();

        let (_, work_token) = store.fetch_work_item(Duration::from_secs(5)).await.unwrap().unwrap();

        store
            .enqueue_for_orchestrator(
                WorkItem::ExternalRaised {
                    instance: "i1".to_string(),
                    name: "x".to_string(),
                    data: String::new(),
                },
                None,
            )
            .await
            .unwrap();
        let (_, token) = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        store
            .ack_orchestration_item(
                &token,
                1,
                vec![],
                vec![],
                vec![],
                vec![],
                running_metadata(),
                vec![ScheduledActivityIdentifier {
                    instance: "i1".to_string(),
                    execution_id: 1,
                    activity_id: 2,
                }],
            )
            .await
            .unwrap();

        assert_eq!(store.get_queue_depths().await.unwrap().worker_queue, 0);
        let err = store.ack_work_item(&work_token, None).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    /// Test: an abandoned work item with a delay goes behind items that became visible earlier
    #[tokio::test]
    async fn test_work_items_fetched_in_visibility_order() {
        let store = InMemoryProvider::new();
        start(&store, "i1").await;
        let (_, token) = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        let activity = |id: u64, name: &str| WorkItem::ActivityExecute {
            instance: "i1".to_string(),
            execution_id: 1,
            id,
            orchestration: "Orch".to_string(),
            name: name.to_string(),
            input: String::new(),
        };
        store
            .ack_orchestration_item(
                &token,
                1,
                vec![started("i1")],
                vec![activity(2, "A"), activity(3, "B")],
                vec![],
                vec![],
                running_metadata(),
                vec![],
            )
            .await
            .unwrap();

        let (first, token) = store.fetch_work_item(Duration::from_secs(5)).await.unwrap().unwrap();
        assert!(matches!(first, WorkItem::ActivityExecute { ref name, .. } if name == "A"));
        store
            .abandon_work_item(&token, Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (next, _) = store.fetch_work_item(Duration::from_secs(5)).await.unwrap().unwrap();
        assert!(matches!(next, WorkItem::ActivityExecute { ref name, .. } if name == "B"));
        let (last, _) = store.fetch_work_item(Duration::from_secs(5)).await.unwrap().unwrap();
        assert!(matches!(last, WorkItem::ActivityExecute { ref name, .. } if name == "A"));
    }

    /// Test: operations on one entity are serialized by the entity lock
    #[tokio::test]
    async fn test_entity_lock_serializes_key() {
        let store = InMemoryProvider::new();
        let counter = EntityId::new("Counter", "c1");
        for op in ["add", "get"] {
            store
                .enqueue_for_entity(WorkItem::EntityOperation {
                    entity: counter.clone(),
                    operation: op.to_string(),
                    input: String::new(),
                    caller: None,
                })
                .await
                .unwrap();
        }
        store
            .enqueue_for_entity(WorkItem::EntityOperation {
                entity: EntityId::new("Counter", "c2"),
                operation: "add".to_string(),
                input: String::new(),
                caller: None,
            })
            .await
            .unwrap();

        let (first, token) = store.fetch_entity_item(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(first.operation, "add");
        assert_eq!(first.entity, counter);

        let (other, other_token) = store.fetch_entity_item(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(other.entity.key, "c2");
        assert!(store.fetch_entity_item(Duration::from_secs(5)).await.unwrap().is_none());

        store
            .ack_entity_item(&token, EntityStateUpdate::Set("1".to_string()), None)
            .await
            .unwrap();
        store
            .ack_entity_item(&other_token, EntityStateUpdate::Unchanged, None)
            .await
            .unwrap();

        let (second, _) = store.fetch_entity_item(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(second.operation, "get");
        assert_eq!(second.state.as_deref(), Some("1"));
    }

    /// Test: create_instance refuses live duplicates and replaces terminal ones
    #[tokio::test]
    async fn test_create_instance_duplicate_rules() {
        let store = InMemoryProvider::new();
        store.create_instance("dup", "Orch", "a").await.unwrap();
        assert!(store.create_instance("dup", "Orch", "b").await.is_err());

        let (_, token) = {
            store
                .enqueue_for_orchestrator(
                    WorkItem::StartOrchestration {
                        instance: "dup".to_string(),
                        orchestration: "Orch".to_string(),
                        input: "a".to_string(),
                    },
                    None,
                )
                .await
                .unwrap();
            store
                .fetch_orchestration_item(Duration::from_secs(5))
                .await
                .unwrap()
                .unwrap()
        };
        store
            .ack_orchestration_item(
                &token,
                1,
                vec![started("dup")],
                vec![],
                vec![],
                vec![],
                ExecutionMetadata {
                    status: Some(RuntimeStatus::Completed),
                    output: Some("done".to_string()),
                    ..running_metadata()
                },
                vec![],
            )
            .await
            .unwrap();

        store.create_instance("dup", "Orch", "b").await.unwrap();
        let info = store.get_instance_info("dup").await.unwrap().unwrap();
        assert_eq!(info.status, RuntimeStatus::Pending);
        assert_eq!(info.input, "b");
        assert!(store.read("dup").await.unwrap().is_empty());
    }

    /// Test: purge removes only matching instances and counts them exactly
    #[tokio::test]
    async fn test_purge_by_status() {
        let store = InMemoryProvider::new();
        for id in ["done", "live"] {
            start(&store, id).await;
            let (item, token) = store
                .fetch_orchestration_item(Duration::from_secs(5))
                .await
                .unwrap()
                .unwrap();
            let status = if item.instance == "done" {
                RuntimeStatus::Completed
            } else {
                RuntimeStatus::Running
            };
            store
                .ack_orchestration_item(
                    &token,
                    1,
                    vec![started(&item.instance)],
                    vec![],
                    vec![],
                    vec![],
                    ExecutionMetadata {
                        status: Some(status),
                        ..running_metadata()
                    },
                    vec![],
                )
                .await
                .unwrap();
        }

        let first = store.purge_instances(PurgeFilter::terminal()).await.unwrap();
        assert_eq!(first.instances_deleted, 1);
        assert!(store.get_instance_info("done").await.unwrap().is_none());
        assert!(store.get_instance_info("live").await.unwrap().is_some());

        let second = store.purge_instances(PurgeFilter::terminal()).await.unwrap();
        assert_eq!(second.instances_deleted, 0);
    }
}
