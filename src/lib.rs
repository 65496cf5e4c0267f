//! Replay-based durable orchestration core and the end-to-end scenario apps
//! that run on top of it.
//!
//! Orchestrations are plain async functions over an [`OrchestrationContext`].
//! Every scheduling call (activity, timer, external wait, entity call) is
//! recorded as an append-only [`Event`] and later replayed, so orchestration
//! code must be deterministic. The crate provides:
//!
//! - The data model: [`Event`], [`EventKind`], [`Action`], [`ErrorDetails`]
//! - [`OrchestrationContext`] with [`DurableFuture`]s composable via `select`/`join`
//! - [`run_turn`] to drive a single replay turn outside the runtime
//! - A pluggable [`providers::Provider`] with in-memory and SQLite backends
//! - A tokio [`runtime::Runtime`] and a control-plane [`client::Client`]
//! - The scenario applications in [`apps`] and the axum surface in [`http`]
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod apps;
pub mod client;
pub mod config;
pub mod entity;
pub mod futures;
pub mod http;
pub mod logging;
pub mod providers;
pub mod retry;
pub mod runtime;

pub use client::{Client, ClientError};
pub use entity::{EntityContext, EntityError, EntityErrorKind, EntityId};
pub use self::futures::{DurableFuture, DurableOutput, JoinFuture, SelectFuture};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use runtime::{
    ActivityRegistry, EntityRegistry, OrchestrationRegistry, OrchestrationStatus, Runtime, RuntimeOptions,
};

/// First execution of every instance.
pub const INITIAL_EXECUTION_ID: u64 = 1;
/// Event id of the `OrchestrationStarted` event that opens every execution.
pub const INITIAL_EVENT_ID: u64 = 1;

// Internal codec utilities for typed I/O
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;

    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // JSON strings travel as their raw content
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Configuration problems surfaced to an orchestration or instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigErrorKind {
    UnregisteredOrchestration,
    UnregisteredActivity,
    Nondeterminism,
}

/// Kinds of application-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppErrorKind {
    ActivityFailed,
    OrchestrationFailed,
    Panicked,
}

/// Structured failure carried by `ActivityFailed` and `OrchestrationFailed` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorDetails {
    /// Provider or runtime infrastructure failed underneath the orchestration.
    Infrastructure {
        operation: String,
        message: String,
        retryable: bool,
    },
    /// Deployment problems: missing registrations, code that no longer replays.
    Configuration {
        kind: ConfigErrorKind,
        resource: String,
        message: Option<String>,
    },
    /// Failures raised by user code.
    Application {
        kind: AppErrorKind,
        message: String,
        retryable: bool,
    },
}

impl ErrorDetails {
    /// `"infrastructure"`, `"configuration"` or `"application"`.
    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::Infrastructure { .. } => "infrastructure",
            ErrorDetails::Configuration { .. } => "configuration",
            ErrorDetails::Application { .. } => "application",
        }
    }

    /// The text an orchestration (or a status query) sees for this failure.
    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Infrastructure { operation, message, .. } => {
                format!("infrastructure:{operation}: {message}")
            }
            ErrorDetails::Configuration {
                kind,
                resource,
                message,
            } => match kind {
                ConfigErrorKind::UnregisteredOrchestration | ConfigErrorKind::UnregisteredActivity => {
                    format!("unregistered:{resource}")
                }
                ConfigErrorKind::Nondeterminism => message
                    .clone()
                    .unwrap_or_else(|| format!("nondeterministic: {resource}")),
            },
            ErrorDetails::Application { message, .. } => message.clone(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorDetails::Infrastructure { retryable, .. } | ErrorDetails::Application { retryable, .. } => *retryable,
            ErrorDetails::Configuration { .. } => false,
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_message())
    }
}

impl std::error::Error for ErrorDetails {}

/// One entry of an instance's append-only history.
///
/// `event_id` is assigned by the runtime (1-based, dense within an execution).
/// Completion events point back at the scheduling event they answer through
/// `source_event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: u64,
    pub source_event_id: Option<u64>,
    pub instance_id: String,
    pub execution_id: u64,
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    OrchestrationStarted { name: String, version: String, input: String },
    OrchestrationCompleted { output: String },
    OrchestrationFailed { details: ErrorDetails },
    OrchestrationContinuedAsNew { input: String },
    OrchestrationTerminated { reason: String },
    ExecutionSuspended { reason: String },
    ExecutionResumed { reason: String },
    ActivityScheduled { name: String, input: String },
    ActivityCompleted { result: String },
    ActivityFailed { details: ErrorDetails },
    TimerCreated { fire_at_ms: u64 },
    TimerFired { fire_at_ms: u64 },
    ExternalSubscribed { name: String },
    ExternalEvent { name: String, data: String },
    EntityCallScheduled {
        entity: EntityId,
        operation: String,
        input: String,
    },
    EntityCallCompleted { result: String },
    EntityCallFailed { error: EntityError },
}

impl Event {
    /// Build an event stamped with the current wall-clock time.
    pub fn with_event_id(
        event_id: u64,
        instance_id: impl Into<String>,
        execution_id: u64,
        source_event_id: Option<u64>,
        kind: EventKind,
    ) -> Self {
        Self {
            event_id,
            source_event_id,
            instance_id: instance_id.into(),
            execution_id,
            timestamp_ms: now_millis(),
            kind,
        }
    }

    pub fn event_id(&self) -> u64 {
        self.event_id
    }

    pub fn source_event_id(&self) -> Option<u64> {
        self.source_event_id
    }

    /// Stable discriminator stored alongside the serialized event.
    pub fn event_type(&self) -> &'static str {
        match &self.kind {
            EventKind::OrchestrationStarted { .. } => "OrchestrationStarted",
            EventKind::OrchestrationCompleted { .. } => "OrchestrationCompleted",
            EventKind::OrchestrationFailed { .. } => "OrchestrationFailed",
            EventKind::OrchestrationContinuedAsNew { .. } => "OrchestrationContinuedAsNew",
            EventKind::OrchestrationTerminated { .. } => "OrchestrationTerminated",
            EventKind::ExecutionSuspended { .. } => "ExecutionSuspended",
            EventKind::ExecutionResumed { .. } => "ExecutionResumed",
            EventKind::ActivityScheduled { .. } => "ActivityScheduled",
            EventKind::ActivityCompleted { .. } => "ActivityCompleted",
            EventKind::ActivityFailed { .. } => "ActivityFailed",
            EventKind::TimerCreated { .. } => "TimerCreated",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::ExternalSubscribed { .. } => "ExternalSubscribed",
            EventKind::ExternalEvent { .. } => "ExternalEvent",
            EventKind::EntityCallScheduled { .. } => "EntityCallScheduled",
            EventKind::EntityCallCompleted { .. } => "EntityCallCompleted",
            EventKind::EntityCallFailed { .. } => "EntityCallFailed",
        }
    }

    /// True for events that end an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::OrchestrationCompleted { .. }
                | EventKind::OrchestrationFailed { .. }
                | EventKind::OrchestrationContinuedAsNew { .. }
                | EventKind::OrchestrationTerminated { .. }
        )
    }

    /// True for events a scheduling call claims during replay.
    pub(crate) fn is_schedule(&self) -> bool {
        matches!(
            self.kind,
            EventKind::ActivityScheduled { .. }
                | EventKind::TimerCreated { .. }
                | EventKind::ExternalSubscribed { .. }
                | EventKind::EntityCallScheduled { .. }
        )
    }
}

/// Decisions produced by a turn that the runtime turns into queue messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    CallActivity {
        scheduling_event_id: u64,
        name: String,
        input: String,
    },
    CreateTimer {
        scheduling_event_id: u64,
        fire_at_ms: u64,
    },
    WaitExternal {
        scheduling_event_id: u64,
        name: String,
    },
    CallEntity {
        scheduling_event_id: u64,
        entity: EntityId,
        operation: String,
        input: String,
    },
    ContinueAsNew {
        input: String,
    },
}

/// A scheduling request as the orchestration expresses it, matched against history.
#[derive(Debug, Clone)]
pub(crate) enum ScheduleRequest {
    Activity { name: String, input: String },
    Timer { fire_at_ms: u64 },
    External { name: String },
    Entity {
        entity: EntityId,
        operation: String,
        input: String,
    },
}

impl ScheduleRequest {
    fn describe(&self) -> String {
        match self {
            ScheduleRequest::Activity { name, input } => format!("ActivityScheduled('{name}','{input}')"),
            ScheduleRequest::Timer { .. } => "TimerCreated".to_string(),
            ScheduleRequest::External { name } => format!("ExternalSubscribed('{name}')"),
            ScheduleRequest::Entity { entity, operation, .. } => {
                format!("EntityCallScheduled('{entity}','{operation}')")
            }
        }
    }

    fn matches(&self, kind: &EventKind) -> bool {
        match (self, kind) {
            (ScheduleRequest::Activity { name, input }, EventKind::ActivityScheduled { name: n, input: i }) => {
                name == n && input == i
            }
            // fire_at is derived from replayed time; any unclaimed timer is ours
            (ScheduleRequest::Timer { .. }, EventKind::TimerCreated { .. }) => true,
            (ScheduleRequest::External { name }, EventKind::ExternalSubscribed { name: n }) => name == n,
            (
                ScheduleRequest::Entity {
                    entity,
                    operation,
                    input,
                },
                EventKind::EntityCallScheduled {
                    entity: e,
                    operation: o,
                    input: i,
                },
            ) => entity == e && operation == o && input == i,
            _ => false,
        }
    }
}

pub(crate) fn describe_schedule_event(kind: &EventKind) -> String {
    match kind {
        EventKind::ActivityScheduled { name, input } => format!("ActivityScheduled('{name}','{input}')"),
        EventKind::TimerCreated { .. } => "TimerCreated".to_string(),
        EventKind::ExternalSubscribed { name } => format!("ExternalSubscribed('{name}')"),
        EventKind::EntityCallScheduled { entity, operation, .. } => {
            format!("EntityCallScheduled('{entity}','{operation}')")
        }
        other => format!("{other:?}"),
    }
}

pub(crate) struct CtxInner {
    pub(crate) history: Vec<Event>,
    pub(crate) actions: Vec<Action>,
    pub(crate) next_event_id: u64,
    pub(crate) claimed_scheduling_events: HashSet<u64>,
    pub(crate) consumed_externals: HashSet<u64>,
    pub(crate) cancelled_source_ids: HashSet<u64>,
    pub(crate) nondeterminism_error: Option<String>,
    pub(crate) instance_id: String,
    pub(crate) execution_id: u64,
    pub(crate) orchestration_name: String,
    pub(crate) orchestration_version: String,
    pub(crate) current_time_ms: u64,
    /// Highest event id persisted before this turn began.
    pub(crate) replay_boundary: u64,
    pub(crate) is_replaying: bool,
    pub(crate) turn_index: u64,
}

impl CtxInner {
    fn new(history: Vec<Event>, replay_boundary: u64) -> Self {
        let next_event_id = history.iter().map(|e| e.event_id).max().unwrap_or(0) + 1;
        let mut inner = Self {
            history,
            actions: Vec::new(),
            next_event_id,
            claimed_scheduling_events: HashSet::new(),
            consumed_externals: HashSet::new(),
            cancelled_source_ids: HashSet::new(),
            nondeterminism_error: None,
            instance_id: String::new(),
            execution_id: INITIAL_EXECUTION_ID,
            orchestration_name: String::new(),
            orchestration_version: String::new(),
            current_time_ms: 0,
            replay_boundary,
            is_replaying: false,
            turn_index: 0,
        };
        if let Some(started) = inner
            .history
            .iter()
            .find(|e| matches!(e.kind, EventKind::OrchestrationStarted { .. }))
            && let EventKind::OrchestrationStarted { name, version, .. } = &started.kind
        {
            inner.instance_id = started.instance_id.clone();
            inner.execution_id = started.execution_id;
            inner.orchestration_name = name.clone();
            inner.orchestration_version = version.clone();
            inner.current_time_ms = started.timestamp_ms;
            inner.is_replaying = started.event_id <= replay_boundary;
        }
        inner
    }

    pub(crate) fn record_action(&mut self, a: Action) {
        // New decisions are never replays
        self.is_replaying = false;
        self.actions.push(a);
    }

    /// Claim the next unclaimed scheduling event, or append a new one.
    ///
    /// Returns `None` after recording a nondeterminism error when history
    /// holds a different scheduling event next.
    pub(crate) fn claim_or_schedule(&mut self, request: &ScheduleRequest) -> Option<u64> {
        let next = self
            .history
            .iter()
            .find(|e| e.is_schedule() && !self.claimed_scheduling_events.contains(&e.event_id));

        if let Some(event) = next {
            if !request.matches(&event.kind) {
                self.nondeterminism_error = Some(format!(
                    "nondeterministic: schedule order mismatch: next is {} but expected {}",
                    describe_schedule_event(&event.kind),
                    request.describe()
                ));
                return None;
            }
            let id = event.event_id;
            self.claimed_scheduling_events.insert(id);
            return Some(id);
        }

        let id = self.next_event_id;
        self.next_event_id += 1;
        let (kind, action) = match request.clone() {
            ScheduleRequest::Activity { name, input } => (
                EventKind::ActivityScheduled {
                    name: name.clone(),
                    input: input.clone(),
                },
                Some(Action::CallActivity {
                    scheduling_event_id: id,
                    name,
                    input,
                }),
            ),
            ScheduleRequest::Timer { fire_at_ms } => (
                EventKind::TimerCreated { fire_at_ms },
                Some(Action::CreateTimer {
                    scheduling_event_id: id,
                    fire_at_ms,
                }),
            ),
            ScheduleRequest::External { name } => (
                EventKind::ExternalSubscribed { name: name.clone() },
                Some(Action::WaitExternal {
                    scheduling_event_id: id,
                    name,
                }),
            ),
            ScheduleRequest::Entity {
                entity,
                operation,
                input,
            } => (
                EventKind::EntityCallScheduled {
                    entity: entity.clone(),
                    operation: operation.clone(),
                    input: input.clone(),
                },
                Some(Action::CallEntity {
                    scheduling_event_id: id,
                    entity,
                    operation,
                    input,
                }),
            ),
        };
        let event = Event::with_event_id(id, self.instance_id.clone(), self.execution_id, None, kind);
        self.history.push(event);
        if let Some(action) = action {
            self.record_action(action);
        }
        self.claimed_scheduling_events.insert(id);
        Some(id)
    }

    /// Advance deterministic time and replay state after consuming a completion.
    pub(crate) fn observe_completion(&mut self, completion_event_id: u64) {
        if let Some(ts) = self
            .history
            .iter()
            .find(|e| e.event_id == completion_event_id)
            .map(|e| e.timestamp_ms)
        {
            self.current_time_ms = self.current_time_ms.max(ts);
        }
        if completion_event_id > self.replay_boundary {
            self.is_replaying = false;
        }
    }
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a context over `history`. Everything in it counts as replay.
    pub fn new(history: Vec<Event>) -> Self {
        let boundary = history.iter().map(|e| e.event_id).max().unwrap_or(0);
        Self::with_replay_boundary(history, boundary)
    }

    pub(crate) fn with_replay_boundary(history: Vec<Event>, replay_boundary: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history, replay_boundary))),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance_id.clone()
    }

    pub fn execution_id(&self) -> u64 {
        self.lock().execution_id
    }

    pub fn orchestration_name(&self) -> String {
        self.lock().orchestration_name.clone()
    }

    pub fn orchestration_version(&self) -> String {
        self.lock().orchestration_version.clone()
    }

    /// Deterministic time in ms since the epoch.
    ///
    /// Starts at the execution's start time and advances to the timestamp of
    /// each completion the orchestration consumes, so replays observe the
    /// same clock.
    pub fn current_time_ms(&self) -> u64 {
        self.lock().current_time_ms
    }

    /// True while the orchestration is re-executing decisions already in history.
    pub fn is_replaying(&self) -> bool {
        self.lock().is_replaying
    }

    pub fn turn_index(&self) -> u64 {
        self.lock().turn_index
    }

    pub(crate) fn set_turn_index(&self, idx: u64) {
        self.lock().turn_index = idx;
    }

    fn trace(&self, level: tracing::Level, message: &str) {
        let inner = self.lock();
        if inner.is_replaying {
            return;
        }
        let instance_id = inner.instance_id.clone();
        let execution_id = inner.execution_id;
        let orchestration_name = inner.orchestration_name.clone();
        drop(inner);
        match level {
            tracing::Level::ERROR => tracing::error!(
                target: "durable_e2e::orchestration",
                instance_id = %instance_id,
                execution_id = %execution_id,
                orchestration_name = %orchestration_name,
                "{}", message
            ),
            tracing::Level::WARN => tracing::warn!(
                target: "durable_e2e::orchestration",
                instance_id = %instance_id,
                execution_id = %execution_id,
                orchestration_name = %orchestration_name,
                "{}", message
            ),
            _ => tracing::info!(
                target: "durable_e2e::orchestration",
                instance_id = %instance_id,
                execution_id = %execution_id,
                orchestration_name = %orchestration_name,
                "{}", message
            ),
        }
    }

    /// Log at INFO unless replaying.
    pub fn trace_info(&self, message: impl AsRef<str>) {
        self.trace(tracing::Level::INFO, message.as_ref());
    }

    /// Log at WARN unless replaying.
    pub fn trace_warn(&self, message: impl AsRef<str>) {
        self.trace(tracing::Level::WARN, message.as_ref());
    }

    /// Log at ERROR unless replaying.
    pub fn trace_error(&self, message: impl AsRef<str>) {
        self.trace(tracing::Level::ERROR, message.as_ref());
    }

    /// Restart this instance as a fresh execution with `input`.
    ///
    /// The orchestration's own return value is ignored once this is called.
    pub fn continue_as_new(&self, input: impl Into<String>) {
        self.lock().record_action(Action::ContinueAsNew { input: input.into() });
    }

    pub fn continue_as_new_typed<In: Serialize>(&self, input: &In) -> Result<(), String> {
        use _typed_codec::Codec;
        let payload = _typed_codec::Json::encode(input)?;
        self.continue_as_new(payload);
        Ok(())
    }

    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::activity(self.clone(), name.into(), input.into())
    }

    /// Schedule an activity with a serializable input; await with `into_activity_typed`.
    pub fn schedule_activity_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        use _typed_codec::Codec;
        // Encoding an in-memory value only fails for non-string map keys; fall back to null
        let payload = _typed_codec::Json::encode(input).unwrap_or_else(|_| "null".to_string());
        self.schedule_activity(name, payload)
    }

    /// Durable timer firing `delay` after the current deterministic time.
    pub fn schedule_timer(&self, delay: Duration) -> DurableFuture {
        let fire_at_ms = self.current_time_ms().saturating_add(delay.as_millis() as u64);
        DurableFuture::timer(self.clone(), fire_at_ms)
    }

    /// Durable timer firing at an absolute time. A time already due fires on the next turn.
    pub fn schedule_timer_at(&self, fire_at_ms: u64) -> DurableFuture {
        DurableFuture::timer(self.clone(), fire_at_ms)
    }

    /// Wait for an external event raised with `name`.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        DurableFuture::external(self.clone(), name.into())
    }

    /// Call an entity operation and wait for its reply.
    pub fn call_entity(
        &self,
        entity: EntityId,
        operation: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        DurableFuture::entity(self.clone(), entity, operation.into(), input.into())
    }

    /// Deterministic select: resolves with the child whose completion is earliest in history.
    pub fn select(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture::new(self.clone(), futures)
    }

    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        self.select(vec![a, b])
    }

    /// Deterministic join: resolves once every child has, outputs in history order.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(self.clone(), futures)
    }

    /// Run an activity under `policy`, waiting on durable timers between attempts.
    ///
    /// With a timeout set each attempt races a timer; losing the race counts
    /// as a failed attempt. The last error is returned when attempts run out.
    pub async fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<String, String> {
        let name = name.into();
        let input = input.into();
        let mut last_error = String::new();

        for attempt in 1..=policy.max_attempts {
            let result = match policy.timeout {
                Some(timeout) => {
                    let activity = self.schedule_activity(name.clone(), input.clone());
                    let timer = self.schedule_timer(timeout);
                    let (winner, output) = self.select2(activity, timer).await;
                    match (winner, output) {
                        (0, DurableOutput::Activity(r)) => r,
                        _ => Err(format!(
                            "timeout: activity '{name}' exceeded {}ms",
                            timeout.as_millis()
                        )),
                    }
                }
                None => self.schedule_activity(name.clone(), input.clone()).into_activity().await,
            };

            match result {
                Ok(output) => return Ok(output),
                Err(e) => {
                    last_error = e;
                    if attempt < policy.max_attempts {
                        let delay = policy.delay_for_attempt(attempt);
                        self.trace_warn(format!(
                            "activity '{name}' attempt {attempt} failed, retrying in {}ms: {last_error}",
                            delay.as_millis()
                        ));
                        if !delay.is_zero() {
                            self.schedule_timer(delay).into_timer().await;
                        }
                    }
                }
            }
        }

        Err(last_error)
    }
}

/// Context handed to activity handlers.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    instance_id: String,
    execution_id: u64,
    orchestration_name: String,
    activity_name: String,
    activity_id: u64,
    worker_id: String,
}

impl ActivityContext {
    pub(crate) fn new(
        instance_id: String,
        execution_id: u64,
        orchestration_name: String,
        activity_name: String,
        activity_id: u64,
        worker_id: String,
    ) -> Self {
        Self {
            instance_id,
            execution_id,
            orchestration_name,
            activity_name,
            activity_id,
            worker_id,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn execution_id(&self) -> u64 {
        self.execution_id
    }

    pub fn orchestration_name(&self) -> &str {
        &self.orchestration_name
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    pub fn activity_id(&self) -> u64 {
        self.activity_id
    }

    pub fn trace_info(&self, message: impl AsRef<str>) {
        tracing::info!(
            target: "durable_e2e::activity",
            instance_id = %self.instance_id,
            execution_id = %self.execution_id,
            orchestration_name = %self.orchestration_name,
            activity_name = %self.activity_name,
            activity_id = %self.activity_id,
            worker_id = %self.worker_id,
            "{}", message.as_ref()
        );
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        tracing::warn!(
            target: "durable_e2e::activity",
            instance_id = %self.instance_id,
            execution_id = %self.execution_id,
            orchestration_name = %self.orchestration_name,
            activity_name = %self.activity_name,
            activity_id = %self.activity_id,
            worker_id = %self.worker_id,
            "{}", message.as_ref()
        );
    }

    pub fn trace_error(&self, message: impl AsRef<str>) {
        tracing::error!(
            target: "durable_e2e::activity",
            instance_id = %self.instance_id,
            execution_id = %self.execution_id,
            orchestration_name = %self.orchestration_name,
            activity_name = %self.activity_name,
            activity_id = %self.activity_id,
            worker_id = %self.worker_id,
            "{}", message.as_ref()
        );
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    // SAFETY: every vtable entry ignores the null data pointer.
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

pub(crate) fn poll_once<F: Future + ?Sized>(fut: Pin<&mut F>) -> Poll<F::Output> {
    let w = noop_waker();
    let mut cx = Context::from_waker(&w);
    fut.poll(&mut cx)
}

/// Result of one replay turn: updated history, new actions, and the output when finished.
pub type TurnResult<O> = (Vec<Event>, Vec<Action>, Option<O>);

/// Poll `orchestrator` once against `history`.
///
/// Used by tests and tooling to check replay behavior without a runtime.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl FnOnce(OrchestrationContext) -> F) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::new(history);
    let mut fut = Box::pin(orchestrator(ctx.clone()));
    let out = match poll_once(fut.as_mut()) {
        Poll::Ready(out) => Some(out),
        Poll::Pending => None,
    };
    drop(fut);
    let mut inner = ctx.lock();
    let actions = std::mem::take(&mut inner.actions);
    let history = std::mem::take(&mut inner.history);
    (history, actions, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(input: &str) -> Event {
        Event::with_event_id(
            1,
            "inst-1",
            1,
            None,
            EventKind::OrchestrationStarted {
                name: "Orch".to_string(),
                version: "1.0.0".to_string(),
                input: input.to_string(),
            },
        )
    }

    /// Test: first turn schedules an activity and records an action
    #[test]
    fn test_first_turn_schedules_activity() {
        let (history, actions, out) = run_turn(vec![started("")], |ctx| async move {
            ctx.schedule_activity("A", "x").into_activity().await
        });
        assert!(out.is_none());
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].event_id, 2);
        assert!(matches!(
            &actions[..],
            [Action::CallActivity { scheduling_event_id: 2, name, input }] if name == "A" && input == "x"
        ));
    }

    /// Test: completion with matching source id resolves the activity on replay
    #[test]
    fn test_replay_resolves_completion() {
        let mut history = vec![started("")];
        history.push(Event::with_event_id(
            2,
            "inst-1",
            1,
            None,
            EventKind::ActivityScheduled {
                name: "A".to_string(),
                input: "x".to_string(),
            },
        ));
        history.push(Event::with_event_id(
            3,
            "inst-1",
            1,
            Some(2),
            EventKind::ActivityCompleted {
                result: "ok".to_string(),
            },
        ));
        let (_, actions, out) = run_turn(history, |ctx| async move {
            ctx.schedule_activity("A", "x").into_activity().await
        });
        assert!(actions.is_empty());
        assert_eq!(out, Some(Ok("ok".to_string())));
    }

    /// Test: a different schedule than history records a nondeterminism error
    #[test]
    fn test_schedule_mismatch_is_nondeterministic() {
        let history = vec![
            started(""),
            Event::with_event_id(
                2,
                "inst-1",
                1,
                None,
                EventKind::ActivityScheduled {
                    name: "A".to_string(),
                    input: "x".to_string(),
                },
            ),
        ];
        let ctx = OrchestrationContext::new(history);
        let mut fut = Box::pin(ctx.schedule_activity("B", "y").into_activity());
        assert!(poll_once(fut.as_mut()).is_pending());
        let err = ctx.lock().nondeterminism_error.clone().unwrap();
        assert_eq!(
            err,
            "nondeterministic: schedule order mismatch: next is ActivityScheduled('A','x') but expected ActivityScheduled('B','y')"
        );
    }

    /// Test: replay of started history is flagged as replaying until a new decision
    #[test]
    fn test_is_replaying_flips_on_new_decision() {
        let ctx = OrchestrationContext::new(vec![started("")]);
        assert!(ctx.is_replaying());
        let mut fut = Box::pin(ctx.schedule_timer(Duration::from_secs(1)).into_timer());
        let _ = poll_once(fut.as_mut());
        assert!(!ctx.is_replaying());
    }

    /// Test: error details render the text orchestrations observe
    #[test]
    fn test_error_details_display_message() {
        let app = ErrorDetails::Application {
            kind: AppErrorKind::ActivityFailed,
            message: "boom".to_string(),
            retryable: false,
        };
        assert_eq!(app.display_message(), "boom");
        assert_eq!(app.category(), "application");

        let cfg = ErrorDetails::Configuration {
            kind: ConfigErrorKind::UnregisteredActivity,
            resource: "Missing".to_string(),
            message: None,
        };
        assert_eq!(cfg.to_string(), "unregistered:Missing");
        assert!(!cfg.is_retryable());
    }

    /// Test: typed codec passes strings through raw and falls back on decode
    #[test]
    fn test_typed_codec_string_passthrough() {
        use _typed_codec::Codec;
        assert_eq!(_typed_codec::Json::encode(&"hi").unwrap(), "hi");
        assert_eq!(_typed_codec::Json::encode(&vec![1, 2]).unwrap(), "[1,2]");
        let s: String = _typed_codec::Json::decode("plain text").unwrap();
        assert_eq!(s, "plain text");
        let n: u32 = _typed_codec::Json::decode("42").unwrap();
        assert_eq!(n, 42);
    }
}
