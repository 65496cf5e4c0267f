#![allow(dead_code)]

use durable_e2e::apps::{self, AppEnv, FaultInjector};
use durable_e2e::client::Client;
use durable_e2e::config::AppConfig;
use durable_e2e::providers::Provider;
use durable_e2e::providers::in_memory::InMemoryProvider;
use durable_e2e::providers::sqlite::SqliteProvider;
use durable_e2e::runtime::{OrchestrationStatus, Runtime};
use durable_e2e::{Event, EventKind};
use std::sync::Arc as StdArc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// A running runtime with every scenario registered.
pub struct TestApp {
    pub runtime: StdArc<Runtime>,
    pub client: Client,
    pub store: StdArc<dyn Provider>,
    pub faults: FaultInjector,
}

impl TestApp {
    pub async fn shutdown(self) {
        self.runtime.shutdown(Some(500)).await;
    }
}

/// Config with scenario timings shrunk for tests.
pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.runtime.dispatcher_idle_sleep_ms = 5;
    config.scenarios.retry_first_interval_ms = 10;
    config.scenarios.simulated_work_ms = 5;
    config.scenarios.long_activity_ms = 3_000;
    config
}

pub async fn start_app(config: AppConfig) -> TestApp {
    start_app_with_store(config, StdArc::new(InMemoryProvider::new())).await
}

pub async fn start_app_with_store(config: AppConfig, store: StdArc<dyn Provider>) -> TestApp {
    let env = AppEnv::new(&config);
    let (orchestrations, activities, entities) = apps::register_all_with(&env).unwrap();
    let runtime = Runtime::start_with_options(
        store.clone(),
        StdArc::new(activities),
        orchestrations,
        entities,
        config.runtime.to_options(),
    )
    .await;
    TestApp {
        runtime,
        client: Client::new(store.clone()),
        store,
        faults: env.faults,
    }
}

pub async fn wait_for_history<F>(store: StdArc<dyn Provider>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&Vec<Event>) -> bool,
{
    wait_for_history_event(
        store,
        instance,
        |hist| if predicate(hist) { Some(()) } else { None },
        timeout_ms,
    )
    .await
    .is_some()
}

pub async fn wait_for_subscription(store: StdArc<dyn Provider>, instance: &str, name: &str, timeout_ms: u64) -> bool {
    wait_for_history(
        store,
        instance,
        |hist| {
            hist.iter()
                .any(|e| matches!(&e.kind, EventKind::ExternalSubscribed { name: n } if n == name))
        },
        timeout_ms,
    )
    .await
}

pub async fn wait_for_history_event<T, F>(
    store: StdArc<dyn Provider>,
    instance: &str,
    selector: F,
    timeout_ms: u64,
) -> Option<T>
where
    T: Clone,
    F: Fn(&Vec<Event>) -> Option<T>,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await.unwrap_or_default();
        if let Some(e) = selector(&hist) {
            return Some(e);
        }
        if Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait for a terminal status, panicking on timeout.
pub async fn wait_done(client: &Client, instance: &str, timeout_ms: u64) -> OrchestrationStatus {
    client
        .wait_for_orchestration(instance, Duration::from_millis(timeout_ms))
        .await
        .unwrap_or_else(|e| panic!("{instance} did not finish: {e}"))
}

pub fn count_kind(hist: &[Event], pred: impl Fn(&EventKind) -> bool) -> usize {
    hist.iter().filter(|e| pred(&e.kind)).count()
}

pub async fn create_sqlite_store_disk() -> (StdArc<dyn Provider>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let db_path = td.path().join("test.db");
    std::fs::File::create(&db_path).unwrap();
    let db_url = format!("sqlite:{}", db_path.display());
    let store = StdArc::new(SqliteProvider::new(&db_url, None).await.unwrap()) as StdArc<dyn Provider>;
    (store, td)
}
