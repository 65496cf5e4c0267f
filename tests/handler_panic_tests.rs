//! Panicking activity and entity handlers fail the call without taking down their worker.

use durable_e2e::providers::Provider;
use durable_e2e::providers::in_memory::InMemoryProvider;
use durable_e2e::runtime::{ActivityRegistry, EntityRegistry, OrchestrationRegistry, OrchestrationStatus, Runtime, RuntimeOptions};
use durable_e2e::{Client, EntityContext, EntityId, OrchestrationContext};
use std::sync::Arc;
use std::time::Duration;

fn single_worker_options() -> RuntimeOptions {
    RuntimeOptions {
        dispatcher_idle_sleep_ms: 5,
        worker_concurrency: 1,
        entity_concurrency: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn activity_panic_becomes_failure_and_worker_keeps_running() {
    let activities = ActivityRegistry::builder()
        .register("Explode", |_ctx, input: String| async move {
            if input == "boom" {
                panic!("activity exploded");
            }
            Ok(input)
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("PanickyActivities", |ctx: OrchestrationContext, _input: String| async move {
            let first = ctx.schedule_activity("Explode", "boom").into_activity().await;
            let second = ctx.schedule_activity("Explode", "fine").into_activity().await?;
            Ok(format!("{}|{second}", first.unwrap_err()))
        })
        .build();

    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let rt = Runtime::start_with_options(
        store.clone(),
        Arc::new(activities),
        orchestrations,
        EntityRegistry::builder().build(),
        single_worker_options(),
    )
    .await;
    let client = Client::new(store);
    client.start_orchestration("panic-1", "PanickyActivities", "").await.unwrap();

    let status = client
        .wait_for_orchestration("panic-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "Activity function 'Explode' failed: panicked: activity exploded|fine".to_string()
        }
    );
    rt.shutdown(Some(200)).await;
}

#[tokio::test]
async fn entity_panic_fails_the_call_and_leaves_state_untouched() {
    let entities = EntityRegistry::builder()
        .register("Bomb", |ctx: EntityContext| async move {
            match ctx.operation() {
                "explode" => {
                    ctx.set_state(&1)?;
                    panic!("entity exploded");
                }
                _ => Ok(ctx.get_state::<i64>()?.map_or("empty".to_string(), |v| v.to_string())),
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("PanickyEntity", |ctx: OrchestrationContext, _input: String| async move {
            let bomb = EntityId::new("Bomb", "k");
            let failed = ctx.call_entity(bomb.clone(), "explode", "").into_entity().await;
            let state = ctx
                .call_entity(bomb, "peek", "")
                .into_entity()
                .await
                .map_err(|e| e.to_string())?;
            match failed {
                Ok(_) => Err("explode unexpectedly succeeded".to_string()),
                Err(e) => Ok(format!("{e}|{state}")),
            }
        })
        .build();

    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let rt = Runtime::start_with_options(
        store.clone(),
        Arc::new(ActivityRegistry::builder().build()),
        orchestrations,
        entities,
        single_worker_options(),
    )
    .await;
    let client = Client::new(store);
    client.start_orchestration("panic-2", "PanickyEntity", "").await.unwrap();

    match client
        .wait_for_orchestration("panic-2", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Completed { output } => {
            assert!(output.contains("Operation 'explode' panicked: entity exploded"), "{output}");
            assert!(output.ends_with("|empty"), "{output}");
        }
        other => panic!("unexpected status: {other:?}"),
    }
    rt.shutdown(Some(200)).await;
}
