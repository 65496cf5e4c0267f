mod common;

use common::*;
use durable_e2e::EventKind;
use durable_e2e::apps::hello_cities::HELLO_CITIES;
use durable_e2e::runtime::OrchestrationStatus;

fn cities(output: &str) -> Vec<String> {
    serde_json::from_str(output).unwrap()
}

#[tokio::test]
async fn hello_cities_chains_three_activities() {
    let app = start_app(fast_config()).await;
    app.client.start_orchestration("hc-1", HELLO_CITIES, "").await.unwrap();

    match wait_done(&app.client, "hc-1", 5_000).await {
        OrchestrationStatus::Completed { output } => {
            assert_eq!(cities(&output), vec!["Hello Tokyo!", "Hello Seattle!", "Hello London!"]);
        }
        other => panic!("unexpected status: {other:?}"),
    }

    let hist = app.store.read("hc-1").await.unwrap();
    assert_eq!(count_kind(&hist, |k| matches!(k, EventKind::ActivityScheduled { .. })), 3);
    assert_eq!(count_kind(&hist, |k| matches!(k, EventKind::TimerCreated { .. })), 0);
    app.shutdown().await;
}

#[tokio::test]
async fn scheduled_start_waits_on_a_timer() {
    let app = start_app(fast_config()).await;
    let start_at = (chrono::Utc::now() + chrono::Duration::milliseconds(300)).to_rfc3339();
    app.client.start_orchestration("hc-sched", HELLO_CITIES, start_at).await.unwrap();

    let status = wait_done(&app.client, "hc-sched", 5_000).await;
    assert!(matches!(status, OrchestrationStatus::Completed { .. }), "{status:?}");

    let hist = app.store.read("hc-sched").await.unwrap();
    let timer_pos = hist
        .iter()
        .position(|e| matches!(e.kind, EventKind::TimerFired { .. }))
        .expect("timer fired");
    let first_activity = hist
        .iter()
        .position(|e| matches!(e.kind, EventKind::ActivityScheduled { .. }))
        .expect("activity scheduled");
    assert!(timer_pos < first_activity);
    app.shutdown().await;
}

#[tokio::test]
async fn past_start_time_runs_immediately() {
    let app = start_app(fast_config()).await;
    app.client
        .start_orchestration("hc-past", HELLO_CITIES, "2000-01-01T00:00:00Z")
        .await
        .unwrap();
    let status = wait_done(&app.client, "hc-past", 5_000).await;
    assert!(matches!(status, OrchestrationStatus::Completed { .. }));
    let hist = app.store.read("hc-past").await.unwrap();
    assert_eq!(count_kind(&hist, |k| matches!(k, EventKind::TimerCreated { .. })), 0);
    app.shutdown().await;
}

#[tokio::test]
async fn hello_cities_on_sqlite() {
    let (store, _td) = create_sqlite_store_disk().await;
    let app = start_app_with_store(fast_config(), store).await;
    app.client.start_orchestration("hc-sql", HELLO_CITIES, "").await.unwrap();
    match wait_done(&app.client, "hc-sql", 10_000).await {
        OrchestrationStatus::Completed { output } => assert_eq!(cities(&output).len(), 3),
        other => panic!("unexpected status: {other:?}"),
    }
    app.shutdown().await;
}
